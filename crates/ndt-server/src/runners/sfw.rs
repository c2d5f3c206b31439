//! Simple firewall test.
//!
//! Both directions race at once: the client connects to a fresh server
//! listener while the server connects out to a listener the client opened.
//! Only the inbound half is judged here; the client judges the other.

use std::net::SocketAddr;
use std::time::Duration;

use ndt_proto::{Frame, MessageType, TestKind};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::{PhaseDriver, TestContext, TestError, REPLY_TIMEOUT};
use crate::control::{ControlChannel, ControlError};
use crate::listener::ListenOptions;

pub const SFW_MESSAGE: &str = "Simple firewall test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SfwResult {
    NotTested = 0,
    NoFirewall = 1,
    Unknown = 2,
    Possible = 3,
}

impl SfwResult {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SfwOutcome {
    /// Client-to-server direction, judged by the server.
    pub inbound: SfwResult,
    /// Whether the server's own connect to the client succeeded.
    pub outbound_connected: bool,
    pub test_time_secs: u64,
}

/// Seconds to wait in each direction, from the control path's worst RTT or
/// RTO in milliseconds.
pub fn test_time_secs(max_rtt_ms: i64, max_rto_ms: i64) -> u64 {
    let worst = max_rtt_ms.max(max_rto_ms);
    if worst as f64 / 1000.0 > 3.0 {
        3
    } else {
        1
    }
}

pub async fn run<S>(ctx: &TestContext, ctl: &mut ControlChannel<S>) -> Result<Option<SfwOutcome>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut phase = PhaseDriver::new(ctl, TestKind::Sfw);
    let outcome = exchange(ctx, &mut phase).await;
    phase.conclude(outcome).await
}

async fn exchange<S>(ctx: &TestContext, phase: &mut PhaseDriver<'_, S>) -> Result<SfwOutcome, TestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let opts = ListenOptions {
        mss: None,
        buffer_size: ctx.config.tcp_buffer_size,
    };
    let listener = crate::listener::bind_listener(SocketAddr::new(ctx.config.bind_addr, 0), opts)
        .map_err(TestError::Bind)?;
    let port = listener.local_addr().map_err(TestError::Bind)?.port();

    let control = ctx
        .control_fd
        .ok_or(TestError::Unavailable("Cannot find connection"))
        .and_then(|fd| {
            ctx.store
                .snapshot(fd)
                .map_err(|_| TestError::Unavailable("Cannot find connection"))
        })?;
    let secs = test_time_secs(control.max_rtt, control.max_rto);
    let test_time = Duration::from_secs(secs);
    tracing::debug!(port, test_time = secs, "firewall listener bound");

    phase.prepare(&format!("{} {}", port, secs)).await?;

    let invalid_port = |code| TestError::protocol(code, "Invalid port number received");
    let ack = phase
        .recv_prepare_ack("port number", REPLY_TIMEOUT)
        .await
        .map_err(|e| match e {
            TestError::Protocol { code, .. } => invalid_port(code),
            other => other,
        })?;
    let text = ack.payload_str();
    if text.is_empty() {
        return Err(invalid_port(3));
    }
    let client_port: u16 = text.trim().parse().map_err(|_| invalid_port(4))?;
    let target = SocketAddr::new(ctx.client_ip, client_port);

    phase.start("").await?;

    let outbound = tokio::spawn(connect_out(target, test_time));
    let inbound = judge_inbound(&listener, test_time).await;
    drop(listener);
    tracing::info!(result = ?inbound, "firewall test inbound result");

    phase.send_msg(&inbound.code().to_string()).await?;
    let outbound_connected = outbound.await.unwrap_or(false);
    phase.finalize().await?;

    Ok(SfwOutcome {
        inbound,
        outbound_connected,
        test_time_secs: secs,
    })
}

/// Connect to the client's listener and send the probe message.
async fn connect_out(target: SocketAddr, test_time: Duration) -> bool {
    let attempt = async {
        let stream = TcpStream::connect(target).await?;
        let mut ch = ControlChannel::new(stream);
        ch.send(&Frame::text(MessageType::TestMsg, SFW_MESSAGE))
            .await
            .map_err(std::io::Error::other)
    };
    match tokio::time::timeout(test_time, attempt).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(%target, error = %e, "outbound firewall probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(%target, "outbound firewall probe timed out");
            false
        }
    }
}

/// Wait for the client's probe connection and check its message.
async fn judge_inbound(listener: &tokio::net::TcpListener, test_time: Duration) -> SfwResult {
    let stream = match tokio::time::timeout(test_time, listener.accept()).await {
        Err(_) => {
            tracing::info!(secs = test_time.as_secs(), "no firewall probe connection");
            return SfwResult::Possible;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "firewall probe accept failed");
            return SfwResult::Unknown;
        }
        Ok(Ok((stream, _))) => stream,
    };
    let mut ch = ControlChannel::with_limit(stream, 64);
    match ch.recv(REPLY_TIMEOUT).await {
        Ok(f) if f.msg_type == MessageType::TestMsg && f.payload.as_ref() == SFW_MESSAGE.as_bytes() => {
            SfwResult::NoFirewall
        }
        Ok(f) => {
            tracing::debug!(msg = %f.msg_type, len = f.payload.len(), "improper firewall probe");
            SfwResult::Unknown
        }
        Err(e) => {
            tracing::debug!(error = %e, "unreadable firewall probe");
            SfwResult::Unknown
        }
    }
}
