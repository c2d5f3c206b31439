//! Middlebox test.
//!
//! Streams MSS-sized segments under a small congestion window, then tells
//! the client which MSS and window scales the server saw so it can spot
//! NATs and MSS clamping.

use std::net::IpAddr;
use std::os::fd::AsRawFd;

use ndt_diag::TcpCounters;
use ndt_proto::TestKind;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::c2s::throughput_kbps;
use super::{filler, PhaseDriver, TestContext, TestError, REPLY_TIMEOUT};
use crate::control::{ControlChannel, ControlError};
use crate::listener::{accept_with_retry, ListenOptions, MIDDLEBOX_MSS};

#[derive(Debug, Clone)]
pub struct MidOutcome {
    /// CWND-limited throughput measured by the client (kbps).
    pub client_kbps: f64,
    /// Throughput measured at the server (kbps).
    pub server_kbps: f64,
    pub bytes: u64,
    pub counters: Option<TcpCounters>,
}

pub async fn run<S>(ctx: &TestContext, ctl: &mut ControlChannel<S>) -> Result<Option<MidOutcome>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut phase = PhaseDriver::new(ctl, TestKind::Mid);
    let outcome = exchange(ctx, &mut phase).await;
    phase.conclude(outcome).await
}

/// Whether the send queue holds more than `watermark` unacknowledged bytes.
pub(crate) fn is_buffer_clogged(watermark: i64, counters: &TcpCounters) -> bool {
    watermark < counters.in_flight() - 1
}

fn display_ip(ip: IpAddr) -> String {
    ip.to_canonical().to_string()
}

/// `"<server>;<client>;<mss>;<wscale sent>;<wscale rcvd>;"`
pub fn result_message(server: IpAddr, client: IpAddr, counters: &TcpCounters) -> String {
    format!(
        "{};{};{};{};{};",
        display_ip(server),
        display_ip(client),
        counters.current_mss,
        counters.win_scale_sent,
        counters.win_scale_rcvd
    )
}

async fn exchange<S>(ctx: &TestContext, phase: &mut PhaseDriver<'_, S>) -> Result<MidOutcome, TestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cfg = &ctx.config;
    let opts = ListenOptions {
        mss: Some(MIDDLEBOX_MSS),
        buffer_size: cfg.tcp_buffer_size,
    };
    let listener = ctx.ports.bind(cfg.ports.middlebox, opts).map_err(TestError::Bind)?;
    let port = listener.local_addr().map_err(TestError::Bind)?.port();
    tracing::debug!(port, "middlebox listener bound");

    phase.prepare(&port.to_string()).await?;
    let (mut stream, peer) = accept_with_retry(
        &listener,
        ctx.client_ip,
        cfg.timeouts.connect_wait,
        cfg.timeouts.accept_retries,
    )
    .await?;
    drop(listener);
    let fd = stream.as_raw_fd();

    let mss = match ctx.store.snapshot(fd) {
        Ok(c) if c.current_mss > 0 => c.current_mss,
        _ => i64::from(MIDDLEBOX_MSS),
    };
    let clamp = u32::try_from(mss * 2).unwrap_or(u32::MAX);
    if let Err(e) = ctx.store.limit_cwnd(fd, clamp) {
        tracing::debug!(error = %e, "cannot clamp middlebox cwnd");
    }

    phase.start("").await?;
    let started = Instant::now();
    let bytes = stream_limited(ctx, &mut stream, mss, cfg.durations.middlebox).await;
    let server_kbps = throughput_kbps(bytes, started.elapsed().as_secs_f64());
    phase.stream_done()?;

    let counters = ctx.store.snapshot(fd).ok();
    let local = stream.local_addr().map(|a| a.ip()).unwrap_or(ctx.server_ip);
    let _ = stream.shutdown().await;
    drop(stream);

    let snapshot = counters.clone().unwrap_or_else(|| TcpCounters {
        current_mss: mss,
        ..TcpCounters::unavailable()
    });
    phase.send_msg(&result_message(local, peer.ip(), &snapshot)).await?;

    let reply = phase.recv_msg("CWND limited throughput", REPLY_TIMEOUT).await?;
    let text = reply.payload_str();
    let client_kbps: f64 = text
        .trim()
        .parse()
        .map_err(|_| TestError::protocol(4, "Invalid CWND limited throughput received"))?;
    tracing::info!(server_kbps, client_kbps, bytes, "middlebox test done");

    phase.finalize().await?;
    Ok(MidOutcome {
        client_kbps,
        server_kbps,
        bytes,
        counters,
    })
}

/// Write MSS-sized buffers until `duration` passes, holding off while the
/// send queue is clogged.
async fn stream_limited(
    ctx: &TestContext,
    stream: &mut TcpStream,
    mss: i64,
    duration: std::time::Duration,
) -> u64 {
    let buf = filler(usize::try_from(mss).unwrap_or(1456));
    let watermark = mss << 4;
    let fd = stream.as_raw_fd();
    let deadline = Instant::now() + duration;
    let mut bytes = 0u64;
    while Instant::now() < deadline {
        if let Ok(c) = ctx.store.snapshot(fd) {
            if is_buffer_clogged(watermark, &c) {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                continue;
            }
        }
        match tokio::time::timeout_at(deadline, stream.write(&buf)).await {
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "middlebox stream ended early");
                break;
            }
            Err(_) => break,
        }
    }
    bytes
}
