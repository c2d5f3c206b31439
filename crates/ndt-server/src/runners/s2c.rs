//! Server-to-client throughput test.
//!
//! The server writes for `s2c_secs` while the CWND sampler runs, then
//! reports its own measurement and the connection's counter snapshot. The
//! client answers with the throughput it saw, which is what the diagnosis
//! uses.

use std::os::fd::AsRawFd;
use std::time::Duration;

use ndt_diag::{FlowDirection, FlowPair, TcpCounters, TraceFilter};
use ndt_proto::TestKind;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::c2s::{throughput_kbps, OBSERVER_READY_WAIT, OBSERVER_REPORT_WAIT};
use super::mid::is_buffer_clogged;
use super::{filler, PhaseDriver, TestContext, TestError, REPLY_TIMEOUT};
use crate::capture::start_observer;
use crate::control::{ControlChannel, ControlError};
use crate::counters::unsent_bytes;
use crate::listener::{accept_with_retry, ListenOptions};
use crate::sampler::{CwndSampler, SamplerOutcome};

/// Size of each write on the test connection.
pub const WRITE_LEN: usize = 8192;

/// Sent in place of the counter lines when no snapshot could be read.
pub const NO_DATA: &str = "No Data Collected: 000000";

#[derive(Debug, Clone)]
pub struct S2cOutcome {
    /// Throughput measured by the client (kbps).
    pub client_kbps: f64,
    /// Throughput measured at the server (kbps).
    pub server_kbps: f64,
    pub bytes: u64,
    pub unsent: i64,
    pub counters: Option<TcpCounters>,
    pub flow: Option<FlowPair>,
    pub sampler: SamplerOutcome,
    pub snaplog: Option<String>,
}

pub async fn run<S>(ctx: &TestContext, ctl: &mut ControlChannel<S>) -> Result<Option<S2cOutcome>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut phase = PhaseDriver::new(ctl, TestKind::S2c);
    let outcome = exchange(ctx, &mut phase).await;
    phase.conclude(outcome).await
}

async fn exchange<S>(ctx: &TestContext, phase: &mut PhaseDriver<'_, S>) -> Result<S2cOutcome, TestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cfg = &ctx.config;
    let opts = ListenOptions {
        mss: None,
        buffer_size: cfg.tcp_buffer_size,
    };
    let listener = ctx.ports.bind(cfg.ports.s2c, opts).map_err(TestError::Bind)?;
    let port = listener.local_addr().map_err(TestError::Bind)?.port();
    tracing::debug!(port, "S2C listener bound");

    phase.prepare(&port.to_string()).await?;
    let (mut stream, _peer) = accept_with_retry(
        &listener,
        ctx.client_ip,
        cfg.timeouts.connect_wait,
        cfg.timeouts.accept_retries,
    )
    .await?;
    drop(listener);
    let fd = stream.as_raw_fd();

    let filter = TraceFilter {
        server: ctx.server_ip,
        client: ctx.client_ip,
        port,
        direction: FlowDirection::ServerToClient,
    };
    let observer = if cfg.capture.enabled {
        start_observer(ctx.capture.as_ref(), filter, cfg.timeouts.observer_limit, OBSERVER_READY_WAIT).await
    } else {
        None
    };
    let snaplog = ctx.snaplog_path("s2c");
    let sampler = CwndSampler::spawn(ctx.store.clone(), fd, cfg.snap_delay, snaplog.clone());

    phase.start("").await?;
    let started = Instant::now();
    let bytes = write_for(ctx, &mut stream, cfg.durations.s2c).await;
    let elapsed = started.elapsed();
    let sampler = sampler.stop().await;
    phase.stream_done()?;

    let counters = match ctx.store.snapshot(fd) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "no S2C counter snapshot");
            None
        }
    };
    let unsent = unsent_bytes(fd);
    let _ = stream.shutdown().await;
    drop(stream);

    let server_kbps = throughput_kbps(bytes, elapsed.as_secs_f64());
    tracing::info!(server_kbps, bytes, unsent, "S2C stream finished");

    phase
        .send_msg(&format!("{:.0} {} {}", server_kbps, unsent, bytes))
        .await?;
    let lines = counters
        .as_ref()
        .map(TcpCounters::report_lines)
        .unwrap_or_else(|| NO_DATA.to_string());
    phase.send_msg(&lines).await?;

    let reply = phase.recv_msg("S2C throughput", REPLY_TIMEOUT).await?;
    let text = reply.payload_str();
    if text.trim().is_empty() {
        return Err(TestError::protocol(3, "Invalid S2C throughput received"));
    }
    let client_kbps: f64 = text
        .trim()
        .parse()
        .map_err(|_| TestError::protocol(4, "Invalid S2C throughput received"))?;

    phase.finalize().await?;

    let flow = match observer {
        Some(o) => Some(o.finish(OBSERVER_REPORT_WAIT).await),
        None => None,
    };

    Ok(S2cOutcome {
        client_kbps,
        server_kbps,
        bytes,
        unsent,
        counters,
        flow,
        sampler,
        snaplog: snaplog.map(|p| p.display().to_string()),
    })
}

async fn write_for(ctx: &TestContext, stream: &mut TcpStream, duration: Duration) -> u64 {
    let buf = filler(WRITE_LEN);
    let watermark = (WRITE_LEN as i64) << 2;
    let fd = stream.as_raw_fd();
    let deadline = Instant::now() + duration;
    let mut bytes = 0u64;
    while Instant::now() < deadline {
        if ctx.config.avoid_snd_blockup {
            if let Ok(c) = ctx.store.snapshot(fd) {
                if is_buffer_clogged(watermark, &c) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            }
        }
        match tokio::time::timeout_at(deadline, stream.write(&buf)).await {
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "S2C stream ended early");
                break;
            }
            Err(_) => break,
        }
    }
    bytes
}
