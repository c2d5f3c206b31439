//! Client-to-server throughput test.

use std::os::fd::AsRawFd;
use std::time::Duration;

use ndt_diag::{FlowDirection, FlowPair, TraceFilter};
use ndt_proto::TestKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::Instant;

use super::{PhaseDriver, TestContext, TestError};
use crate::capture::start_observer;
use crate::control::{ControlChannel, ControlError};
use crate::listener::{accept_with_retry, ListenOptions};
use crate::sampler::{CwndSampler, SamplerOutcome};

const READ_BUF: usize = 8192;
pub(crate) const OBSERVER_READY_WAIT: Duration = Duration::from_secs(2);
pub(crate) const OBSERVER_REPORT_WAIT: Duration = Duration::from_millis(1100);

#[derive(Debug, Clone)]
pub struct C2sOutcome {
    pub kbps: f64,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Packet-pair reports; `None` when capture is off.
    pub flow: Option<FlowPair>,
    pub sampler: Option<SamplerOutcome>,
    pub snaplog: Option<String>,
}

pub async fn run<S>(ctx: &TestContext, ctl: &mut ControlChannel<S>) -> Result<Option<C2sOutcome>, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut phase = PhaseDriver::new(ctl, TestKind::C2s);
    let outcome = exchange(ctx, &mut phase).await;
    phase.conclude(outcome).await
}

/// kbps from a byte count over `secs`.
pub fn throughput_kbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    8e-3 * bytes as f64 / secs
}

async fn exchange<S>(ctx: &TestContext, phase: &mut PhaseDriver<'_, S>) -> Result<C2sOutcome, TestError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let cfg = &ctx.config;
    let opts = ListenOptions {
        mss: None,
        buffer_size: cfg.tcp_buffer_size,
    };
    let listener = ctx.ports.bind(cfg.ports.c2s, opts).map_err(TestError::Bind)?;
    let port = listener.local_addr().map_err(TestError::Bind)?.port();
    tracing::debug!(port, "C2S listener bound");

    phase.prepare(&port.to_string()).await?;
    let (mut stream, _peer) = accept_with_retry(
        &listener,
        ctx.client_ip,
        cfg.timeouts.connect_wait,
        cfg.timeouts.accept_retries,
    )
    .await?;
    drop(listener);

    let filter = TraceFilter {
        server: ctx.server_ip,
        client: ctx.client_ip,
        port,
        direction: FlowDirection::ClientToServer,
    };
    let observer = if cfg.capture.enabled {
        start_observer(ctx.capture.as_ref(), filter, cfg.timeouts.observer_limit, OBSERVER_READY_WAIT).await
    } else {
        None
    };
    let snaplog = ctx.snaplog_path("c2s");
    let sampler = snaplog.as_ref().map(|path| {
        CwndSampler::spawn(
            ctx.store.clone(),
            stream.as_raw_fd(),
            cfg.snap_delay,
            Some(path.clone()),
        )
    });

    phase.start("").await?;

    let started = Instant::now();
    let deadline = started + cfg.durations.c2s + Duration::from_secs(1);
    let mut buf = vec![0u8; READ_BUF];
    let mut bytes = 0u64;
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => bytes += n as u64,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "C2S stream read failed");
                break;
            }
            Err(_) => {
                tracing::debug!("C2S read window elapsed");
                break;
            }
        }
    }
    let elapsed = started.elapsed();
    // The sampler reads the socket's fd; stop it before the socket closes.
    let sampler = match sampler {
        Some(s) => Some(s.stop().await),
        None => None,
    };
    drop(stream);
    let kbps = throughput_kbps(bytes, elapsed.as_secs_f64());
    tracing::info!(kbps, bytes, secs = elapsed.as_secs_f64(), "C2S throughput measured");
    phase.stream_done()?;

    phase.send_msg(&format!("{:.0}", kbps)).await?;
    phase.finalize().await?;

    let flow = match observer {
        Some(o) => Some(o.finish(OBSERVER_REPORT_WAIT).await),
        None => None,
    };

    Ok(C2sOutcome {
        kbps,
        bytes,
        elapsed,
        flow,
        sampler,
        snaplog: snaplog.map(|p| p.display().to_string()),
    })
}
