//! # Session Worker
//!
//! Runs one admitted client from dispatch to logout:
//!
//! ```text
//!   SRV_QUEUE "0" ─► MSG_LOGIN "v3.7.0" ─► MSG_LOGIN "<suite>"
//!        ─► Middlebox ─► SFW ─► C2S ─► S2C ─► Meta      (requested ones only)
//!        ─► diagnose ─► MSG_RESULTS ×6 ─► MSG_LOGOUT ─► records
//! ```
//!
//! A failed phase is reported and skipped. A control-channel failure, the
//! session deadline, or a cancel from the scheduler ends the session. The
//! closing notice goes out after any frame the cancelled work left half
//! written (see [`ControlChannel`]).

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ndt_diag::results::{result_blocks, ResultContext};
use ndt_diag::{diagnose, CwndPeaks, DiagnosticInput, DiagnosticResult, LinkSpeeds, TcpCounters};
use ndt_proto::{LoginRequest, MessageType, QueueStatus, SessionId, TestKind, SERVER_VERSION};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::capture::CaptureOpener;
use crate::config::ServerConfig;
use crate::control::{ControlChannel, ControlError};
use crate::counters::CounterStore;
use crate::listener::PortAllocator;
use crate::record::{summary_text, MetaRecord, RecordSink, Summary};
use crate::runners::c2s::C2sOutcome;
use crate::runners::meta::ClientMeta;
use crate::runners::mid::MidOutcome;
use crate::runners::s2c::S2cOutcome;
use crate::runners::sfw::SfwOutcome;
use crate::runners::{c2s, meta, mid, s2c, sfw, TestContext};

/// Bound on delivering the closing notice to a cancelled or expired session.
const NOTICE_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("session exceeded its {0:?} deadline")]
    Deadline(Duration),
    #[error("session cancelled by scheduler ({0})")]
    Cancelled(QueueStatus),
}

/// Shared collaborators every session uses.
#[derive(Clone)]
pub struct SessionEnv {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn CounterStore>,
    pub capture: Option<Arc<dyn CaptureOpener>>,
    pub ports: PortAllocator,
    pub records: Option<RecordSink>,
}

/// Addresses of the control connection.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub server_ip: IpAddr,
    pub client_ip: IpAddr,
    pub control_fd: Option<RawFd>,
}

/// Everything the phases produced.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub mid: Option<MidOutcome>,
    pub sfw: Option<SfwOutcome>,
    pub c2s: Option<C2sOutcome>,
    pub s2c: Option<S2cOutcome>,
    pub meta: Option<ClientMeta>,
    /// Phases that were requested but failed.
    pub failed: Vec<TestKind>,
    pub result: Option<DiagnosticResult>,
}

impl SessionReport {
    fn record(&mut self, kind: TestKind, ran: bool) {
        if !ran {
            self.failed.push(kind);
        }
    }
}

/// Resolves once the scheduler asks this session to stop.
async fn cancelled(rx: &mut watch::Receiver<Option<QueueStatus>>) -> QueueStatus {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(status) = current {
            return status;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run a dispatched session to completion.
pub async fn run<S>(
    env: &SessionEnv,
    id: SessionId,
    login: LoginRequest,
    mut ctl: ControlChannel<S>,
    ends: Endpoints,
    mut cancel: watch::Receiver<Option<QueueStatus>>,
) -> Result<SessionReport, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Utc::now();
    let ctx = TestContext {
        config: env.config.clone(),
        store: env.store.clone(),
        capture: env.capture.clone(),
        ports: env.ports.clone(),
        session: id.clone(),
        server_ip: ends.server_ip,
        client_ip: ends.client_ip,
        control_fd: ends.control_fd,
    };
    let deadline = env.config.timeouts.session;

    let outcome = tokio::select! {
        res = tokio::time::timeout(deadline, drive(&ctx, &mut ctl, &login)) => match res {
            Ok(r) => r.map_err(SessionError::from),
            Err(_) => Err(SessionError::Deadline(deadline)),
        },
        status = cancelled(&mut cancel) => Err(SessionError::Cancelled(status)),
    };

    let report = match outcome {
        Ok(report) => report,
        Err(SessionError::Cancelled(status)) => {
            let _ = tokio::time::timeout(NOTICE_WAIT, ctl.send_queue(status)).await;
            return Err(SessionError::Cancelled(status));
        }
        Err(SessionError::Deadline(d)) => {
            tracing::warn!(deadline = ?d, "session deadline passed");
            let _ = tokio::time::timeout(NOTICE_WAIT, ctl.send_error("Server: session timed out")).await;
            return Err(SessionError::Deadline(d));
        }
        Err(e) => return Err(e),
    };

    if let Some(sink) = &env.records {
        write_records(sink, &id, started, &ends, &login, &report, &env.config).await;
    }
    Ok(report)
}

async fn drive<S>(ctx: &TestContext, ctl: &mut ControlChannel<S>, login: &LoginRequest) -> Result<SessionReport, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    ctl.send_queue(QueueStatus::StartNow).await?;
    ctl.send_text(MessageType::Login, &format!("v{}", SERVER_VERSION)).await?;
    ctl.send_text(MessageType::Login, &login.suite.suite_string()).await?;
    tracing::info!(suite = %login.suite.suite_string(), "session dispatched");

    let mut report = SessionReport::default();
    for kind in login.suite.tests() {
        match kind {
            TestKind::Mid => {
                report.mid = mid::run(ctx, ctl).await?;
                report.record(kind, report.mid.is_some());
            }
            TestKind::Sfw => {
                report.sfw = sfw::run(ctx, ctl).await?;
                report.record(kind, report.sfw.is_some());
            }
            TestKind::C2s => {
                report.c2s = c2s::run(ctx, ctl).await?;
                report.record(kind, report.c2s.is_some());
            }
            TestKind::S2c => {
                report.s2c = s2c::run(ctx, ctl).await?;
                report.record(kind, report.s2c.is_some());
            }
            TestKind::Meta => {
                report.meta = meta::run(ctx, ctl).await?;
                report.record(kind, report.meta.is_some());
            }
        }
    }

    let result = diagnose(&diagnostic_input(&report, &ctx.config));
    for block in result_blocks(&result, &result_context(&report)) {
        ctl.send_text(MessageType::Results, &block).await?;
    }
    ctl.send_text(MessageType::Logout, "").await?;
    tracing::info!(
        link = result.link,
        mismatch = result.mismatch,
        congestion = result.congestion,
        failed = report.failed.len(),
        "session complete"
    );
    report.result = Some(result);
    Ok(report)
}

fn s2c_counters(report: &SessionReport) -> TcpCounters {
    report
        .s2c
        .as_ref()
        .and_then(|s| s.counters.clone())
        .unwrap_or_else(TcpCounters::unavailable)
}

pub fn diagnostic_input(report: &SessionReport, cfg: &ServerConfig) -> DiagnosticInput {
    DiagnosticInput {
        counters: s2c_counters(report),
        c2s_kbps: report.c2s.as_ref().map_or(0.0, |c| c.kbps),
        s2c_kbps: report.s2c.as_ref().map_or(0.0, |s| s.client_kbps),
        mid_kbps: report.mid.as_ref().map_or(0.0, |m| m.client_kbps),
        links: LinkSpeeds::resolve(
            report.c2s.as_ref().and_then(|c| c.flow.as_ref()),
            report.s2c.as_ref().and_then(|s| s.flow.as_ref()),
        ),
        multiple: cfg.multiple,
        version: cfg.heuristic_version,
    }
}

fn result_context(report: &SessionReport) -> ResultContext {
    ResultContext {
        sndbuf: s2c_counters(report).sndbuf,
        mid_kbps: report.mid.as_ref().map_or(0.0, |m| m.client_kbps),
        aspd: 0.0,
        peaks: report
            .s2c
            .as_ref()
            .map_or_else(CwndPeaks::new, |s| s.sampler.peaks),
    }
}

/// Window increase/decrease/unchanged counts for the summary line.
fn window_changes(report: &SessionReport, cwnd_decrease: bool) -> (i64, i64, i64) {
    let Some(s2c) = &report.s2c else {
        return (0, 0, 0);
    };
    if cwnd_decrease {
        let t = s2c.sampler.trend;
        return (t.increases as i64, t.decreases as i64, t.unchanged as i64);
    }
    match &s2c.flow {
        Some(pair) => (pair.ack.window_inc, pair.ack.window_dec, pair.ack.window_same),
        None => (0, 0, 0),
    }
}

async fn write_records(
    sink: &RecordSink,
    id: &SessionId,
    started: chrono::DateTime<Utc>,
    ends: &Endpoints,
    login: &LoginRequest,
    report: &SessionReport,
    cfg: &ServerConfig,
) {
    let Some(result) = &report.result else {
        return;
    };
    let c2s_kbps = report.c2s.as_ref().map_or(0.0, |c| c.kbps);
    let s2c_kbps = report.s2c.as_ref().map_or(0.0, |s| s.client_kbps);

    let mut rec = MetaRecord::new(id.as_str(), started, ends.client_ip, ends.server_ip);
    rec.client_version = login.client_version.clone();
    if let Some(meta) = report.meta.clone() {
        rec.merge_client(meta);
    }
    rec.c2s_snaplog = report.c2s.as_ref().and_then(|c| c.snaplog.clone());
    rec.s2c_snaplog = report.s2c.as_ref().and_then(|s| s.snaplog.clone());
    rec.summary = summary_text(c2s_kbps, s2c_kbps, result);
    if let Err(e) = sink.write_meta(&rec).await {
        tracing::warn!(error = %e, "failed to write meta record");
    }

    let counters = s2c_counters(report);
    let summary = Summary {
        date: started,
        client_ip: ends.client_ip,
        c2s_kbps,
        s2c_kbps,
        mid_kbps: report.mid.as_ref().map_or(0.0, |m| m.client_kbps),
        counters: &counters,
        result,
        window_changes: window_changes(report, cfg.cwnd_decrease),
    };
    if let Err(e) = sink.write_summary(&summary).await {
        tracing::warn!(error = %e, "failed to write summary line");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::FixedCounterStore;
    use ndt_proto::{QueueStatus, TestSuite};

    const WAIT: Duration = Duration::from_secs(2);

    fn env(records: Option<RecordSink>) -> SessionEnv {
        env_with(records, "bind_addr = \"127.0.0.1\"")
    }

    fn env_with(records: Option<RecordSink>, toml: &str) -> SessionEnv {
        let config = Arc::new(ServerConfig::from_toml_str(toml).unwrap());
        SessionEnv {
            ports: PortAllocator::new(&config),
            config,
            store: Arc::new(FixedCounterStore::new(TcpCounters::unavailable())),
            capture: None,
            records,
        }
    }

    fn ends() -> Endpoints {
        Endpoints {
            server_ip: "127.0.0.1".parse().unwrap(),
            client_ip: "127.0.0.1".parse().unwrap(),
            control_fd: None,
        }
    }

    fn login(bits: u8) -> LoginRequest {
        LoginRequest {
            suite: TestSuite::from_bits(bits),
            client_version: Some("v3.7.0".into()),
            extended: true,
        }
    }

    #[tokio::test]
    async fn meta_only_session_sends_results_then_logout() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(Some(RecordSink::new(dir.path())));
        let (a, b) = tokio::io::duplex(8192);
        let (_cancel_tx, cancel_rx) = watch::channel(None);

        let server = tokio::spawn(async move {
            run(&env, SessionId::new(), login(TestSuite::META), ControlChannel::new(a), ends(), cancel_rx).await
        });

        let mut client = ControlChannel::new(b);
        let f = client.recv_expect(MessageType::SrvQueue, WAIT).await.unwrap();
        assert_eq!(QueueStatus::parse(&f.payload_str()), Some(QueueStatus::StartNow));
        let f = client.recv_expect(MessageType::Login, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "v3.7.0");
        let f = client.recv_expect(MessageType::Login, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "32");

        client.recv_expect(MessageType::TestPrepare, WAIT).await.unwrap();
        client.recv_expect(MessageType::TestStart, WAIT).await.unwrap();
        client.send_text(MessageType::TestMsg, "os:Linux").await.unwrap();
        client.send_text(MessageType::TestMsg, "browser:-").await.unwrap();
        client.send_text(MessageType::TestMsg, "").await.unwrap();
        client.recv_expect(MessageType::TestFinalize, WAIT).await.unwrap();

        for _ in 0..6 {
            client.recv_expect(MessageType::Results, WAIT).await.unwrap();
        }
        client.recv_expect(MessageType::Logout, WAIT).await.unwrap();

        let report = server.await.unwrap().unwrap();
        let meta = report.meta.unwrap();
        assert_eq!(meta.os.as_deref(), Some("Linux"));
        assert_eq!(meta.browser.as_deref(), Some("-"));
        assert!(report.failed.is_empty());

        let text = std::fs::read_to_string(dir.path().join(crate::record::META_FILE)).unwrap();
        assert!(text.contains("\"client_os\":\"Linux\""));
    }

    #[tokio::test]
    async fn meta_frame_without_separator_fails_only_that_phase() {
        let env = env(None);
        let (a, b) = tokio::io::duplex(8192);
        let (_cancel_tx, cancel_rx) = watch::channel(None);
        let server = tokio::spawn(async move {
            run(&env, SessionId::new(), login(TestSuite::META), ControlChannel::new(a), ends(), cancel_rx).await
        });

        let mut client = ControlChannel::new(b);
        for _ in 0..3 {
            client.recv(WAIT).await.unwrap();
        }
        client.recv_expect(MessageType::TestPrepare, WAIT).await.unwrap();
        client.recv_expect(MessageType::TestStart, WAIT).await.unwrap();
        client.send_text(MessageType::TestMsg, "no separator").await.unwrap();
        let f = client.recv(WAIT).await.unwrap();
        assert_eq!(f.msg_type, MessageType::Error);
        assert_eq!(f.payload_str(), "Server (META test): Invalid meta data received");
        for _ in 0..6 {
            client.recv_expect(MessageType::Results, WAIT).await.unwrap();
        }
        client.recv_expect(MessageType::Logout, WAIT).await.unwrap();

        let report = server.await.unwrap().unwrap();
        assert_eq!(report.failed, vec![TestKind::Meta]);
    }

    #[tokio::test]
    async fn cancel_sends_status_to_client() {
        let env = env(None);
        let (a, b) = tokio::io::duplex(8192);
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let server = tokio::spawn(async move {
            run(&env, SessionId::new(), login(TestSuite::META), ControlChannel::new(a), ends(), cancel_rx).await
        });

        let mut client = ControlChannel::new(b);
        for _ in 0..5 {
            client.recv(WAIT).await.unwrap();
        }
        cancel_tx.send(Some(QueueStatus::ServerBusy)).unwrap();
        let f = client.recv_expect(MessageType::SrvQueue, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "9988");
        assert!(matches!(
            server.await.unwrap(),
            Err(SessionError::Cancelled(QueueStatus::ServerBusy))
        ));
    }

    #[tokio::test]
    async fn cancel_during_blocked_write_keeps_frames_whole() {
        let env = env(None);
        // Too small for the second bootstrap frame while nobody reads.
        let (a, b) = tokio::io::duplex(8);
        let (cancel_tx, cancel_rx) = watch::channel(None);
        let server = tokio::spawn(async move {
            run(&env, SessionId::new(), login(TestSuite::META), ControlChannel::new(a), ends(), cancel_rx).await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel_tx.send(Some(QueueStatus::ServerFault)).unwrap();

        let mut client = ControlChannel::new(b);
        let f = client.recv_expect(MessageType::SrvQueue, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "0");
        let f = client.recv_expect(MessageType::Login, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "v3.7.0");
        let f = client.recv_expect(MessageType::SrvQueue, WAIT).await.unwrap();
        assert_eq!(f.payload_str(), "9977");
        assert!(matches!(
            server.await.unwrap(),
            Err(SessionError::Cancelled(QueueStatus::ServerFault))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_sends_timeout_error() {
        let env = env_with(None, "bind_addr = \"127.0.0.1\"\n[timeouts]\nsession_secs = 1\n");
        let (a, b) = tokio::io::duplex(8192);
        let (_cancel_tx, cancel_rx) = watch::channel(None);
        let server = tokio::spawn(async move {
            run(&env, SessionId::new(), login(TestSuite::META), ControlChannel::new(a), ends(), cancel_rx).await
        });

        let mut client = ControlChannel::new(b);
        for _ in 0..3 {
            client.recv(WAIT).await.unwrap();
        }
        client.recv_expect(MessageType::TestPrepare, WAIT).await.unwrap();
        client.recv_expect(MessageType::TestStart, WAIT).await.unwrap();

        // The client goes quiet; the one-second deadline fires first.
        let f = client.recv(Duration::from_secs(10)).await.unwrap();
        assert_eq!(f.msg_type, MessageType::Error);
        assert_eq!(f.payload_str(), "Server: session timed out");
        assert!(matches!(server.await.unwrap(), Err(SessionError::Deadline(_))));
    }
}
