//! # Test Runners
//!
//! One module per test phase. Every runner follows the same shape:
//!
//! ```text
//!   bind listener ─► PREPARE(port) ─► accept ─► START ─► data ─► TEST_MSG ─► FINALIZE
//! ```
//!
//! [`PhaseDriver`] wraps the control channel with a [`PhaseTracker`] so a
//! runner cannot send data before START or FINALIZE before any data.
//! Failures surface as [`TestError`]; only control-channel failures end the
//! whole session.

pub mod c2s;
pub mod meta;
pub mod mid;
pub mod s2c;
pub mod sfw;

use std::net::IpAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ndt_proto::{Frame, MessageType, PhaseError, PhaseTracker, ProtocolError, SessionId, TestKind};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::capture::CaptureOpener;
use crate::config::ServerConfig;
use crate::control::{ControlChannel, ControlError};
use crate::counters::CounterStore;
use crate::listener::{AcceptError, PortAllocator};

/// How long a runner waits for a client's TEST_MSG reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

/// Printable filler for test streams.
pub(crate) fn filler(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'!' + (i % 93) as u8).collect()
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// What a runner needs from its session.
#[derive(Clone)]
pub struct TestContext {
    pub config: Arc<ServerConfig>,
    pub store: Arc<dyn CounterStore>,
    pub capture: Option<Arc<dyn CaptureOpener>>,
    pub ports: PortAllocator,
    pub session: SessionId,
    /// Local address of the control connection.
    pub server_ip: IpAddr,
    pub client_ip: IpAddr,
    /// Control socket, for counter reads about the control path.
    pub control_fd: Option<RawFd>,
}

impl TestContext {
    /// Snaplog path for a throughput test, when snaplogs are enabled.
    pub fn snaplog_path(&self, test: &str) -> Option<PathBuf> {
        if !self.config.snaplog {
            return None;
        }
        let dir = self.config.log_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        Some(dir.join(format!("{}.{}_snaplog.csv", self.session, test)))
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TestError {
    #[error("CreateListenSocket failed: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Accept(#[from] AcceptError),
    #[error("{message}")]
    Protocol { code: i32, message: String },
    #[error("{0}")]
    Unavailable(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Control(ControlError),
}

impl TestError {
    pub fn protocol(code: i32, message: impl Into<String>) -> Self {
        TestError::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Phase-specific failure code.
    pub fn code(&self) -> i32 {
        match self {
            TestError::Bind(_) | TestError::Unavailable(_) => -1,
            TestError::Accept(e) => e.code(),
            TestError::Protocol { code, .. } => *code,
            TestError::Timeout(_) => -102,
            TestError::Phase(_) => 2,
            TestError::Control(_) => 1,
        }
    }

    /// The control connection is unusable; the session cannot continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, TestError::Control(_))
    }

    /// Text sent to the client in `MSG_ERROR`.
    pub fn client_message(&self, kind: TestKind) -> String {
        format!("Server ({}): {}", kind.label(), self)
    }

    /// Map a failed control receive. `what` names the expected message in
    /// the client-facing text.
    fn from_recv(e: ControlError, what: &str) -> Self {
        match e {
            ControlError::Timeout(_) => TestError::protocol(1, format!("No {} received", what)),
            ControlError::Protocol(ProtocolError::UnexpectedType { .. })
            | ControlError::Protocol(ProtocolError::PeerError(_)) => {
                TestError::protocol(2, format!("Invalid {} received", what))
            }
            other => TestError::Control(other),
        }
    }
}

// ─── Phase driver ────────────────────────────────────────────────────────────

/// Control-channel I/O for one test phase, checked against the phase state
/// machine.
pub struct PhaseDriver<'a, S> {
    ctl: &'a mut ControlChannel<S>,
    tracker: PhaseTracker,
}

impl<'a, S> PhaseDriver<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ctl: &'a mut ControlChannel<S>, kind: TestKind) -> Self {
        PhaseDriver {
            ctl,
            tracker: PhaseTracker::new(kind),
        }
    }

    pub fn kind(&self) -> TestKind {
        self.tracker.kind()
    }

    pub fn tracker(&self) -> &PhaseTracker {
        &self.tracker
    }

    pub async fn prepare(&mut self, payload: &str) -> Result<(), TestError> {
        self.tracker.prepare()?;
        self.send(MessageType::TestPrepare, payload).await
    }

    pub async fn start(&mut self, payload: &str) -> Result<(), TestError> {
        self.tracker.start()?;
        self.send(MessageType::TestStart, payload).await
    }

    /// Record the test stream itself as a data event.
    pub fn stream_done(&mut self) -> Result<(), TestError> {
        self.tracker.data()?;
        Ok(())
    }

    pub async fn send_msg(&mut self, text: &str) -> Result<(), TestError> {
        self.tracker.data()?;
        self.send(MessageType::TestMsg, text).await
    }

    /// Receive a client TEST_MSG as a data event.
    pub async fn recv_msg(&mut self, what: &str, timeout: Duration) -> Result<Frame, TestError> {
        let frame = self.recv_test_msg(what, timeout).await?;
        self.tracker.data()?;
        Ok(frame)
    }

    /// Receive the client's reply to PREPARE. Not a data event.
    pub async fn recv_prepare_ack(&mut self, what: &str, timeout: Duration) -> Result<Frame, TestError> {
        self.recv_test_msg(what, timeout).await
    }

    pub async fn finalize(&mut self) -> Result<(), TestError> {
        self.tracker.finalize()?;
        self.send(MessageType::TestFinalize, "").await
    }

    /// Report a failure to the client and mark the phase aborted. Sending is
    /// skipped when the control channel itself failed.
    pub async fn fail(&mut self, err: &TestError) {
        self.tracker.abort();
        tracing::warn!(test = %self.kind(), code = err.code(), error = %err, "test phase failed");
        if err.is_session_fatal() {
            return;
        }
        let text = err.client_message(self.kind());
        if let Err(e) = self.ctl.send_error(&text).await {
            tracing::debug!(error = %e, "could not report phase failure");
        }
    }

    /// Close out the phase with the runner's outcome. A phase failure is
    /// reported and yields `Ok(None)`; a control failure ends the session.
    pub async fn conclude<T>(&mut self, outcome: Result<T, TestError>) -> Result<Option<T>, ControlError> {
        match outcome {
            Ok(v) => {
                tracing::info!(test = %self.kind(), "test phase finished");
                Ok(Some(v))
            }
            Err(TestError::Control(e)) => {
                self.tracker.abort();
                Err(e)
            }
            Err(e) => {
                self.fail(&e).await;
                Ok(None)
            }
        }
    }

    pub fn control(&mut self) -> &mut ControlChannel<S> {
        self.ctl
    }

    async fn send(&mut self, msg_type: MessageType, payload: &str) -> Result<(), TestError> {
        self.ctl
            .send_text(msg_type, payload)
            .await
            .map_err(TestError::Control)
    }

    async fn recv_test_msg(&mut self, what: &str, timeout: Duration) -> Result<Frame, TestError> {
        self.ctl
            .recv_expect(MessageType::TestMsg, timeout)
            .await
            .map_err(|e| TestError::from_recv(e, what))
    }
}
