//! # NDT Diagnostics
//!
//! Pure computation over what a test session observed:
//!
//! - [`speed`]: the 12-bin link-speed classification
//! - [`classifier`]: packet-pair dispersion over a captured flow
//! - [`report`]: the per-flow histogram report line
//! - [`link`]: resolving a report to a link-speed index
//! - [`counters`]: named TCP-stack counter snapshot
//! - [`cwnd`]: congestion-window peak tracking
//! - [`heuristics`]: throughput, loss and link-type verdicts
//! - [`results`]: `MSG_RESULTS` text blocks
//! - [`stats`]: small running-average helpers
//!
//! Nothing here performs I/O.

pub mod classifier;
pub mod counters;
pub mod cwnd;
pub mod heuristics;
pub mod link;
pub mod report;
pub mod results;
pub mod speed;
pub mod stats;

pub use classifier::{FlowDirection, PacketRecord, PairClassifier, TraceFilter};
pub use counters::TcpCounters;
pub use cwnd::{CwndPeaks, CwndTrend};
pub use heuristics::{diagnose, DiagnosticInput, DiagnosticResult, HeuristicVersion};
pub use link::{LinkSpeeds, resolve_link};
pub use report::{FlowPair, FlowReport};
pub use speed::SpeedBin;
