//! # NDT Control Protocol
//!
//! Everything that travels over the control connection between a diagnostic
//! client and the server:
//!
//! - [`wire`]: `[type][len BE16][payload]` framing and message type codes
//! - [`login`]: the test-suite bitmask and login negotiation
//! - [`queue`]: `SRV_QUEUE` status codes sent while a client waits
//! - [`phase`]: the per-test-phase sequencing state machine
//! - [`ids`]: session identifiers
//! - [`error`]: wire and protocol error types
//!
//! The crate is I/O free. The server drives these types over tokio sockets.

pub mod error;
pub mod ids;
pub mod login;
pub mod phase;
pub mod queue;
pub mod wire;

pub use error::{PhaseError, ProtocolError, WireError};
pub use ids::SessionId;
pub use login::{LoginRequest, TestKind, TestSuite};
pub use phase::{PhaseState, PhaseTracker};
pub use queue::QueueStatus;
pub use wire::{expect_type, Frame, MessageType};

/// Version string announced to clients after dispatch.
pub const SERVER_VERSION: &str = "3.7.0";
