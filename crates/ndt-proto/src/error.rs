//! Error types for framing and protocol sequencing.

use thiserror::Error;

use crate::phase::PhaseState;
use crate::wire::MessageType;

/// Framing-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("payload of {0} bytes exceeds the 65535 byte frame limit")]
    PayloadTooLarge(usize),
    #[error("declared payload length {declared} exceeds receive buffer of {limit} bytes")]
    ExceedsBuffer { declared: usize, limit: usize },
    #[error("unknown message type byte {0}")]
    UnknownType(u8),
    #[error("truncated frame header")]
    Truncated,
}

/// Violations of the per-phase ordering rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    #[error("cannot {action} while phase is {state}")]
    OutOfOrder {
        action: &'static str,
        state: PhaseState,
    },
    #[error("phase already finalized")]
    AlreadyFinalized,
}

/// Protocol-level failures on a received frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("expected {expected}, received {received}")]
    UnexpectedType {
        expected: MessageType,
        received: MessageType,
    },
    /// The peer sent `MSG_ERROR`; carries its explanation.
    #[error("peer reported error: {0}")]
    PeerError(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Login rejected; the text is sent back to the client verbatim.
    #[error("{0}")]
    InvalidLogin(&'static str),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
