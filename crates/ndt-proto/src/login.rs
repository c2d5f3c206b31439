//! # Login Negotiation
//!
//! The client opens the session with a `MSG_LOGIN` carrying a single bitmask
//! byte, or a `MSG_EXTENDED_LOGIN` whose first byte is the bitmask and whose
//! remainder is the client version string.
//!
//! ```text
//!  bit:   6     5     4      3     2     1     0
//!       +-----+-----+------+-----+-----+-----+-----+
//!       | EXT |META |STATUS| SFW | S2C | C2S | MID |
//!       +-----+-----+------+-----+-----+-----+-----+
//! ```
//!
//! Tests always run in the fixed order Middlebox, SFW, C2S, S2C, Meta,
//! regardless of bit position.

use serde::Serialize;
use std::fmt;

use crate::error::ProtocolError;
use crate::wire::{Frame, MessageType};

/// Longest client version string kept from an extended login.
pub const MAX_CLIENT_VERSION_LEN: usize = 64;

// ─── Test Suite Bitmask ──────────────────────────────────────────────────────

/// Requested test bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct TestSuite(u8);

impl TestSuite {
    pub const MID: u8 = 1 << 0;
    pub const C2S: u8 = 1 << 1;
    pub const S2C: u8 = 1 << 2;
    pub const SFW: u8 = 1 << 3;
    pub const STATUS: u8 = 1 << 4;
    pub const META: u8 = 1 << 5;
    pub const EXT: u8 = 1 << 6;

    const TESTS: u8 = Self::MID | Self::C2S | Self::S2C | Self::SFW | Self::META;

    pub fn from_bits(bits: u8) -> Self {
        TestSuite(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, kind: TestKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Client answers `SRV_QUEUE` heartbeats with `MSG_WAITING`.
    pub fn status_capable(self) -> bool {
        self.0 & Self::STATUS != 0
    }

    /// At least one runnable test bit is set.
    pub fn has_tests(self) -> bool {
        self.0 & Self::TESTS != 0
    }

    /// Requested tests in execution order.
    pub fn tests(self) -> impl Iterator<Item = TestKind> {
        TestKind::ORDER.into_iter().filter(move |k| self.contains(*k))
    }

    /// Space-separated test ids in execution order, e.g. `"1 8 2 4 32"`.
    pub fn suite_string(self) -> String {
        self.tests()
            .map(|k| k.bit().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ─── Test Kind ───────────────────────────────────────────────────────────────

/// One test phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Mid,
    Sfw,
    C2s,
    S2c,
    Meta,
}

impl TestKind {
    /// Execution order within a session.
    pub const ORDER: [TestKind; 5] = [
        TestKind::Mid,
        TestKind::Sfw,
        TestKind::C2s,
        TestKind::S2c,
        TestKind::Meta,
    ];

    pub fn bit(self) -> u8 {
        match self {
            TestKind::Mid => TestSuite::MID,
            TestKind::Sfw => TestSuite::SFW,
            TestKind::C2s => TestSuite::C2S,
            TestKind::S2c => TestSuite::S2C,
            TestKind::Meta => TestSuite::META,
        }
    }

    /// Name used in client-facing error text.
    pub fn label(self) -> &'static str {
        match self {
            TestKind::Mid => "Middlebox test",
            TestKind::Sfw => "Simple firewall test",
            TestKind::C2s => "C2S throughput test",
            TestKind::S2c => "S2C throughput test",
            TestKind::Meta => "META test",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ─── Login Parsing ───────────────────────────────────────────────────────────

/// A validated login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub suite: TestSuite,
    pub client_version: Option<String>,
    pub extended: bool,
}

/// Validate a login frame.
///
/// The error text of [`ProtocolError::InvalidLogin`] is what the server sends
/// back in `MSG_ERROR`.
pub fn parse_login(frame: &Frame) -> Result<LoginRequest, ProtocolError> {
    let (suite, client_version, extended) = match frame.msg_type {
        MessageType::Login => {
            if frame.payload.len() != 1 {
                return Err(ProtocolError::InvalidLogin("Invalid test request."));
            }
            (TestSuite::from_bits(frame.payload[0]), None, false)
        }
        MessageType::ExtendedLogin => {
            let Some((&bits, rest)) = frame.payload.split_first() else {
                return Err(ProtocolError::InvalidLogin("Invalid test request."));
            };
            let take = rest.len().min(MAX_CLIENT_VERSION_LEN);
            let version = String::from_utf8_lossy(&rest[..take]).trim().to_string();
            let version = (!version.is_empty()).then_some(version);
            (TestSuite::from_bits(bits), version, true)
        }
        _ => return Err(ProtocolError::InvalidLogin("Invalid login message.")),
    };

    if !suite.has_tests() {
        return Err(ProtocolError::InvalidLogin("Invalid test suite request."));
    }

    Ok(LoginRequest {
        suite,
        client_version,
        extended,
    })
}
