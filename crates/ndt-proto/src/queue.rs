//! `SRV_QUEUE` status codes.

use std::fmt;

/// Payload of a `SRV_QUEUE` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Dispatch: tests begin.
    StartNow,
    /// Waiting; value is the position (or estimated wait unit in multi mode).
    Position(u32),
    /// Server fault, session is dropped.
    ServerFault,
    /// Server busy, session is dropped.
    ServerBusy,
    /// Heartbeat; a STATUS-capable client answers with `MSG_WAITING`.
    Heartbeat,
    /// Busy, client should retry later.
    BusyRetryLater,
}

impl QueueStatus {
    pub const FAULT_CODE: u32 = 9977;
    pub const BUSY_CODE: u32 = 9988;
    pub const HEARTBEAT_CODE: u32 = 9990;
    pub const RETRY_LATER_CODE: u32 = 9999;

    pub fn code(self) -> u32 {
        match self {
            QueueStatus::StartNow => 0,
            QueueStatus::Position(n) => n,
            QueueStatus::ServerFault => Self::FAULT_CODE,
            QueueStatus::ServerBusy => Self::BUSY_CODE,
            QueueStatus::Heartbeat => Self::HEARTBEAT_CODE,
            QueueStatus::BusyRetryLater => Self::RETRY_LATER_CODE,
        }
    }

    pub fn payload(self) -> String {
        self.code().to_string()
    }

    pub fn parse(text: &str) -> Option<Self> {
        let code: u32 = text.trim().parse().ok()?;
        Some(match code {
            0 => QueueStatus::StartNow,
            Self::FAULT_CODE => QueueStatus::ServerFault,
            Self::BUSY_CODE => QueueStatus::ServerBusy,
            Self::HEARTBEAT_CODE => QueueStatus::Heartbeat,
            Self::RETRY_LATER_CODE => QueueStatus::BusyRetryLater,
            n => QueueStatus::Position(n),
        })
    }

    /// Session ends after this status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::ServerFault | QueueStatus::ServerBusy | QueueStatus::BusyRetryLater
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
