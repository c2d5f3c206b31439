//! # Test Phase Sequencing
//!
//! Every test phase walks the same path on the control connection:
//!
//! ```text
//!  ┌─────────────┐ PREPARE ┌──────────────┐ START ┌────────────┐
//!  │ NOT_STARTED ├────────►│ PREPARE_SENT ├──────►│ START_SENT │
//!  └─────────────┘         └──────────────┘       └─────┬──────┘
//!                                                       │ DATA
//!                             ┌───────────┐  FINALIZE ┌─▼─────────────┐
//!                             │ FINALIZED │◄──────────┤ DATA_EXCHANGE │◄─┐
//!                             └───────────┘           └───────┬───────┘  │
//!                                                             └──────────┘
//! ```
//!
//! A phase that fails anywhere along the way moves to `ABORTED`.

use std::fmt;

use crate::error::PhaseError;
use crate::login::TestKind;

/// Position of one phase in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    NotStarted,
    PrepareSent,
    StartSent,
    DataExchange,
    Finalized,
    Aborted,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseState::NotStarted => "NOT_STARTED",
            PhaseState::PrepareSent => "PREPARE_SENT",
            PhaseState::StartSent => "START_SENT",
            PhaseState::DataExchange => "DATA_EXCHANGE",
            PhaseState::Finalized => "FINALIZED",
            PhaseState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Guards the order of control messages within one phase.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    kind: TestKind,
    state: PhaseState,
    data_events: u32,
}

impl PhaseTracker {
    pub fn new(kind: TestKind) -> Self {
        PhaseTracker {
            kind,
            state: PhaseState::NotStarted,
            data_events: 0,
        }
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn state(&self) -> PhaseState {
        self.state
    }

    pub fn data_events(&self) -> u32 {
        self.data_events
    }

    pub fn prepare(&mut self) -> Result<(), PhaseError> {
        self.advance("send PREPARE", PhaseState::NotStarted, PhaseState::PrepareSent)
    }

    pub fn start(&mut self) -> Result<(), PhaseError> {
        self.advance("send START", PhaseState::PrepareSent, PhaseState::StartSent)
    }

    /// Record one data event: a TEST_MSG in either direction, or the test
    /// stream itself.
    pub fn data(&mut self) -> Result<(), PhaseError> {
        match self.state {
            PhaseState::StartSent | PhaseState::DataExchange => {
                self.state = PhaseState::DataExchange;
                self.data_events += 1;
                Ok(())
            }
            PhaseState::Finalized => Err(PhaseError::AlreadyFinalized),
            state => Err(PhaseError::OutOfOrder {
                action: "exchange data",
                state,
            }),
        }
    }

    pub fn finalize(&mut self) -> Result<(), PhaseError> {
        self.advance("send FINALIZE", PhaseState::DataExchange, PhaseState::Finalized)
    }

    /// Mark the phase failed. Idempotent; a finalized phase stays finalized.
    pub fn abort(&mut self) {
        if self.state != PhaseState::Finalized {
            self.state = PhaseState::Aborted;
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.state == PhaseState::Finalized
    }

    fn advance(
        &mut self,
        action: &'static str,
        from: PhaseState,
        to: PhaseState,
    ) -> Result<(), PhaseError> {
        if self.state == PhaseState::Finalized {
            return Err(PhaseError::AlreadyFinalized);
        }
        if self.state != from {
            return Err(PhaseError::OutOfOrder {
                action,
                state: self.state,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut p = PhaseTracker::new(TestKind::C2s);
        p.prepare().unwrap();
        p.start().unwrap();
        p.data().unwrap();
        p.data().unwrap();
        p.finalize().unwrap();
        assert!(p.is_finalized());
        assert_eq!(p.data_events(), 2);
    }

    #[test]
    fn no_data_before_start() {
        let mut p = PhaseTracker::new(TestKind::S2c);
        p.prepare().unwrap();
        assert_eq!(
            p.data().unwrap_err(),
            PhaseError::OutOfOrder {
                action: "exchange data",
                state: PhaseState::PrepareSent
            }
        );
    }

    #[test]
    fn no_finalize_before_data() {
        let mut p = PhaseTracker::new(TestKind::Meta);
        p.prepare().unwrap();
        p.start().unwrap();
        assert!(p.finalize().is_err());
        p.data().unwrap();
        assert!(p.finalize().is_ok());
    }

    #[test]
    fn start_requires_prepare() {
        let mut p = PhaseTracker::new(TestKind::Mid);
        assert!(p.start().is_err());
    }

    #[test]
    fn abort_does_not_undo_finalize() {
        let mut p = PhaseTracker::new(TestKind::Sfw);
        p.prepare().unwrap();
        p.abort();
        assert_eq!(p.state(), PhaseState::Aborted);

        let mut done = PhaseTracker::new(TestKind::Sfw);
        done.prepare().unwrap();
        done.start().unwrap();
        done.data().unwrap();
        done.finalize().unwrap();
        done.abort();
        assert!(done.is_finalized());
        assert_eq!(done.finalize().unwrap_err(), PhaseError::AlreadyFinalized);
    }
}
