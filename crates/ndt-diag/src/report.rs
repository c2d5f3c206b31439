//! # Flow Report
//!
//! What the packet-pair observer hands back for one direction of a test
//! flow. The text form is one line:
//!
//! ```text
//!   b0 b1 b2 b3 b4 b5 b6 b7 b8 b9 b10 b11 runave inc dec same timeout dupack ifspeed
//! ```
//!
//! A flow that produced no classified pairs reports `-1` in every bin.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::speed::BIN_COUNT;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportParseError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("field {index} is not a number: {value:?}")]
    BadField { index: usize, value: String },
}

/// Histogram and transition counters for one flow direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowReport {
    pub bins: [i64; BIN_COUNT],
    /// Halving running average of accepted pair speeds (Mbps).
    pub running_avg: f64,
    /// Advertised window increases (ack direction).
    pub window_inc: i64,
    pub window_dec: i64,
    pub window_same: i64,
    /// Data-direction gaps above the timeout threshold.
    pub timeouts: i64,
    pub dup_acks: i64,
    /// Speed-bin index of the capture interface, `-1` when unknown.
    pub ifspeed: i32,
}

impl FlowReport {
    const FIELDS: usize = BIN_COUNT + 7;

    /// Report for a flow that could not be observed.
    pub fn unavailable() -> Self {
        FlowReport {
            bins: [-1; BIN_COUNT],
            running_avg: 0.0,
            window_inc: 0,
            window_dec: 0,
            window_same: 0,
            timeouts: 0,
            dup_acks: 0,
            ifspeed: -1,
        }
    }

    pub fn is_available(&self) -> bool {
        self.bins.iter().any(|&b| b >= 0)
    }

    /// Collapse an all-zero histogram to the unavailable marker.
    pub fn normalized(mut self) -> Self {
        if self.bins.iter().all(|&b| b == 0) {
            self.bins = [-1; BIN_COUNT];
        }
        self
    }

    pub fn total_pairs(&self) -> i64 {
        self.bins.iter().filter(|&&b| b > 0).sum()
    }
}

impl fmt::Display for FlowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(" ")?;
        for b in &self.bins {
            write!(f, " {}", b)?;
        }
        write!(
            f,
            " {:.2} {} {} {} {} {} {}",
            self.running_avg,
            self.window_inc,
            self.window_dec,
            self.window_same,
            self.timeouts,
            self.dup_acks,
            self.ifspeed
        )
    }
}

impl FromStr for FlowReport {
    type Err = ReportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != Self::FIELDS {
            return Err(ReportParseError::FieldCount {
                expected: Self::FIELDS,
                found: fields.len(),
            });
        }
        let int = |index: usize| -> Result<i64, ReportParseError> {
            fields[index]
                .parse::<i64>()
                .map_err(|_| ReportParseError::BadField {
                    index,
                    value: fields[index].to_string(),
                })
        };

        let mut bins = [0i64; BIN_COUNT];
        for (i, slot) in bins.iter_mut().enumerate() {
            *slot = int(i)?;
        }
        let running_avg = fields[BIN_COUNT]
            .parse::<f64>()
            .map_err(|_| ReportParseError::BadField {
                index: BIN_COUNT,
                value: fields[BIN_COUNT].to_string(),
            })?;
        let ifspeed = int(BIN_COUNT + 6)?;

        Ok(FlowReport {
            bins,
            running_avg,
            window_inc: int(BIN_COUNT + 1)?,
            window_dec: int(BIN_COUNT + 2)?,
            window_same: int(BIN_COUNT + 3)?,
            timeouts: int(BIN_COUNT + 4)?,
            dup_acks: int(BIN_COUNT + 5)?,
            ifspeed: i32::try_from(ifspeed).unwrap_or(-1),
        })
    }
}

/// Reports for both directions of one test flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowPair {
    pub data: FlowReport,
    pub ack: FlowReport,
}

impl FlowPair {
    pub fn unavailable() -> Self {
        FlowPair {
            data: FlowReport::unavailable(),
            ack: FlowReport::unavailable(),
        }
    }
}
