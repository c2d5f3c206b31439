//! Congestion-window peak tracking.
//!
//! Fed one `CurCwnd` sample at a time by the background sampler during a
//! throughput test. Slow start ends at the first decrease; after that every
//! turn from rising to falling is a peak.

use serde::Serialize;

/// Min/max peak and peak count. All `-1` until slow start ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CwndPeaks {
    pub min: i64,
    pub max: i64,
    pub amount: i64,
    #[serde(skip)]
    slow_start: bool,
    #[serde(skip)]
    decreasing: bool,
    #[serde(skip)]
    prev: i64,
}

impl Default for CwndPeaks {
    fn default() -> Self {
        Self::new()
    }
}

impl CwndPeaks {
    pub fn new() -> Self {
        CwndPeaks {
            min: -1,
            max: -1,
            amount: -1,
            slow_start: true,
            decreasing: false,
            prev: -1,
        }
    }

    pub fn observe(&mut self, cwnd: i64) {
        if self.slow_start {
            if cwnd < self.prev {
                self.slow_start = false;
                self.max = self.prev;
                self.amount = 1;
                self.decreasing = true;
            }
        } else if cwnd < self.prev {
            self.max = self.max.max(self.prev);
            if !self.decreasing {
                self.amount += 1;
            }
            self.decreasing = true;
        } else if cwnd > self.prev {
            if self.min == -1 || self.prev < self.min {
                self.min = self.prev;
            }
            self.decreasing = false;
        }
        self.prev = cwnd;
    }

    pub fn in_slow_start(&self) -> bool {
        self.slow_start
    }
}

/// Counts of window increases, decreases and repeats between samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CwndTrend {
    pub increases: u32,
    pub decreases: u32,
    pub unchanged: u32,
    #[serde(skip)]
    prev: Option<i64>,
}

impl CwndTrend {
    pub fn observe(&mut self, cwnd: i64) {
        if let Some(prev) = self.prev {
            match cwnd.cmp(&prev) {
                std::cmp::Ordering::Greater => self.increases += 1,
                std::cmp::Ordering::Less => self.decreases += 1,
                std::cmp::Ordering::Equal => self.unchanged += 1,
            }
        }
        self.prev = Some(cwnd);
    }
}
