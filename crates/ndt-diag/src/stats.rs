//! Running averages used by the packet-pair classifier.

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    /// Smoothing factor (0.0 - 1.0). Higher = more responsive.
    alpha: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    /// The first sample replaces the value outright.
    pub fn new(alpha: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: 0.0,
            initialized: false,
        }
    }

    /// Starts from `seed`, so the first sample is blended with it.
    pub fn seeded(alpha: f64, seed: f64) -> Self {
        Ewma {
            alpha: alpha.clamp(0.0, 1.0),
            value: seed,
            initialized: true,
        }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
        } else {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Arithmetic mean over accepted samples.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    total: f64,
    count: u64,
}

impl Mean {
    pub fn add(&mut self, sample: f64) {
        self.total += sample;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `None` before the first sample.
    pub fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.total / self.count as f64)
    }
}
