//! Rolling record of request outcomes used to judge worker liveness.

use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_MIN_SAMPLES: usize = 200;
pub const DEFAULT_MIN_SUCCESS_RATIO: f64 = 0.1;

/// Bounded ring buffer of success/failure events, oldest evicted first.
#[derive(Debug, Clone)]
pub struct HealthWindow {
    events: VecDeque<bool>,
    successes: usize,
    capacity: usize,
    min_samples: usize,
    min_success_ratio: f64,
}

impl HealthWindow {
    pub fn new(capacity: usize, min_samples: usize, min_success_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            successes: 0,
            capacity,
            min_samples,
            min_success_ratio,
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.events.len() >= self.capacity
            && let Some(evicted) = self.events.pop_front()
            && evicted
        {
            self.successes -= 1;
        }
        self.events.push_back(success);
        if success {
            self.successes += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn success_ratio(&self) -> Option<f64> {
        if self.events.is_empty() {
            None
        } else {
            Some(self.successes as f64 / self.events.len() as f64)
        }
    }

    /// Too few samples always pass; otherwise the success ratio must reach
    /// the configured floor.
    pub fn is_acceptable(&self) -> bool {
        if self.events.len() < self.min_samples {
            return true;
        }
        self.success_ratio()
            .is_none_or(|ratio| ratio >= self.min_success_ratio)
    }
}

impl Default for HealthWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MIN_SAMPLES, DEFAULT_MIN_SUCCESS_RATIO)
    }
}
