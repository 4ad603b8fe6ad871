//! Automatic restart bookkeeping.

use std::time::{Duration, Instant};

/// Delay gating each automatic restart attempt; its length caps the number of
/// attempts between manual starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootSchedule {
    delays: Vec<Duration>,
}

impl RebootSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    /// Minimum age of the previous attempt before attempt `attempt` may run.
    pub fn delay_for(&self, attempt: usize) -> Option<Duration> {
        self.delays.get(attempt).copied()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RebootSchedule {
    fn default() -> Self {
        Self::from_secs(&[1, 10, 20, 50, 150])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootDecision {
    /// Automatic restarts are switched off for this worker.
    Disabled,
    /// The schedule ran out; automatic restarts are now switched off.
    Exhausted,
    /// The previous attempt is too recent.
    NotDue { remaining: Duration },
    /// Attempt number `attempt` (1-based) may run now.
    Due { attempt: usize },
}

#[derive(Debug, Clone, Default)]
pub struct RebootState {
    attempts: usize,
    last_reboot_at: Option<Instant>,
    should_reboot: bool,
}

impl RebootState {
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn last_reboot_at(&self) -> Option<Instant> {
        self.last_reboot_at
    }

    pub fn should_reboot(&self) -> bool {
        self.should_reboot
    }

    /// A caller-initiated start re-arms automatic restarts.
    pub fn reset_manual(&mut self) {
        self.attempts = 0;
        self.last_reboot_at = None;
        self.should_reboot = true;
    }

    /// Decide whether an automatic restart may run at `now`, recording the
    /// attempt when it may.
    pub fn begin_attempt(&mut self, now: Instant, schedule: &RebootSchedule) -> RebootDecision {
        if !self.should_reboot {
            return RebootDecision::Disabled;
        }
        let Some(delay) = schedule.delay_for(self.attempts) else {
            self.should_reboot = false;
            return RebootDecision::Exhausted;
        };
        if let Some(last) = self.last_reboot_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < delay {
                return RebootDecision::NotDue {
                    remaining: delay - elapsed,
                };
            }
        }
        self.attempts += 1;
        self.last_reboot_at = Some(now);
        RebootDecision::Due {
            attempt: self.attempts,
        }
    }
}
