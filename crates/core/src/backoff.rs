//! Escalating delay after consecutive "no work found" outcomes.

use std::time::Duration;

/// Delay sequence applied when a job keeps finding an empty work queue.
///
/// The counter advances once per empty outcome; the delay is taken from the
/// sequence at `counter - 1` and saturates at its last entry. A single reset
/// (work was found) brings the delay back to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffCounter {
    periods: Vec<Duration>,
    counter: u32,
}

impl BackoffCounter {
    pub fn new(periods: Vec<Duration>) -> Self {
        Self {
            periods,
            counter: 0,
        }
    }

    /// Build from a list of whole seconds.
    pub fn from_secs(periods: &[u64]) -> Self {
        Self::new(periods.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn increment(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn count(&self) -> u32 {
        self.counter
    }

    pub fn is_active(&self) -> bool {
        self.counter > 0
    }

    /// Current delay; zero when no empty outcome is pending.
    pub fn current_delay(&self) -> Duration {
        if self.counter == 0 {
            return Duration::ZERO;
        }
        let Some(last) = self.periods.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (self.counter as usize - 1).min(last);
        self.periods[index]
    }
}
