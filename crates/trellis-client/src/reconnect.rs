//! Reconnect backoff schedule.
//!
//! The first attempt after a disconnect is immediate; subsequent attempts
//! back off exponentially up to `max_delay`.  Exhausting `max_retries`
//! surfaces `CONNECTION_LOST` to every pending and future operation until a
//! manual `reconnect()`.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Retries after the immediate first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before attempt `attempt` (0-based); `None` once retries are
    /// exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if attempt > self.max_retries {
            return None;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor.max(0.0));
        Some(delay.min(self.max_delay))
    }
}
