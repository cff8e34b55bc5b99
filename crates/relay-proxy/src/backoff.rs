//! Retry backoff: capped exponential growth, no jitter.

use std::time::Duration;

/// Pure mapping from retry attempt number to sleep delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given attempt.
    ///
    /// Attempts 0 and 1 map to the initial delay; attempt `a` maps to
    /// `initial * factor^(a-1)`, capped at the maximum delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial;
        }
        let grown = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32 - 1);
        let capped = grown.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
