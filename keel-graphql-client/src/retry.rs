//! Exponential backoff shared by HTTP retries and subscription reconnects.

use std::time::Duration;

/// Exponential backoff: `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor per attempt (must be at least 1.0).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Create an exponential backoff.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Constant delay, handy in tests.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1.0,
            max: delay,
        }
    }

    /// Calculate delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis as u64).min(self.max)
    }
}
