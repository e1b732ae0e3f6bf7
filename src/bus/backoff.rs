//! Exponential backoff between job attempts.

use std::time::Duration;

/// Configuration for exponential backoff.
///
/// The number of attempts is bounded by the job's `max_attempts`, not here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap on the exponential growth.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// 2s, 4s, 8s, ... capped at five minutes.
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(300),
        backoff_multiplier: 2.0,
    };

    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Computes the delay before retrying after `attempt` failures (0-indexed).
    ///
    /// The delay grows exponentially: `initial_delay * backoff_multiplier^attempt`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
