//! Retry policy for store connections

use rand::Rng;
use std::time::Duration;

/// Retry configuration for (re)connecting to the store
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of connection attempts
    pub max_attempts: u32,
    /// Base delay for the first backoff step
    pub initial_delay: Duration,
    /// Upper bound for a single backoff step
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Exponential ceiling for the given zero-based attempt, capped at `max_delay`
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// "Equal jitter" backoff: half of the ceiling is fixed, the other half random
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        half + Duration::from_millis(jitter)
    }
}
