//! Lock configuration and health types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::application::errors::LockError;

/// Runtime lock configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    /// Expiry of the lock record; renewed while held
    pub ttl: Duration,
    /// Delay between attempts while blocking
    pub poll_interval: Duration,
    /// Wait for a held lock instead of failing immediately
    pub blocking: bool,
    /// Give up waiting after this long; `None` waits indefinitely
    pub blocking_timeout: Option<Duration>,
    /// How often the holder renews the record; must be shorter than `ttl`
    pub extension_interval: Duration,
    /// Consecutive failed renewals tolerated before the lock counts as lost
    pub renewal_grace_failures: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(30);
        Self {
            ttl,
            poll_interval: Duration::from_millis(200),
            blocking: true,
            blocking_timeout: None,
            extension_interval: ttl / 3,
            renewal_grace_failures: 2,
        }
    }
}

impl LockConfig {
    /// Use a different TTL, renewing at a third of it
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self.extension_interval = ttl / 3;
        self
    }

    pub fn with_blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking = true;
        self.blocking_timeout = Some(timeout);
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.ttl < Duration::from_millis(1) {
            return Err(LockError::InvalidConfig(
                "ttl must be at least one millisecond".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.extension_interval.is_zero() || self.extension_interval >= self.ttl {
            return Err(LockError::InvalidConfig(format!(
                "extension_interval ({:?}) must be between zero and ttl ({:?})",
                self.extension_interval, self.ttl
            )));
        }
        Ok(())
    }
}

/// Ownership state of a held lock as seen by its renewal task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockHealth {
    /// Last renewal succeeded
    Held,
    /// Renewals are failing but the grace budget is not exhausted
    Degraded,
    /// Another holder owns the record, or renewals failed for too long
    Lost,
}

impl LockHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockHealth::Held => "held",
            LockHealth::Degraded => "degraded",
            LockHealth::Lost => "lost",
        }
    }
}

impl std::fmt::Display for LockHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
