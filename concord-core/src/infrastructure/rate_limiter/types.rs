//! Rate limiter types and core data structures

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tier a command invocation is throttled at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeTier {
    Guild,
    Channel,
    User,
    Global,
}

impl ScopeTier {
    /// Order in which `check_all` evaluates tiers
    pub const CHECK_ORDER: [ScopeTier; 4] = [
        ScopeTier::Guild,
        ScopeTier::Channel,
        ScopeTier::User,
        ScopeTier::Global,
    ];

    /// Get the tier name for logging and keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeTier::Guild => "guild",
            ScopeTier::Channel => "channel",
            ScopeTier::User => "user",
            ScopeTier::Global => "global",
        }
    }
}

impl std::fmt::Display for ScopeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A concrete bucket within a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Guild(u64),
    Channel(u64),
    User(u64),
    Global,
}

impl Scope {
    pub fn tier(&self) -> ScopeTier {
        match self {
            Scope::Guild(_) => ScopeTier::Guild,
            Scope::Channel(_) => ScopeTier::Channel,
            Scope::User(_) => ScopeTier::User,
            Scope::Global => ScopeTier::Global,
        }
    }

    /// Identity string that gets hashed into the window key
    pub fn identity(&self) -> String {
        match self {
            Scope::Guild(id) => format!("guild:{}", id),
            Scope::Channel(id) => format!("channel:{}", id),
            Scope::User(id) => format!("user:{}", id),
            Scope::Global => "global".to_string(),
        }
    }
}

/// Counter state of one fixed window after an increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUsage {
    /// Count within the current window, including this increment
    pub count: u64,
    pub limit: u64,
    /// Time until the window resets
    pub remaining_ttl: Duration,
}

impl WindowUsage {
    pub fn is_over_limit(&self) -> bool {
        self.count > self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub is_limited: bool,
    /// How long the caller should wait (zero when not limited)
    pub retry_after: Duration,
    /// The tier that tripped, if any
    pub tier: Option<ScopeTier>,
}

impl RateLimitResult {
    /// Create a result for a request that may proceed
    pub fn allowed() -> Self {
        Self {
            is_limited: false,
            retry_after: Duration::ZERO,
            tier: None,
        }
    }

    /// Create a result for a request rejected at `tier`
    pub fn limited(tier: ScopeTier, retry_after: Duration) -> Self {
        Self {
            is_limited: true,
            retry_after,
            tier: Some(tier),
        }
    }

    /// Whole seconds to wait, rounded up and never below one when limited
    pub fn retry_after_secs(&self) -> u64 {
        if !self.is_limited {
            return 0;
        }
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }

    /// Message suitable for showing to the throttled user
    pub fn user_message(&self) -> String {
        format!("Please wait {} seconds.", self.retry_after_secs())
    }
}

/// Grow a limit by a percentage, always by at least one
pub(crate) fn apply_growth(base: u64, growth_percent: u16) -> u64 {
    if growth_percent == 0 {
        return base;
    }
    let growth = (base as u128 * growth_percent as u128 / 100).max(1);
    (base as u128 + growth).min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_identity() {
        assert_eq!(Scope::Guild(42).identity(), "guild:42");
        assert_eq!(Scope::User(7).tier(), ScopeTier::User);
        assert_eq!(Scope::Global.identity(), "global");
    }

    #[test]
    fn test_user_message_rounds_up() {
        let result = RateLimitResult::limited(ScopeTier::User, Duration::from_millis(3200));
        assert_eq!(result.user_message(), "Please wait 4 seconds.");

        let result = RateLimitResult::limited(ScopeTier::User, Duration::from_millis(10));
        assert_eq!(result.retry_after_secs(), 1);

        assert_eq!(RateLimitResult::allowed().retry_after_secs(), 0);
    }

    #[test]
    fn test_window_usage() {
        let usage = WindowUsage {
            count: 4,
            limit: 3,
            remaining_ttl: Duration::from_secs(2),
        };
        assert!(usage.is_over_limit());
        assert_eq!(usage.remaining(), 0);
    }

    #[test]
    fn test_apply_growth() {
        assert_eq!(apply_growth(300, 0), 300);
        assert_eq!(apply_growth(300, 20), 360);
        assert_eq!(apply_growth(1, 20), 2);
        assert_eq!(apply_growth(u64::MAX, 20), u64::MAX);
    }

    #[test]
    fn test_tier_serializes_lowercase() {
        let json = serde_json::to_string(&ScopeTier::Channel).unwrap();
        assert_eq!(json, "\"channel\"");
    }
}
