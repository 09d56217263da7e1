//! Shared configuration fixtures

use std::sync::Arc;
use std::time::Duration;

use concord_core::config::{RateLimitConfig, TierLimitConfig, TierLimitsConfig};
use concord_core::infrastructure::ipc::CoordinatorConfig;
use concord_core::infrastructure::lock::LockConfig;
use concord_core::infrastructure::store::{InMemoryStore, KeyValueStore};

/// Fresh in-memory store behind the trait object every component takes
pub fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(InMemoryStore::new())
}

/// Default command throttling tiers, spelled out for tests
pub fn command_rate_limit_config() -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        key_prefix: "rl".to_string(),
        tiers: TierLimitsConfig {
            guild: TierLimitConfig::new(10, 10),
            channel: TierLimitConfig::new(10, 5),
            user: TierLimitConfig::new(3, 5),
            global: TierLimitConfig::new(300, 60),
        },
        ..RateLimitConfig::default()
    }
}

/// Short lock timings that keep paused-clock tests quick to reason about
pub fn short_lock_config() -> LockConfig {
    LockConfig {
        ttl: Duration::from_secs(3),
        poll_interval: Duration::from_millis(200),
        blocking: true,
        blocking_timeout: Some(Duration::from_secs(1)),
        extension_interval: Duration::from_secs(1),
        renewal_grace_failures: 2,
    }
}

pub fn coordinator_config(cluster_id: u32, cluster_count: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        cluster_id,
        cluster_count,
        broadcast_deadline: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_ttl: Duration::from_secs(60),
        ..CoordinatorConfig::default()
    }
}
