//! Configuration management

pub mod validation;

pub use validation::{Validate, ValidationError};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infrastructure::ipc::CoordinatorConfig;
use crate::infrastructure::lock::LockConfig;
use crate::infrastructure::store::RetryConfig;

/// Retry configuration (serializable version)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfigSerializable {
    /// Base delay for the first backoff step (in milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound for a single backoff step (in milliseconds)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfigSerializable {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 3000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfigSerializable {
    /// Convert to the runtime RetryConfig
    pub fn to_retry_config(&self, max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub lock: LockConfigSerializable,
    pub ipc: IpcConfig,
    pub logging: LoggingConfig,
}

/// Which store implementation backs the coordination primitives
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Redis or Dragonfly shared by every cluster (production)
    #[default]
    Redis,
    /// Process-local store, only meaningful for a single cluster (development)
    Memory,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,
    /// Name reported to the server through CLIENT SETNAME
    pub client_name: String,
    /// Connection attempts before giving up
    pub connect_attempts: u32,
    /// Overall budget for establishing the connection (in seconds)
    pub connect_timeout_seconds: u64,
    pub retry: RetryConfigSerializable,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:6379".to_string(),
            client_name: "concord".to_string(),
            connect_attempts: 100,
            connect_timeout_seconds: 120,
            retry: RetryConfigSerializable::default(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Single tier limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimitConfig {
    /// Commands allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl TierLimitConfig {
    pub const fn new(limit: u64, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Limits for every command throttling tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimitsConfig {
    pub guild: TierLimitConfig,
    pub channel: TierLimitConfig,
    pub user: TierLimitConfig,
    pub global: TierLimitConfig,
}

impl Default for TierLimitsConfig {
    fn default() -> Self {
        Self {
            guild: TierLimitConfig::new(10, 10),
            channel: TierLimitConfig::new(10, 5),
            user: TierLimitConfig::new(3, 5),
            global: TierLimitConfig::new(300, 60),
        }
    }
}

/// Local fallback used while the shared store is misbehaving
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// How often idle fallback buckets are purged (in seconds)
    pub cleanup_interval_seconds: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cleanup_interval_seconds: 300,
        }
    }
}

/// Automatic growth of the global limit under sustained load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitAdjusterConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Usage (percent of the current global limit) that triggers growth
    pub threshold_percent: u8,
    /// Growth applied to the global limit when triggered
    pub growth_percent: u16,
}

impl Default for LimitAdjusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 60,
            threshold_percent: 90,
            growth_percent: 20,
        }
    }
}

/// Command throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Prefix for window keys in the shared store
    pub key_prefix: String,
    pub tiers: TierLimitsConfig,
    pub fallback: FallbackConfig,
    pub adjuster: LimitAdjusterConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "rl".to_string(),
            tiers: TierLimitsConfig::default(),
            fallback: FallbackConfig::default(),
            adjuster: LimitAdjusterConfig::default(),
        }
    }
}

/// Distributed lock configuration (serializable version)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfigSerializable {
    /// Prefix for lock keys in the shared store
    pub key_prefix: String,
    /// Lifetime of the lock record without renewal (in milliseconds)
    pub ttl_ms: u64,
    /// Delay between acquisition attempts while blocking (in milliseconds)
    pub poll_interval_ms: u64,
    pub blocking: bool,
    /// Give up acquiring after this long; wait forever when unset
    pub blocking_timeout_ms: Option<u64>,
    /// Renewal period; a third of the TTL when unset
    pub extension_interval_ms: Option<u64>,
    /// Consecutive failed renewals tolerated before the lock counts as lost
    pub renewal_grace_failures: u32,
}

impl Default for LockConfigSerializable {
    fn default() -> Self {
        Self {
            key_prefix: "rlock".to_string(),
            ttl_ms: 30_000,
            poll_interval_ms: 200,
            blocking: true,
            blocking_timeout_ms: None,
            extension_interval_ms: None,
            renewal_grace_failures: 2,
        }
    }
}

impl LockConfigSerializable {
    /// Convert to the runtime LockConfig
    pub fn to_lock_config(&self) -> LockConfig {
        let ttl = Duration::from_millis(self.ttl_ms);
        LockConfig {
            ttl,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            blocking: self.blocking,
            blocking_timeout: self.blocking_timeout_ms.map(Duration::from_millis),
            extension_interval: self
                .extension_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(ttl / 3),
            renewal_grace_failures: self.renewal_grace_failures,
        }
    }
}

/// Inter-process coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Identity of this process within the deployment
    pub cluster_id: u32,
    /// Number of cooperating processes (ids are `0..cluster_count`)
    pub cluster_count: u32,
    pub channel_prefix: String,
    /// How long a broadcast waits for sibling responses
    pub broadcast_deadline_ms: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_ttl_seconds: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            cluster_count: 1,
            channel_prefix: "cluster_".to_string(),
            broadcast_deadline_ms: 5000,
            heartbeat_interval_seconds: 30,
            heartbeat_ttl_seconds: 60,
        }
    }
}

impl IpcConfig {
    /// Convert to the runtime CoordinatorConfig
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            cluster_id: self.cluster_id,
            cluster_count: self.cluster_count,
            channel_prefix: self.channel_prefix.clone(),
            broadcast_deadline: Duration::from_millis(self.broadcast_deadline_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            heartbeat_ttl: Duration::from_secs(self.heartbeat_ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json", "pretty" or "compact"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationError> {
        self.store.validate()?;
        self.rate_limit.validate()?;
        self.lock.validate()?;
        self.ipc.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigLoadError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false));

        // Add environment-specific config if ENV is set
        if let Ok(env) = std::env::var("ENV") {
            builder = builder
                .add_source(config::File::with_name(&format!("config/{}", env)).required(false));
        }

        // Add local config and environment variables last (highest priority)
        builder = builder
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("CONCORD").separator("__"));

        let mut config: Config = builder.build()?.try_deserialize()?;

        // Override store URL from REDIS_URL env var if present (common convention)
        if let Ok(redis_url) = std::env::var("REDIS_URL") {
            config.store.url = redis_url;
        }

        config.validate()?;

        Ok(config)
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Configuration file error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),
}
