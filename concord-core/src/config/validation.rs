//! Configuration validation module

use crate::config::{
    IpcConfig, LockConfigSerializable, LoggingConfig, RateLimitConfig, StoreBackend, StoreConfig,
    TierLimitConfig,
};

/// Trait for validating configuration sections
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Store configuration error: {message}")]
    Store { message: String },

    #[error("Rate limit configuration error: {message}")]
    RateLimit { message: String },

    #[error("Lock configuration error: {message}")]
    Lock { message: String },

    #[error("IPC configuration error: {message}")]
    Ipc { message: String },

    #[error("Logging configuration error: {message}")]
    Logging { message: String },
}

impl ValidationError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
        }
    }

    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }
}

impl Validate for StoreConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.backend == StoreBackend::Redis
            && !(self.url.starts_with("redis://")
                || self.url.starts_with("rediss://")
                || self.url.starts_with("unix://")
                || self.url.starts_with("redis+unix://"))
        {
            return Err(ValidationError::store(format!(
                "Store URL must use a redis scheme, got '{}'",
                self.url
            )));
        }
        if self.connect_attempts == 0 {
            return Err(ValidationError::store("connect_attempts must be > 0"));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(ValidationError::store("connect_timeout_seconds must be > 0"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ValidationError::store("backoff_multiplier must be >= 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ValidationError::store(
                "initial_delay_ms must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

fn validate_tier(name: &str, tier: &TierLimitConfig) -> Result<(), ValidationError> {
    if tier.limit == 0 {
        return Err(ValidationError::rate_limit(format!(
            "{} tier limit must be > 0",
            name
        )));
    }
    if tier.window_seconds == 0 {
        return Err(ValidationError::rate_limit(format!(
            "{} tier window_seconds must be > 0",
            name
        )));
    }
    Ok(())
}

impl Validate for RateLimitConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.key_prefix.is_empty() {
            return Err(ValidationError::rate_limit("key_prefix must not be empty"));
        }
        validate_tier("guild", &self.tiers.guild)?;
        validate_tier("channel", &self.tiers.channel)?;
        validate_tier("user", &self.tiers.user)?;
        validate_tier("global", &self.tiers.global)?;

        if self.fallback.enabled && self.fallback.cleanup_interval_seconds == 0 {
            return Err(ValidationError::rate_limit(
                "fallback cleanup_interval_seconds must be > 0",
            ));
        }
        if self.adjuster.enabled {
            if self.adjuster.interval_seconds == 0 {
                return Err(ValidationError::rate_limit(
                    "adjuster interval_seconds must be > 0",
                ));
            }
            if self.adjuster.threshold_percent == 0 || self.adjuster.threshold_percent > 100 {
                return Err(ValidationError::rate_limit(
                    "adjuster threshold_percent must be within 1..=100",
                ));
            }
        }
        Ok(())
    }
}

impl Validate for LockConfigSerializable {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.key_prefix.is_empty() {
            return Err(ValidationError::lock("key_prefix must not be empty"));
        }
        if self.ttl_ms == 0 {
            return Err(ValidationError::lock("ttl_ms must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::lock("poll_interval_ms must be > 0"));
        }
        if let Some(extension) = self.extension_interval_ms
            && (extension == 0 || extension >= self.ttl_ms)
        {
            return Err(ValidationError::lock(
                "extension_interval_ms must be > 0 and shorter than ttl_ms",
            ));
        }
        Ok(())
    }
}

impl Validate for IpcConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster_count == 0 {
            return Err(ValidationError::ipc("cluster_count must be > 0"));
        }
        if self.cluster_id >= self.cluster_count {
            return Err(ValidationError::ipc(format!(
                "cluster_id {} is outside 0..{}",
                self.cluster_id, self.cluster_count
            )));
        }
        if self.channel_prefix.is_empty() {
            return Err(ValidationError::ipc("channel_prefix must not be empty"));
        }
        if self.broadcast_deadline_ms == 0 {
            return Err(ValidationError::ipc(
                "broadcast_deadline_ms must be > 0",
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(ValidationError::ipc("heartbeat_interval_seconds must be > 0"));
        }
        if self.heartbeat_ttl_seconds <= self.heartbeat_interval_seconds {
            return Err(ValidationError::ipc(
                "heartbeat_ttl_seconds must exceed heartbeat_interval_seconds",
            ));
        }
        Ok(())
    }
}

impl Validate for LoggingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.format.as_str() {
            "json" | "pretty" | "compact" => Ok(()),
            other => Err(ValidationError::logging(format!(
                "Unknown log format '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_cluster_id_outside_range() {
        let config = IpcConfig {
            cluster_id: 3,
            cluster_count: 3,
            ..IpcConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Ipc { .. })
        ));
    }

    #[test]
    fn test_rejects_extension_not_shorter_than_ttl() {
        let config = LockConfigSerializable {
            ttl_ms: 1000,
            extension_interval_ms: Some(1000),
            ..LockConfigSerializable::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_redis_url() {
        let config = StoreConfig {
            url: "http://localhost:6379".to_string(),
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());

        let memory = StoreConfig {
            backend: StoreBackend::Memory,
            url: String::new(),
            ..StoreConfig::default()
        };
        assert!(memory.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_tier_limit() {
        let mut config = RateLimitConfig::default();
        config.tiers.user.limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let config = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(config.validate().is_err());
    }
}
