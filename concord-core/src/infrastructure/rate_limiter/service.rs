//! Rate Limiter Service
//!
//! The main service that throttles command invocations across clusters.
//! Provides a unified interface for:
//! - Multi-tier checks (guild, channel, user, global) in a fixed order
//! - Local leaky-bucket fallback while the shared store is failing
//! - Optional automatic growth of the global limit under sustained load

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fallback::LocalFallbackLimiter;
use super::types::{RateLimitResult, Scope, ScopeTier, apply_growth};
use super::window::WindowLimiter;
use crate::application::errors::StoreError;
use crate::config::{RateLimitConfig, TierLimitConfig, TierLimitsConfig};
use crate::infrastructure::store::KeyValueStore;

/// Main rate limiter service
pub struct RateLimiterService {
    window: WindowLimiter,
    /// Used only while store commands fail
    fallback: Option<LocalFallbackLimiter>,
    /// Current limits; the global tier may grow at runtime
    limits: RwLock<TierLimitsConfig>,
    config: RateLimitConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateLimiterService {
    pub fn new(store: Arc<dyn KeyValueStore>, config: RateLimitConfig) -> Self {
        let fallback = config.fallback.enabled.then(LocalFallbackLimiter::new);

        Self {
            window: WindowLimiter::new(store, &config.key_prefix),
            fallback,
            limits: RwLock::new(config.tiers.clone()),
            config,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Check if rate limiting is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Snapshot of the limits currently in force
    pub async fn limits(&self) -> TierLimitsConfig {
        self.limits.read().await.clone()
    }

    /// Replace the limit of one tier
    pub async fn set_limit(&self, tier: ScopeTier, limit: TierLimitConfig) {
        let mut limits = self.limits.write().await;
        *tier_limit_mut(&mut limits, tier) = limit;
        info!(tier = %tier, limit = limit.limit, window_secs = limit.window_seconds, "Updated tier limit");
    }

    /// Check one invocation against every tier.
    ///
    /// Tiers are evaluated guild, channel, user, global; the first tier that
    /// is exceeded decides the result and later tiers are not counted. The
    /// guild tier is skipped for invocations outside a guild.
    ///
    /// # Errors
    /// Only fatal connectivity failures are returned; per-command failures
    /// are absorbed by the local fallback.
    pub async fn check_all(
        &self,
        guild_id: Option<u64>,
        channel_id: u64,
        user_id: u64,
    ) -> Result<RateLimitResult, StoreError> {
        if !self.config.enabled {
            return Ok(RateLimitResult::allowed());
        }

        let scopes = [
            guild_id.map(Scope::Guild),
            Some(Scope::Channel(channel_id)),
            Some(Scope::User(user_id)),
            Some(Scope::Global),
        ];

        for scope in scopes.into_iter().flatten() {
            let result = self.check_scope(scope).await?;
            if result.is_limited {
                return Ok(result);
            }
        }

        Ok(RateLimitResult::allowed())
    }

    /// Check and count one invocation against a single scope
    pub async fn check_scope(&self, scope: Scope) -> Result<RateLimitResult, StoreError> {
        if !self.config.enabled {
            return Ok(RateLimitResult::allowed());
        }

        let tier = scope.tier();
        let identity = scope.identity();
        let limit = *tier_limit(&*self.limits.read().await, tier);

        match self
            .window
            .hit(&identity, limit.limit, limit.window(), 1)
            .await
        {
            Ok(usage) if usage.is_over_limit() => {
                debug!(
                    tier = %tier,
                    count = usage.count,
                    limit = usage.limit,
                    retry_after_ms = usage.remaining_ttl.as_millis() as u64,
                    "Rate limit exceeded"
                );
                Ok(RateLimitResult::limited(tier, usage.remaining_ttl))
            }
            Ok(_) => Ok(RateLimitResult::allowed()),
            Err(e) if e.is_transient() => Ok(self.check_fallback(tier, &identity, limit, &e).await),
            Err(e) => Err(e),
        }
    }

    async fn check_fallback(
        &self,
        tier: ScopeTier,
        identity: &str,
        limit: TierLimitConfig,
        cause: &StoreError,
    ) -> RateLimitResult {
        let Some(fallback) = &self.fallback else {
            warn!(tier = %tier, error = %cause, "Store unavailable for rate limiting, allowing request");
            return RateLimitResult::allowed();
        };

        warn!(tier = %tier, error = %cause, "Store unavailable for rate limiting, using local fallback");
        match fallback
            .check(identity, limit.limit, limit.window(), 1)
            .await
        {
            Some(wait) => RateLimitResult::limited(tier, wait.min(limit.window())),
            None => RateLimitResult::allowed(),
        }
    }

    /// Run one adjustment pass over the global limit.
    ///
    /// When the open global window has used more than the configured
    /// threshold of the limit, the limit grows by the configured percentage.
    /// Returns the new limit when it changed.
    pub async fn adjust_global_limit(&self) -> Result<Option<u64>, StoreError> {
        let adjuster = &self.config.adjuster;
        let count = self.window.current_count(&Scope::Global.identity()).await?;

        // Growth applies to the limit held under the write lock
        let mut limits = self.limits.write().await;
        let previous = limits.global.limit;
        let threshold = previous as u128 * adjuster.threshold_percent as u128;
        if (count as u128) * 100 <= threshold {
            debug!(count, limit = previous, "Global limit unchanged");
            return Ok(None);
        }

        let grown = apply_growth(previous, adjuster.growth_percent);
        limits.global.limit = grown;
        info!(
            count,
            previous,
            limit = grown,
            "Raised global rate limit"
        );
        Ok(Some(grown))
    }

    /// Start the limit adjuster and fallback cleanup tasks when enabled
    pub async fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        if self.config.adjuster.enabled {
            let every = Duration::from_secs(self.config.adjuster.interval_seconds);
            tasks.push(tokio::spawn(run_adjuster(
                Arc::downgrade(self),
                self.cancel.clone(),
                every,
            )));
            info!(interval_secs = every.as_secs(), "Global limit adjuster started");
        }

        if self.fallback.is_some() {
            let every = Duration::from_secs(self.config.fallback.cleanup_interval_seconds);
            tasks.push(tokio::spawn(run_fallback_cleanup(
                Arc::downgrade(self),
                self.cancel.clone(),
                every,
            )));
        }
    }

    /// Stop background tasks and wait for them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Rate limiter task ended abnormally");
            }
        }
        debug!("Rate limiter stopped");
    }

    /// Longest window of any tier; idle fallback buckets are empty after it
    async fn longest_window(&self) -> Duration {
        let limits = self.limits.read().await;
        ScopeTier::CHECK_ORDER
            .iter()
            .map(|tier| tier_limit(&limits, *tier).window())
            .max()
            .unwrap_or_default()
    }
}

async fn run_adjuster(service: Weak<RateLimiterService>, cancel: CancellationToken, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(service) = service.upgrade() else {
            return;
        };
        if let Err(e) = service.adjust_global_limit().await {
            warn!(error = %e, "Global limit adjustment failed");
        }
    }
}

async fn run_fallback_cleanup(
    service: Weak<RateLimiterService>,
    cancel: CancellationToken,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(service) = service.upgrade() else {
            return;
        };
        if let Some(fallback) = &service.fallback {
            let idle_after = service.longest_window().await;
            let removed = fallback.cleanup(idle_after).await;
            debug!(removed, "Rate limiter fallback cleanup completed");
        }
    }
}

fn tier_limit(limits: &TierLimitsConfig, tier: ScopeTier) -> &TierLimitConfig {
    match tier {
        ScopeTier::Guild => &limits.guild,
        ScopeTier::Channel => &limits.channel,
        ScopeTier::User => &limits.user,
        ScopeTier::Global => &limits.global,
    }
}

fn tier_limit_mut(limits: &mut TierLimitsConfig, tier: ScopeTier) -> &mut TierLimitConfig {
    match tier {
        ScopeTier::Guild => &mut limits.guild,
        ScopeTier::Channel => &mut limits.channel,
        ScopeTier::User => &mut limits.user,
        ScopeTier::Global => &mut limits.global,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStore;

    fn test_config() -> RateLimitConfig {
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

    fn service(config: RateLimitConfig) -> RateLimiterService {
        RateLimiterService::new(Arc::new(InMemoryStore::new()), config)
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled() {
        let mut config = test_config();
        config.enabled = false;
        let service = service(config);

        for _ in 0..10 {
            let result = service.check_all(Some(1), 2, 3).await.unwrap();
            assert!(!result.is_limited);
        }
    }

    #[tokio::test]
    async fn test_user_tier_trips_first() {
        let service = service(test_config());

        for _ in 0..3 {
            assert!(!service.check_all(Some(1), 2, 3).await.unwrap().is_limited);
        }

        let result = service.check_all(Some(1), 2, 3).await.unwrap();
        assert!(result.is_limited);
        assert_eq!(result.tier, Some(ScopeTier::User));
        assert!(result.retry_after > Duration::ZERO);
        assert!(result.retry_after <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_guild_tier_short_circuits() {
        let mut config = test_config();
        config.tiers.guild = TierLimitConfig::new(1, 10);
        let service = service(config);

        assert!(!service.check_all(Some(1), 2, 3).await.unwrap().is_limited);
        let result = service.check_all(Some(1), 2, 3).await.unwrap();
        assert_eq!(result.tier, Some(ScopeTier::Guild));

        // Later tiers were not counted for the rejected call
        let user = service.window.current_count("user:3").await.unwrap();
        assert_eq!(user, 1);
    }

    #[tokio::test]
    async fn test_direct_messages_skip_guild_tier() {
        let mut config = test_config();
        config.tiers.guild = TierLimitConfig::new(0, 10);
        let service = service(config);

        assert!(!service.check_all(None, 2, 3).await.unwrap().is_limited);
    }

    #[tokio::test]
    async fn test_adjust_global_limit() {
        let mut config = test_config();
        config.tiers.global = TierLimitConfig::new(10, 60);
        let service = service(config);

        for _ in 0..9 {
            service.check_scope(Scope::Global).await.unwrap();
        }
        assert_eq!(service.adjust_global_limit().await.unwrap(), None);

        service.check_scope(Scope::Global).await.unwrap();
        assert_eq!(service.adjust_global_limit().await.unwrap(), Some(12));
        assert_eq!(service.limits().await.global.limit, 12);
    }

    #[tokio::test]
    async fn test_set_limit() {
        let service = service(test_config());
        service
            .set_limit(ScopeTier::Channel, TierLimitConfig::new(1, 5))
            .await;

        assert!(!service.check_scope(Scope::Channel(5)).await.unwrap().is_limited);
        assert!(service.check_scope(Scope::Channel(5)).await.unwrap().is_limited);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let mut config = test_config();
        config.adjuster.enabled = true;
        let service = Arc::new(service(config));

        service.start_background_tasks().await;
        assert_eq!(service.tasks.lock().await.len(), 2);

        service.shutdown().await;
        assert!(service.tasks.lock().await.is_empty());
    }
}
