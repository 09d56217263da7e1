//! Local Fallback Limiter
//!
//! Per-process leaky bucket used while the shared store is failing. It only
//! sees this process's traffic, so limits are approximate across clusters,
//! but throttling keeps working instead of failing open.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Leaky bucket holding `level` units that drain at a constant rate
#[derive(Debug, Clone, Default)]
pub struct LeakyBucket {
    level: f64,
}

impl LeakyBucket {
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Drain for the given elapsed time at `rate` units per second
    pub fn drain(&mut self, elapsed: Duration, rate: f64) {
        self.level = (self.level - elapsed.as_secs_f64() * rate).max(0.0);
    }

    /// Try to pour `amount` into a bucket of `capacity`.
    ///
    /// Returns `None` when accepted, or how long until it would fit.
    pub fn try_pour(&mut self, amount: f64, capacity: f64, rate: f64) -> Option<Duration> {
        if self.level + amount <= capacity {
            self.level += amount;
            return None;
        }
        if rate <= 0.0 {
            return Some(Duration::MAX);
        }
        let overflow = self.level + amount - capacity;
        Some(Duration::from_secs_f64(overflow / rate))
    }
}

struct BucketEntry {
    bucket: LeakyBucket,
    last_seen: Instant,
}

/// In-process limiter keyed by identity
pub struct LocalFallbackLimiter {
    buckets: Mutex<HashMap<String, BucketEntry>>,
}

impl LocalFallbackLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a hit; the bucket holds `limit` units and drains
    /// completely over `window`.
    ///
    /// Returns `None` when admitted, otherwise the suggested wait.
    pub async fn check(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
        increment: u64,
    ) -> Option<Duration> {
        let now = Instant::now();
        let rate = limit as f64 / window.as_secs_f64().max(f64::EPSILON);

        let mut buckets = self.buckets.lock().await;
        let entry = buckets
            .entry(identity.to_string())
            .or_insert_with(|| BucketEntry {
                bucket: LeakyBucket::default(),
                last_seen: now,
            });

        entry
            .bucket
            .drain(now.saturating_duration_since(entry.last_seen), rate);
        entry.last_seen = now;

        let verdict = entry.bucket.try_pour(increment as f64, limit as f64, rate);
        if let Some(wait) = verdict {
            debug!(identity, wait_ms = wait.as_millis() as u64, "Fallback limiter rejected hit");
        }
        verdict
    }

    /// Remove buckets idle long enough to have fully drained
    pub async fn cleanup(&self, idle_after: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < idle_after);
        before - buckets.len()
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }
}

impl Default for LocalFallbackLimiter {
    fn default() -> Self {
        Self::new()
    }
}
