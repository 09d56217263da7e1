//! Fixed-Window Rate Limiter
//!
//! Counts hits per identity in windows that start with the first hit and
//! end when the key expires. Increment and expiry run as one atomic script,
//! so concurrent callers across processes never lose a count and the window
//! expiry is set exactly once.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::types::WindowUsage;
use crate::application::errors::StoreError;
use crate::infrastructure::store::scripts::INCREMENT_WINDOW;
use crate::infrastructure::store::{KeyValueStore, ScriptValue, StoreValue, hashed_key};

/// Fixed-window counter over the shared store
pub struct WindowLimiter {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
}

impl WindowLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: &str) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
        }
    }

    /// Store key holding the counter for `identity`
    pub fn key_for(&self, identity: &str) -> String {
        hashed_key(&self.key_prefix, identity)
    }

    /// Count a hit and report whether the identity is now over its limit.
    ///
    /// The `limit`-th hit within a window is still allowed; the one after
    /// it is not.
    pub async fn check(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
        increment: u64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .hit(identity, limit, window, increment)
            .await?
            .is_over_limit())
    }

    /// Count a hit and return the full window state
    pub async fn hit(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
        increment: u64,
    ) -> Result<WindowUsage, StoreError> {
        let key = self.key_for(identity);
        let window_ms = window.as_millis().max(1);

        let reply = self
            .store
            .eval_script(
                &INCREMENT_WINDOW,
                &[key.clone()],
                &[window_ms.to_string(), increment.to_string()],
            )
            .await?;

        let (count, remaining_ms) = parse_reply(&reply).ok_or_else(|| {
            StoreError::script(
                INCREMENT_WINDOW.name(),
                format!("unexpected reply {:?}", reply),
            )
        })?;

        let usage = WindowUsage {
            count,
            limit,
            remaining_ttl: Duration::from_millis(remaining_ms),
        };

        debug!(
            key = %key,
            count = usage.count,
            limit = usage.limit,
            remaining_ms,
            "Window hit"
        );

        Ok(usage)
    }

    /// Current count without incrementing; zero when no window is open
    pub async fn current_count(&self, identity: &str) -> Result<u64, StoreError> {
        let key = self.key_for(identity);
        Ok(match self.store.get(&key).await? {
            Some(StoreValue::Integer(count)) => count.max(0) as u64,
            _ => 0,
        })
    }
}

fn parse_reply(reply: &ScriptValue) -> Option<(u64, u64)> {
    let items = reply.as_array()?;
    let count = items.first()?.as_int()?;
    // A negative TTL means the key vanished between steps; treat as expired
    let remaining_ms = items.get(1)?.as_int()?.max(0);
    Some((count.max(0) as u64, remaining_ms as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::InMemoryStore;

    fn limiter() -> WindowLimiter {
        WindowLimiter::new(Arc::new(InMemoryStore::new()), "rl")
    }

    #[tokio::test]
    async fn test_limit_is_inclusive() {
        let limiter = limiter();
        let window = Duration::from_secs(10);

        for _ in 0..3 {
            assert!(!limiter.check("user:1", 3, window, 1).await.unwrap());
        }
        assert!(limiter.check("user:1", 3, window, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let limiter = limiter();
        let window = Duration::from_secs(10);

        assert!(limiter.check("user:1", 0, window, 1).await.unwrap());
        assert!(!limiter.check("user:2", 1, window, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_larger_than_one() {
        let limiter = limiter();
        let usage = limiter
            .hit("guild:9", 10, Duration::from_secs(5), 4)
            .await
            .unwrap();
        assert_eq!(usage.count, 4);
        assert_eq!(limiter.current_count("guild:9").await.unwrap(), 4);
    }

    #[test]
    fn test_parse_reply() {
        let reply = ScriptValue::Array(vec![ScriptValue::Int(2), ScriptValue::Int(-2)]);
        assert_eq!(parse_reply(&reply), Some((2, 0)));
        assert_eq!(parse_reply(&ScriptValue::Int(2)), None);
    }
}
