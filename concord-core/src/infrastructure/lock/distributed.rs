//! Distributed Lock
//!
//! Mutual exclusion across clusters through a single record in the shared
//! store. The record holds the holder's token; only that holder can renew
//! or delete it, so a holder whose record expired can never remove a
//! successor's lock.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::guard::{LockGuard, LockLease, RenewalSettings};
use super::manager::HeldLocks;
use super::types::LockConfig;
use crate::application::errors::LockError;
use crate::infrastructure::store::{KeyValueStore, StoreValue};

/// A named lock bound to the shared store
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    config: LockConfig,
    registry: Option<Arc<HeldLocks>>,
}

impl DistributedLock {
    /// Lock `name` stored under `key`; see [`super::LockManager`] for the
    /// usual way to build locks with hashed keys.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        name: impl Into<String>,
        key: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            key: key.into(),
            config,
            registry: None,
        }
    }

    pub(crate) fn with_registry(mut self, registry: Arc<HeldLocks>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire with a fresh random token
    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        self.acquire_with_token(Uuid::new_v4().to_string()).await
    }

    /// Acquire the lock, identifying the holder by `token`.
    ///
    /// When blocking, the record is polled every `poll_interval` until it
    /// can be taken or `blocking_timeout` has elapsed.
    ///
    /// # Errors
    /// [`LockError::NotAcquired`] when the lock stays held by someone else,
    /// [`LockError::InvalidConfig`] for unusable timings, and
    /// [`LockError::Store`] when the store fails.
    pub async fn acquire_with_token(
        &self,
        token: impl Into<String>,
    ) -> Result<LockGuard, LockError> {
        self.config.validate()?;
        let token = token.into();
        let value = StoreValue::Text(token.clone());
        let started = Instant::now();

        loop {
            let taken = self
                .store
                .set(&self.key, &value, Some(self.config.ttl), true)
                .await?;

            if taken {
                debug!(
                    lock = %self.name,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                return Ok(self.guard(token));
            }

            let waited = started.elapsed();
            if !self.config.blocking {
                return Err(self.not_acquired(waited));
            }

            let pause = match self.config.blocking_timeout {
                Some(timeout) if waited >= timeout => return Err(self.not_acquired(waited)),
                Some(timeout) => self.config.poll_interval.min(timeout - waited),
                None => self.config.poll_interval,
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Single attempt; `None` when the lock is held by someone else
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        self.config.validate()?;
        let token = Uuid::new_v4().to_string();
        let taken = self
            .store
            .set(
                &self.key,
                &StoreValue::Text(token.clone()),
                Some(self.config.ttl),
                true,
            )
            .await?;
        Ok(taken.then(|| self.guard(token)))
    }

    /// Run `section` while holding the lock.
    ///
    /// The lock is released on every exit path. If ownership is lost while
    /// the section runs, the section is abandoned and
    /// [`LockError::Lost`] is returned. A panic inside the section releases
    /// the lock and then continues unwinding.
    pub async fn scoped<F, Fut, T>(&self, section: F) -> Result<T, LockError>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire().await?;

        let outcome = {
            let body = AssertUnwindSafe(section(guard.lease())).catch_unwind();
            tokio::select! {
                outcome = body => Some(outcome),
                _ = guard.lost() => None,
            }
        };

        if let Err(e) = guard.release().await {
            warn!(lock = %self.name, error = %e, "Failed to release lock after critical section");
        }

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => Err(LockError::Lost {
                name: self.name.clone(),
            }),
        }
    }

    fn guard(&self, token: String) -> LockGuard {
        LockGuard::start(
            Arc::clone(&self.store),
            self.name.clone(),
            self.key.clone(),
            token,
            RenewalSettings {
                ttl: self.config.ttl,
                every: self.config.extension_interval,
                grace_failures: self.config.renewal_grace_failures,
            },
            self.registry.clone(),
        )
    }

    fn not_acquired(&self, waited: std::time::Duration) -> LockError {
        debug!(lock = %self.name, waited_ms = waited.as_millis() as u64, "Lock not acquired");
        LockError::NotAcquired {
            name: self.name.clone(),
            waited,
        }
    }
}
