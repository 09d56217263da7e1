//! Lock manager and held-lock registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use super::distributed::DistributedLock;
use super::guard::{LockGuard, LockLease};
use super::types::LockConfig;
use crate::application::errors::LockError;
use crate::infrastructure::store::{KeyValueStore, hashed_key};

/// A lock currently held by this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLock {
    pub name: String,
    pub acquired_at: DateTime<Utc>,
}

/// Locks held by this process, keyed by holder token; updated
/// synchronously from guard drops
#[derive(Debug, Default)]
pub struct HeldLocks {
    by_token: Mutex<HashMap<String, HeldLock>>,
}

impl HeldLocks {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, HeldLock>> {
        self.by_token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn insert(&self, name: &str, token: &str) {
        self.entries().insert(
            token.to_string(),
            HeldLock {
                name: name.to_string(),
                acquired_at: Utc::now(),
            },
        );
    }

    /// Forget one guard's entry; a later holder of the same name keeps its own
    pub(crate) fn remove(&self, token: &str) {
        self.entries().remove(token);
    }

    pub fn snapshot(&self) -> Vec<HeldLock> {
        let mut held: Vec<HeldLock> = self.entries().values().cloned().collect();
        held.sort_by(|a, b| a.name.cmp(&b.name).then(a.acquired_at.cmp(&b.acquired_at)));
        held
    }
}

/// Builds locks with the configured defaults and tracks what this
/// process holds
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    config: LockConfig,
    held: Arc<HeldLocks>,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key_prefix: &str,
        config: LockConfig,
    ) -> Result<Self, LockError> {
        config.validate()?;
        Ok(Self {
            store,
            key_prefix: key_prefix.to_string(),
            config,
            held: Arc::new(HeldLocks::default()),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store key for a lock name
    pub fn key_for(&self, name: &str) -> String {
        hashed_key(&self.key_prefix, name)
    }

    /// Lock with the default configuration
    pub fn lock(&self, name: &str) -> DistributedLock {
        self.lock_with(name, self.config.clone())
    }

    /// Lock with an explicit configuration
    pub fn lock_with(&self, name: &str, config: LockConfig) -> DistributedLock {
        DistributedLock::new(Arc::clone(&self.store), name, self.key_for(name), config)
            .with_registry(Arc::clone(&self.held))
    }

    pub async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        self.lock(name).acquire().await
    }

    pub async fn scoped<F, Fut, T>(&self, name: &str, section: F) -> Result<T, LockError>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock(name).scoped(section).await
    }

    /// Locks currently held by this process, sorted by name
    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.held.snapshot()
    }
}
