//! Held lock guard and its renewal task

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::manager::HeldLocks;
use super::types::LockHealth;
use crate::application::errors::{LockError, StoreError};
use crate::infrastructure::store::KeyValueStore;
use crate::infrastructure::store::scripts::{EXTEND_IF_OWNER, RELEASE_IF_OWNER};

/// Read-only view of a held lock handed to critical sections
#[derive(Debug, Clone)]
pub struct LockLease {
    name: String,
    token: String,
    health: watch::Receiver<LockHealth>,
}

impl LockLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn health(&self) -> LockHealth {
        *self.health.borrow()
    }

    pub fn is_held(&self) -> bool {
        self.health() != LockHealth::Lost
    }

    /// Resolves once ownership is lost
    pub async fn lost(&self) {
        wait_until_lost(self.health.clone()).await
    }
}

/// A held distributed lock.
///
/// Renewal runs in a task owned by the guard. Call [`LockGuard::release`]
/// to give the lock back; a guard dropped without release stops renewing
/// and schedules a compare-and-delete on the current runtime.
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    token: String,
    health: watch::Receiver<LockHealth>,
    cancel: CancellationToken,
    renewal: Option<JoinHandle<()>>,
    registry: Option<Arc<HeldLocks>>,
    released: bool,
}

/// Parameters the renewal task needs
pub(crate) struct RenewalSettings {
    pub ttl: Duration,
    pub every: Duration,
    pub grace_failures: u32,
}

impl LockGuard {
    /// Wrap a freshly acquired record and start renewing it
    pub(crate) fn start(
        store: Arc<dyn KeyValueStore>,
        name: String,
        key: String,
        token: String,
        renewal: RenewalSettings,
        registry: Option<Arc<HeldLocks>>,
    ) -> Self {
        let (health_tx, health) = watch::channel(LockHealth::Held);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(renew_until_stopped(
            Arc::clone(&store),
            name.clone(),
            key.clone(),
            token.clone(),
            renewal,
            health_tx,
            cancel.clone(),
        ));

        if let Some(registry) = &registry {
            registry.insert(&name, &token);
        }

        Self {
            store,
            name,
            key,
            token,
            health,
            cancel,
            renewal: Some(task),
            registry,
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn health(&self) -> LockHealth {
        *self.health.borrow()
    }

    /// Watch channel publishing every health transition
    pub fn health_watch(&self) -> watch::Receiver<LockHealth> {
        self.health.clone()
    }

    /// Resolves once ownership is lost
    pub async fn lost(&self) {
        wait_until_lost(self.health.clone()).await
    }

    pub fn lease(&self) -> LockLease {
        LockLease {
            name: self.name.clone(),
            token: self.token.clone(),
            health: self.health.clone(),
        }
    }

    /// Stop renewing and delete the record if it is still ours.
    ///
    /// Returns `false` when the record had already expired or belongs to
    /// another holder; it is never deleted in that case.
    pub async fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.cancel.cancel();
        if let Some(task) = self.renewal.take()
            && let Err(e) = task.await
        {
            warn!(lock = %self.name, error = %e, "Lock renewal task ended abnormally");
        }

        let owned = release_if_owner(self.store.as_ref(), &self.key, &self.token).await?;
        if owned {
            debug!(lock = %self.name, "Lock released");
        } else {
            warn!(lock = %self.name, "Lock was no longer held at release");
        }
        Ok(owned)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(registry) = &self.registry {
            registry.remove(&self.token);
        }
        if self.released {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                let name = self.name.clone();
                let key = self.key.clone();
                let token = self.token.clone();
                handle.spawn(async move {
                    match release_if_owner(store.as_ref(), &key, &token).await {
                        Ok(owned) => debug!(lock = %name, owned, "Released dropped lock guard"),
                        Err(e) => warn!(lock = %name, error = %e, "Failed to release dropped lock guard"),
                    }
                });
            }
            Err(_) => {
                warn!(lock = %self.name, "Lock guard dropped outside a runtime, record expires by TTL");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("health", &self.health())
            .finish()
    }
}

async fn wait_until_lost(mut health: watch::Receiver<LockHealth>) {
    if health.wait_for(|h| *h == LockHealth::Lost).await.is_err() {
        // Renewal stopped without losing ownership; nothing left to signal
        std::future::pending::<()>().await;
    }
}

pub(crate) async fn release_if_owner(
    store: &dyn KeyValueStore,
    key: &str,
    token: &str,
) -> Result<bool, StoreError> {
    let reply = store
        .eval_script(&RELEASE_IF_OWNER, &[key.to_string()], &[token.to_string()])
        .await?;
    Ok(reply.as_int() == Some(1))
}

async fn renew_until_stopped(
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    token: String,
    settings: RenewalSettings,
    health: watch::Sender<LockHealth>,
    cancel: CancellationToken,
) {
    let keys = [key];
    let args = [token, settings.ttl.as_millis().max(1).to_string()];
    let mut failures = 0u32;

    let mut ticker = interval_at(Instant::now() + settings.every, settings.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.eval_script(&EXTEND_IF_OWNER, &keys, &args).await {
            Ok(reply) if reply.as_int() == Some(1) => {
                failures = 0;
                health.send_if_modified(|current| {
                    let changed = *current != LockHealth::Held;
                    *current = LockHealth::Held;
                    changed
                });
                debug!(lock = %name, "Lock renewed");
            }
            Ok(_) => {
                warn!(lock = %name, "Lock ownership lost, stopping renewal");
                health.send_replace(LockHealth::Lost);
                return;
            }
            Err(e) => {
                failures += 1;
                if failures > settings.grace_failures {
                    error!(lock = %name, failures, error = %e, "Lock renewal kept failing, treating lock as lost");
                    health.send_replace(LockHealth::Lost);
                    return;
                }
                warn!(lock = %name, failures, error = %e, "Lock renewal failed");
                health.send_replace(LockHealth::Degraded);
            }
        }
    }
}
