//! Store wrappers for failure injection

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use concord_core::application::errors::StoreError;
use concord_core::infrastructure::store::{
    InMemoryStore, KeyValueStore, ScriptValue, StoreScript, StoreValue, Subscription,
};

const HEALTHY: u8 = 0;
const FAILING_COMMANDS: u8 = 1;
const DISCONNECTED: u8 = 2;

/// In-memory store that can be switched into failing modes at runtime
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    mode: AtomicU8,
    failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every command fails with a transient command error
    pub fn fail_commands(&self) {
        self.mode.store(FAILING_COMMANDS, Ordering::SeqCst);
    }

    /// Every command fails with a fatal connectivity error
    pub fn disconnect(&self) {
        self.mode.store(DISCONNECTED, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.mode.store(HEALTHY, Ordering::SeqCst);
    }

    /// Number of commands rejected so far
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, command: &str) -> Result<(), StoreError> {
        match self.mode.load(Ordering::SeqCst) {
            FAILING_COMMANDS => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::command(command, "injected failure"))
            }
            DISCONNECTED => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Connectivity {
                    attempts: 1,
                    message: "injected disconnect".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        self.check("GET")?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &StoreValue,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        self.check("SET")?;
        self.inner.set(key, value, ttl, only_if_absent).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check("DEL")?;
        self.inner.delete(key).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        self.check("GETDEL")?;
        self.inner.get_del(key).await
    }

    async fn incr_by(&self, key: &str, step: i64) -> Result<i64, StoreError> {
        self.check("INCRBY")?;
        self.inner.incr_by(key, step).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check("PEXPIRE")?;
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.check("PTTL")?;
        self.inner.ttl(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check("EXISTS")?;
        self.inner.exists(key).await
    }

    async fn eval_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        self.check("EVALSHA")?;
        self.inner.eval_script(script, keys, args).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        self.check("PUBLISH")?;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check("SUBSCRIBE")?;
        self.inner.subscribe(channel).await
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        self.check("PING")?;
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
