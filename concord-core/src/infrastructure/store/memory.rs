//! In-process store backend
//!
//! Mirrors the semantics of the shared server closely enough for a single
//! process: TTLs, conditional writes, the built-in atomic scripts and
//! pub/sub. Every operation runs under one mutex, which makes the scripts
//! atomic. Time comes from `tokio::time`, so paused-clock tests can advance
//! TTLs deterministically.

use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::scripts::{EXTEND_IF_OWNER, INCREMENT_WINDOW, RELEASE_IF_OWNER, StoreScript};
use super::subscription::{SUBSCRIPTION_BUFFER, Subscription};
use super::{KeyValueStore, ScriptValue, StoreValue};
use crate::application::errors::StoreError;

/// How often expired keys nobody reads again are swept out
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    last_sweep: Instant,
}

impl MemoryState {
    /// Entry for `key` unless it is missing or expired
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut MemoryEntry> {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.last_sweep = now;
        debug!(removed = before - self.entries.len(), "Swept expired keys");
    }

    fn incr(&mut self, key: &str, step: i64, now: Instant) -> Result<i64, String> {
        match self.live(key, now) {
            Some(entry) => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| "value is not an integer".to_string())?;
                let next = current
                    .checked_add(step)
                    .ok_or_else(|| "increment would overflow".to_string())?;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: step.to_string(),
                        expires_at: None,
                    },
                );
                Ok(step)
            }
        }
    }

    fn run_script(
        &mut self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
        now: Instant,
    ) -> Result<ScriptValue, StoreError> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::script(script.name(), "script requires one key"))?;

        if *script == INCREMENT_WINDOW {
            let window = Duration::from_millis(parse_arg(script, args, 0)?);
            let step: i64 = parse_arg(script, args, 1)?;
            let current = self
                .incr(key, step, now)
                .map_err(|e| StoreError::script(script.name(), e))?;

            let remaining_ms = match self.live(key, now) {
                Some(entry) => {
                    if current == step || entry.expires_at.is_none() {
                        entry.expires_at = Some(now + window);
                    }
                    entry
                        .remaining(now)
                        .map_or(-1, |remaining| remaining.as_millis() as i64)
                }
                // A zero-length window expires the key immediately
                None => 0,
            };
            return Ok(ScriptValue::Array(vec![
                ScriptValue::Int(current),
                ScriptValue::Int(remaining_ms),
            ]));
        }

        if *script == EXTEND_IF_OWNER {
            let token: String = parse_arg(script, args, 0)?;
            let ttl = Duration::from_millis(parse_arg(script, args, 1)?);
            return Ok(match self.live(key, now) {
                Some(entry) if entry.value == token => {
                    entry.expires_at = Some(now + ttl);
                    ScriptValue::Int(1)
                }
                _ => ScriptValue::Int(0),
            });
        }

        if *script == RELEASE_IF_OWNER {
            let token: String = parse_arg(script, args, 0)?;
            let owned = self.live(key, now).is_some_and(|entry| entry.value == token);
            if owned {
                self.entries.remove(key);
            }
            return Ok(ScriptValue::Int(i64::from(owned)));
        }

        Err(StoreError::script(
            script.name(),
            "script is not available in the in-memory store",
        ))
    }
}

fn parse_arg<T: FromStr>(
    script: &StoreScript,
    args: &[String],
    index: usize,
) -> Result<T, StoreError> {
    args.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::script(script.name(), format!("invalid argument #{}", index + 1)))
}

/// Store kept entirely in process memory
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state
            .live(key, now)
            .map(|entry| StoreValue::decode(entry.value.clone())))
    }

    async fn set(
        &self,
        key: &str,
        value: &StoreValue,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.sweep(now);

        if only_if_absent && state.live(key, now).is_some() {
            return Ok(false);
        }

        state.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.encode(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let existed = state.live(key, now).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn get_del(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.live(key, now).is_none() {
            return Ok(None);
        }
        Ok(state
            .entries
            .remove(key)
            .map(|entry| StoreValue::decode(entry.value)))
    }

    async fn incr_by(&self, key: &str, step: i64) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.sweep(now);
        state
            .incr(key, step, now)
            .map_err(|e| StoreError::command("INCRBY", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(match state.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            None => false,
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state.live(key, now).and_then(|entry| entry.remaining(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        Ok(state.live(key, now).is_some())
    }

    async fn eval_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.sweep(now);
        state.run_script(script, keys, args, now)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let channels = self.channels.lock().await;
        Ok(match channels.get(channel) {
            Some(sender) => sender.send(message.to_string()).unwrap_or(0),
            None => 0,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut inbound = {
            let mut channels = self.channels.lock().await;
            channels.retain(|_, sender| sender.receiver_count() > 0);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
                .subscribe()
        };

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let name = channel.to_string();

        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    message = inbound.recv() => match message {
                        Ok(message) => {
                            if sender.send(message).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Ok(Subscription::new(channel, receiver, cancel, forwarder))
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        Ok(Duration::ZERO)
    }

    async fn close(&self) {
        self.channels.lock().await.clear();
        debug!("In-memory store closed");
    }
}
