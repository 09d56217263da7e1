//! Redis/Dragonfly store backend
// cspell:ignore Dragonfly EVALSHA GETDEL PEXPIRE PTTL SETNAME

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, ErrorKind, RedisError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryConfig;
use super::scripts::{BUILTIN_SCRIPTS, StoreScript};
use super::subscription::{SUBSCRIPTION_BUFFER, Subscription};
use super::{KeyValueStore, ScriptValue, StoreValue};
use crate::application::errors::StoreError;

/// Store backed by a shared Redis-compatible server
pub struct RedisStore {
    client: Client,
    connection_manager: Arc<ConnectionManager>,
    /// Script name to server-side SHA1 digest
    script_hashes: RwLock<HashMap<&'static str, String>>,
    retry: RetryConfig,
}

impl RedisStore {
    /// Connect with the default retry policy.
    ///
    /// # Errors
    /// Returns [`StoreError::Connectivity`] when no connection could be made
    /// within `max_attempts` attempts or `timeout`, whichever comes first.
    pub async fn connect(
        url: &str,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let retry = RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        };
        Self::connect_with(url, retry, timeout, None).await
    }

    /// Connect with an explicit retry policy and client name.
    ///
    /// Each failed attempt waits an equal-jitter backoff before the next one.
    /// Once connected, the built-in scripts are registered with the server.
    pub async fn connect_with(
        url: &str,
        retry: RetryConfig,
        timeout: Duration,
        client_name: Option<&str>,
    ) -> Result<Self, StoreError> {
        let max_attempts = retry.max_attempts.max(1);
        let mut attempts_made = 0u32;
        let mut last_error = String::from("no attempt made");

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                attempts_made += 1;
                match Self::open(url, client_name).await {
                    Ok(pair) => return Some(pair),
                    Err(e) => {
                        warn!(
                            attempt = attempts_made,
                            max_attempts,
                            error = %e,
                            "Failed to connect to store"
                        );
                        last_error = e.to_string();
                    }
                }
                if attempts_made >= max_attempts {
                    return None;
                }
                tokio::time::sleep(retry.backoff(attempts_made - 1)).await;
            }
        })
        .await;

        let (client, connection_manager) = match outcome {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                error!(attempts = attempts_made, "Giving up on store connection");
                return Err(StoreError::Connectivity {
                    attempts: attempts_made,
                    message: last_error,
                });
            }
            Err(_) => {
                error!(
                    attempts = attempts_made,
                    timeout_secs = timeout.as_secs(),
                    "Timed out connecting to store"
                );
                return Err(StoreError::Connectivity {
                    attempts: attempts_made,
                    message: format!("timed out after {:?}: {}", timeout, last_error),
                });
            }
        };

        let store = Self {
            client,
            connection_manager: Arc::new(connection_manager),
            script_hashes: RwLock::new(HashMap::new()),
            retry,
        };

        for script in BUILTIN_SCRIPTS.iter() {
            store.register_script(script).await?;
        }

        let latency = store.ping().await?;
        info!(
            attempts = attempts_made,
            latency_us = latency.as_micros() as u64,
            "Connected to store"
        );

        Ok(store)
    }

    async fn open(
        url: &str,
        client_name: Option<&str>,
    ) -> Result<(Client, ConnectionManager), RedisError> {
        let client = Client::open(url)?;
        let connection_manager = ConnectionManager::new(client.clone()).await?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        if let Some(name) = client_name
            && let Err(e) = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(name)
                .query_async::<()>(&mut conn)
                .await
        {
            debug!(client_name = name, error = %e, "Server rejected CLIENT SETNAME");
        }

        Ok((client, connection_manager))
    }

    fn connection(&self) -> ConnectionManager {
        (*self.connection_manager).clone()
    }

    /// Upload a script and remember its digest
    async fn register_script(&self, script: &StoreScript) -> Result<String, StoreError> {
        let mut conn = self.connection();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.body())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(script = script.name(), error = %e, "Failed to register script");
                StoreError::script(script.name(), e)
            })?;

        debug!(script = script.name(), sha = %sha, "Registered script");
        self.script_hashes
            .write()
            .await
            .insert(script.name(), sha.clone());
        Ok(sha)
    }

    async fn script_sha(&self, script: &StoreScript) -> Result<String, StoreError> {
        if let Some(sha) = self.script_hashes.read().await.get(script.name()) {
            return Ok(sha.clone());
        }
        self.register_script(script).await
    }

    async fn evalsha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<redis::Value, RedisError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len());
        for key in keys {
            cmd.arg(key);
        }
        for arg in args {
            cmd.arg(arg);
        }

        let mut conn = self.connection();
        cmd.query_async(&mut conn).await
    }
}

/// Map a failed command, logging it the same way for every operation
fn command_error(command: &str, e: RedisError) -> StoreError {
    error!(command, error = %e, "Store command failed");
    StoreError::command(command, e)
}

fn script_error(script: &StoreScript, e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        return command_error("EVALSHA", e);
    }
    error!(script = script.name(), error = %e, "Script execution failed");
    StoreError::script(script.name(), e)
}

fn script_value(value: redis::Value) -> ScriptValue {
    match value {
        redis::Value::Nil => ScriptValue::Nil,
        redis::Value::Int(number) => ScriptValue::Int(number),
        redis::Value::BulkString(bytes) => {
            ScriptValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        redis::Value::SimpleString(text) => ScriptValue::Text(text),
        redis::Value::Okay => ScriptValue::Text("OK".to_string()),
        redis::Value::Array(items) => {
            ScriptValue::Array(items.into_iter().map(script_value).collect())
        }
        other => ScriptValue::Text(format!("{:?}", other)),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let mut conn = self.connection();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("GET", e))?;
        Ok(raw.map(StoreValue::decode))
    }

    async fn set(
        &self,
        key: &str,
        value: &StoreValue,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.encode());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        if only_if_absent {
            cmd.arg("NX");
        }

        let mut conn = self.connection();
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("SET", e))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("DEL", e))?;
        Ok(removed > 0)
    }

    async fn get_del(&self, key: &str) -> Result<Option<StoreValue>, StoreError> {
        let mut conn = self.connection();
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("GETDEL", e))?;
        Ok(raw.map(StoreValue::decode))
    }

    async fn incr_by(&self, key: &str, step: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(step)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("INCRBY", e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PEXPIRE", e))?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PTTL", e))?;
        // -2: missing, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("EXISTS", e))?;
        Ok(count > 0)
    }

    async fn eval_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError> {
        let sha = self.script_sha(script).await?;

        match self.evalsha(&sha, keys, args).await {
            Ok(value) => Ok(script_value(value)),
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                warn!(
                    script = script.name(),
                    "Script missing from server cache, registering again"
                );
                let sha = self.register_script(script).await?;
                self.evalsha(&sha, keys, args)
                    .await
                    .map(script_value)
                    .map_err(|e| script_error(script, e))
            }
            Err(e) => Err(script_error(script, e)),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("PUBLISH", e))?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let pubsub = open_subscription(&self.client, channel).await?;

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_messages(
            self.client.clone(),
            channel.to_string(),
            pubsub,
            sender,
            cancel.clone(),
            self.retry.clone(),
        ));

        debug!(channel, "Subscribed");
        Ok(Subscription::new(channel, receiver, cancel, forwarder))
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        let mut conn = self.connection();
        let start = Instant::now();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| command_error("PING", e))?;
        Ok(start.elapsed())
    }

    async fn close(&self) {
        // The connection manager closes its socket once the last clone drops
        self.script_hashes.write().await.clear();
        info!("Store client closed");
    }
}

async fn open_subscription(client: &Client, channel: &str) -> Result<PubSub, StoreError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| command_error("SUBSCRIBE", e))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| command_error("SUBSCRIBE", e))?;
    Ok(pubsub)
}

/// Push pub/sub messages into the subscription buffer, resubscribing with
/// backoff whenever the dedicated connection drops.
async fn forward_messages(
    client: Client,
    channel: String,
    mut pubsub: PubSub,
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
    retry: RetryConfig,
) {
    loop {
        {
            let mut messages = std::pin::pin!(pubsub.on_message());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = messages.next() => match next {
                        Some(message) => {
                            let payload: String = match message.get_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(channel = %channel, error = %e, "Dropping undecodable message");
                                    continue;
                                }
                            };
                            if sender.send(payload).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        warn!(channel = %channel, "Subscription connection lost, resubscribing");
        let mut attempt = 0u32;
        pubsub = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry.backoff(attempt)) => {}
            }
            match open_subscription(&client, &channel).await {
                Ok(pubsub) => {
                    info!(channel = %channel, attempt = attempt + 1, "Resubscribed");
                    break pubsub;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Resubscribe failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        };
    }
}
