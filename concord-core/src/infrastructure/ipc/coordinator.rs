//! Cluster Coordinator
//!
//! Request/response messaging between cooperating processes over pub/sub.
//! Each cluster listens on its own channel; a broadcast publishes one
//! envelope per sibling and gathers answers on a response channel created
//! for that call, until every sibling answered or the deadline passed.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{FnHandler, HandlerRegistry, IpcHandler};
use super::types::{ClusterId, CoordinatorConfig, IpcEnvelope, IpcResponse};
use crate::application::errors::{CoordinatorError, HandlerError};
use crate::infrastructure::store::{KeyValueStore, StoreValue, Subscription};

struct RunningTasks {
    cancel: CancellationToken,
    pump: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

/// Per-process IPC endpoint
pub struct ClusterCoordinator {
    store: Arc<dyn KeyValueStore>,
    config: CoordinatorConfig,
    handlers: Arc<HandlerRegistry>,
    sequence: AtomicU64,
    running: Mutex<Option<RunningTasks>>,
}

impl ClusterCoordinator {
    pub fn new(store: Arc<dyn KeyValueStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            sequence: AtomicU64::new(0),
            running: Mutex::new(None),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.config.cluster_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Register an async closure for `command`; handlers may be added
    /// before or after [`ClusterCoordinator::start`].
    pub async fn add_handler<F, Fut>(&self, command: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        self.add_ipc_handler(command, Arc::new(FnHandler::new(handler)))
            .await;
    }

    /// Register a handler object for `command`
    pub async fn add_ipc_handler(&self, command: &str, handler: Arc<dyn IpcHandler>) {
        self.handlers.register(command, handler).await;
        debug!(command, "Registered IPC handler");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Subscribe to this cluster's channel and start the message pump and
    /// heartbeat tasks.
    ///
    /// # Errors
    /// [`CoordinatorError::AlreadyStarted`] when called twice without
    /// shutdown, [`CoordinatorError::Store`] when the subscription fails.
    pub async fn start(&self) -> Result<(), CoordinatorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(CoordinatorError::AlreadyStarted(self.config.cluster_id));
        }

        let channel = self.config.channel_for(self.config.cluster_id);
        let subscription = self.store.subscribe(&channel).await?;
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_pump(
            Arc::clone(&self.store),
            Arc::clone(&self.handlers),
            subscription,
            self.config.cluster_id,
            cancel.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.store),
            self.config.heartbeat_key(self.config.cluster_id),
            self.config.heartbeat_interval,
            self.config.heartbeat_ttl,
            cancel.clone(),
        ));

        *running = Some(RunningTasks {
            cancel,
            pump,
            heartbeat,
        });

        info!(
            cluster_id = self.config.cluster_id,
            cluster_count = self.config.cluster_count,
            channel = %channel,
            "Cluster coordinator started"
        );
        Ok(())
    }

    /// Stop the pump and heartbeat, wait for both, and withdraw this
    /// cluster's heartbeat record
    pub async fn shutdown(&self) {
        let Some(tasks) = self.running.lock().await.take() else {
            return;
        };

        tasks.cancel.cancel();
        for (name, task) in [("pump", tasks.pump), ("heartbeat", tasks.heartbeat)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Coordinator task ended abnormally");
            }
        }

        let key = self.config.heartbeat_key(self.config.cluster_id);
        if let Err(e) = self.store.delete(&key).await {
            warn!(error = %e, "Failed to remove heartbeat record");
        }

        info!(cluster_id = self.config.cluster_id, "Cluster coordinator stopped");
    }

    /// Broadcast with the configured deadline
    pub async fn broadcast(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<HashMap<ClusterId, serde_json::Value>, CoordinatorError> {
        self.broadcast_with_deadline(command, payload, self.config.broadcast_deadline)
            .await
    }

    /// Ask every cluster, this one included, to run `command`.
    ///
    /// Returns the answers received before `deadline`, keyed by cluster. A
    /// missing entry means that cluster's answer is unknown. Only failing to
    /// open the response subscription is an error; publish failures to
    /// individual siblings are logged.
    pub async fn broadcast_with_deadline(
        &self,
        command: &str,
        payload: serde_json::Value,
        deadline: Duration,
    ) -> Result<HashMap<ClusterId, serde_json::Value>, CoordinatorError> {
        let started = Instant::now();
        let response_channel = self.response_channel(command);
        let envelope = IpcEnvelope::request(
            command,
            payload.clone(),
            self.config.cluster_id,
            Some(response_channel.clone()),
        );
        let message = serde_json::to_string(&envelope)?;

        let mut pending: HashSet<ClusterId> = self.config.siblings().collect();
        let mut subscription = self.store.subscribe(&response_channel).await?;

        for sibling in pending.iter().copied() {
            let channel = self.config.channel_for(sibling);
            if let Err(e) = self.store.publish(&channel, &message).await {
                warn!(command, cluster = sibling, error = %e, "Failed to publish IPC request");
            }
        }

        let deadline_at = started + deadline;
        let local = async {
            match timeout_at(deadline_at, self.handlers.dispatch(command, payload)).await {
                Ok(Some(Ok(value))) => Some(value),
                Ok(Some(Err(e))) => {
                    warn!(command, error = %e, "Local IPC handler failed");
                    None
                }
                Ok(None) => {
                    debug!(command, "No local handler for broadcast command");
                    None
                }
                Err(_) => {
                    warn!(command, "Local IPC handler missed the broadcast deadline");
                    None
                }
            }
        };

        let mut responses = HashMap::new();
        let (local, ()) = tokio::join!(
            local,
            collect_responses(&mut subscription, &mut pending, &mut responses, deadline_at)
        );
        if let Some(value) = local {
            responses.insert(self.config.cluster_id, value);
        }
        subscription.unsubscribe().await;

        if !pending.is_empty() {
            let mut missing: Vec<_> = pending.into_iter().collect();
            missing.sort_unstable();
            debug!(command, ?missing, "Broadcast deadline passed without every answer");
        }
        debug!(
            command,
            responses = responses.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Broadcast complete"
        );

        Ok(responses)
    }

    /// First non-null answer, preferring this cluster's own
    pub async fn first_found(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, CoordinatorError> {
        let mut responses = self.broadcast(command, payload).await?;

        if let Some(own) = responses.remove(&self.config.cluster_id)
            && !own.is_null()
        {
            return Ok(Some(own));
        }

        let mut ids: Vec<_> = responses.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| responses.remove(&id))
            .find(|value| !value.is_null()))
    }

    /// Sum of integer answers; non-integer answers are ignored
    pub async fn sum_counts(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<i64, CoordinatorError> {
        let responses = self.broadcast(command, payload).await?;
        Ok(responses
            .iter()
            .filter_map(|(cluster, value)| {
                let count = value.as_i64();
                if count.is_none() {
                    debug!(command, cluster, "Ignoring non-integer count");
                }
                count
            })
            .sum())
    }

    /// Clusters with a live heartbeat and when they last reported
    pub async fn live_clusters(
        &self,
    ) -> Result<BTreeMap<ClusterId, DateTime<Utc>>, CoordinatorError> {
        let mut live = BTreeMap::new();
        for cluster in 0..self.config.cluster_count {
            let key = self.config.heartbeat_key(cluster);
            if let Some(StoreValue::Text(raw)) = self.store.get(&key).await? {
                match DateTime::parse_from_rfc3339(&raw) {
                    Ok(seen) => {
                        live.insert(cluster, seen.with_timezone(&Utc));
                    }
                    Err(e) => debug!(cluster, error = %e, "Unreadable heartbeat record"),
                }
            }
        }
        Ok(live)
    }

    fn response_channel(&self, command: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "response_{}_{}_{}_{}",
            command,
            self.config.cluster_id,
            Utc::now().timestamp_micros(),
            sequence
        )
    }
}

async fn collect_responses(
    subscription: &mut Subscription,
    pending: &mut HashSet<ClusterId>,
    responses: &mut HashMap<ClusterId, serde_json::Value>,
    deadline: Instant,
) {
    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Some(raw) = subscription.recv_timeout(remaining).await else {
            break;
        };

        match serde_json::from_str::<IpcResponse>(&raw) {
            Ok(response) if pending.remove(&response.cluster_id) => {
                responses.insert(response.cluster_id, response.data);
            }
            Ok(response) => {
                debug!(cluster = response.cluster_id, "Ignoring unexpected IPC response");
            }
            Err(e) => debug!(error = %e, "Skipping malformed IPC response"),
        }
    }
}

async fn run_pump(
    store: Arc<dyn KeyValueStore>,
    handlers: Arc<HandlerRegistry>,
    mut subscription: Subscription,
    cluster_id: ClusterId,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let envelope: IpcEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Skipping malformed IPC message");
                continue;
            }
        };

        if envelope.source_cluster == cluster_id {
            continue;
        }

        handle_envelope(store.as_ref(), &handlers, cluster_id, envelope).await;
    }

    subscription.unsubscribe().await;
    debug!(cluster_id, "IPC pump stopped");
}

async fn handle_envelope(
    store: &dyn KeyValueStore,
    handlers: &HandlerRegistry,
    cluster_id: ClusterId,
    envelope: IpcEnvelope,
) {
    let IpcEnvelope {
        command,
        data,
        source_cluster,
        response_channel,
        ..
    } = envelope;

    let value = match handlers.dispatch(&command, data).await {
        Some(Ok(value)) => value,
        Some(Err(e)) => {
            error!(command = %command, source_cluster, error = %e, "IPC handler failed");
            return;
        }
        None => {
            warn!(command = %command, source_cluster, "Unknown IPC command");
            return;
        }
    };

    let Some(channel) = response_channel else {
        return;
    };

    let response = match serde_json::to_string(&IpcResponse::new(cluster_id, value)) {
        Ok(response) => response,
        Err(e) => {
            error!(command = %command, error = %e, "Failed to encode IPC response");
            return;
        }
    };

    if let Err(e) = store.publish(&channel, &response).await {
        warn!(command = %command, source_cluster, error = %e, "Failed to publish IPC response");
    }
}

async fn run_heartbeat(
    store: Arc<dyn KeyValueStore>,
    key: String,
    every: Duration,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let now = StoreValue::Text(Utc::now().to_rfc3339());
        match store.set(&key, &now, Some(ttl), false).await {
            Ok(_) => debug!(key = %key, "Heartbeat written"),
            Err(e) => warn!(key = %key, error = %e, "Failed to write heartbeat"),
        }
    }
}
