//! Application setup and wiring

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use concord_core::Config;
use concord_core::application::errors::{HandlerError, StoreError};
use concord_core::config::{StoreBackend, StoreConfig};
use concord_core::infrastructure::ipc::{ClusterCoordinator, ClusterId, IpcHandler};
use concord_core::infrastructure::{
    InMemoryStore, KeyValueStore, LockManager, RateLimiterService, RedisStore,
};

/// Running components, returned from create_app for shutdown coordination
pub struct AppHandle {
    pub store: Arc<dyn KeyValueStore>,
    pub rate_limiter: Arc<RateLimiterService>,
    pub locks: Arc<LockManager>,
    pub coordinator: Arc<ClusterCoordinator>,
    pub shutdown_token: CancellationToken,
}

impl AppHandle {
    /// Tear components down in reverse start order
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.coordinator.shutdown().await;
        self.rate_limiter.shutdown().await;
        self.store.close().await;
        tracing::info!("All components stopped");
    }
}

/// Answers liveness probes from sibling clusters
struct PingHandler {
    cluster_id: ClusterId,
}

#[async_trait]
impl IpcHandler for PingHandler {
    async fn handle(&self, _payload: Value) -> Result<Value, HandlerError> {
        Ok(json!({
            "cluster_id": self.cluster_id,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }
}

/// Reports the locks this cluster currently holds
struct HeldLocksHandler {
    locks: Arc<LockManager>,
}

#[async_trait]
impl IpcHandler for HeldLocksHandler {
    async fn handle(&self, _payload: Value) -> Result<Value, HandlerError> {
        Ok(serde_json::to_value(self.locks.held_locks())?)
    }
}

/// Open the configured store backend
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    match config.backend {
        StoreBackend::Redis => {
            tracing::info!(url = %config.url, "Connecting to shared store");
            let client_name = (!config.client_name.is_empty()).then_some(config.client_name.as_str());
            let store = RedisStore::connect_with(
                &config.url,
                config.retry.to_retry_config(config.connect_attempts),
                config.connect_timeout(),
                client_name,
            )
            .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; state is not shared between clusters");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Connect the store, build every component and start the background work
pub async fn create_app(
    config: Config,
) -> Result<AppHandle, Box<dyn std::error::Error + Send + Sync>> {
    let startup_time = Instant::now();
    let shutdown_token = CancellationToken::new();

    let store = connect_store(&config.store).await.map_err(|e| {
        tracing::error!("Failed to connect to shared store: {}", e);
        e
    })?;

    let rate_limiter = Arc::new(RateLimiterService::new(
        Arc::clone(&store),
        config.rate_limit.clone(),
    ));
    rate_limiter.start_background_tasks().await;

    let locks = Arc::new(LockManager::new(
        Arc::clone(&store),
        &config.lock.key_prefix,
        config.lock.to_lock_config(),
    )?);

    let coordinator = Arc::new(ClusterCoordinator::new(
        Arc::clone(&store),
        config.ipc.to_coordinator_config(),
    ));
    coordinator
        .add_ipc_handler(
            "ping",
            Arc::new(PingHandler {
                cluster_id: config.ipc.cluster_id,
            }),
        )
        .await;
    coordinator
        .add_ipc_handler(
            "held_locks",
            Arc::new(HeldLocksHandler {
                locks: Arc::clone(&locks),
            }),
        )
        .await;
    coordinator.start().await?;

    tracing::info!(
        cluster_id = config.ipc.cluster_id,
        cluster_count = config.ipc.cluster_count,
        rate_limiting = rate_limiter.is_enabled(),
        startup_ms = startup_time.elapsed().as_millis() as u64,
        "Cluster node ready"
    );

    Ok(AppHandle {
        store,
        rate_limiter,
        locks,
        coordinator,
        shutdown_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_create_app_with_memory_store() {
        let app = create_app(memory_config()).await.unwrap();

        assert!(app.coordinator.is_running().await);
        let result = app.rate_limiter.check_all(Some(1), 2, 3).await.unwrap();
        assert!(!result.is_limited);

        app.shutdown().await;
        assert!(!app.coordinator.is_running().await);
        assert!(app.shutdown_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_builtin_handlers_answer() {
        let app = create_app(memory_config()).await.unwrap();

        let pong = app.coordinator.broadcast("ping", Value::Null).await.unwrap();
        assert_eq!(pong[&0]["cluster_id"], json!(0));

        let guard = app.locks.acquire("reminders").await.unwrap();
        let held = app
            .coordinator
            .broadcast("held_locks", Value::Null)
            .await
            .unwrap();
        assert_eq!(held[&0][0]["name"], json!("reminders"));

        guard.release().await.unwrap();
        app.shutdown().await;
    }
}
