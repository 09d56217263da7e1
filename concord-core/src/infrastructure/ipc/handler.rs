//! IPC command handlers

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::error;

use crate::application::errors::HandlerError;

/// Handles one IPC command; the returned value is sent back to the caller
#[async_trait]
pub trait IpcHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter for plain async closures
pub struct FnHandler<F, Fut> {
    handler: F,
    _future: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _future: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> IpcHandler for FnHandler<F, Fut>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        (self.handler)(payload).await
    }
}

/// Command name to handler map owned by one coordinator
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn IpcHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `command`
    pub async fn register(&self, command: &str, handler: Arc<dyn IpcHandler>) {
        self.handlers
            .write()
            .await
            .insert(command.to_string(), handler);
    }

    pub async fn contains(&self, command: &str) -> bool {
        self.handlers.read().await.contains_key(command)
    }

    /// Registered command names, sorted
    pub async fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        commands.sort();
        commands
    }

    /// Run the handler for `command`.
    ///
    /// Returns `None` when no handler is registered. A panicking handler is
    /// reported as an error.
    pub async fn dispatch(
        &self,
        command: &str,
        payload: serde_json::Value,
    ) -> Option<Result<serde_json::Value, HandlerError>> {
        let handler = self.handlers.read().await.get(command).cloned()?;

        match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
            Ok(result) => Some(result),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(command, reason = %reason, "IPC handler panicked");
                Some(Err(format!("handler panicked: {}", reason).into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dispatch_closure_handler() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "double",
                Arc::new(FnHandler::new(|payload: serde_json::Value| async move {
                    let n = payload["n"].as_i64().unwrap_or_default();
                    Ok::<_, HandlerError>(json!(n * 2))
                })),
            )
            .await;

        let result = registry.dispatch("double", json!({"n": 21})).await;
        assert_eq!(result.unwrap().unwrap(), json!(42));
        assert!(registry.dispatch("missing", json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_error() {
        let registry = HandlerRegistry::new();
        registry
            .register(
                "boom",
                Arc::new(FnHandler::new(|_payload: serde_json::Value| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok::<_, HandlerError>(serde_json::Value::Null)
                })),
            )
            .await;

        let result = registry.dispatch("boom", json!({})).await.unwrap();
        assert!(result.unwrap_err().to_string().contains("handler exploded"));
    }
}
