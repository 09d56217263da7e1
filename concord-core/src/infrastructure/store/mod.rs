//! Shared Key-Value Store
//!
//! Typed access to the Redis/Dragonfly instance every cluster shares:
//! - [`KeyValueStore`] trait used by the rate limiter, lock and coordinator
//! - [`RedisStore`] backend with reconnecting connection management
//! - [`InMemoryStore`] backend for development and single-process tests
//! - Atomic server-side scripts and pub/sub subscriptions

pub mod memory;
pub mod redis_store;
pub mod retry;
pub mod scripts;
pub mod subscription;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use retry::RetryConfig;
pub use scripts::StoreScript;
pub use subscription::Subscription;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::application::errors::StoreError;

/// Number of hex characters kept from the identity digest
const HASHED_KEY_LEN: usize = 16;

/// A value read from or written to the store.
///
/// Values are stored as strings; numeric strings come back as `Integer`,
/// JSON objects and arrays as `Json`, and everything else as `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
    Integer(i64),
    Json(serde_json::Value),
    Text(String),
}

impl StoreValue {
    /// Decode a raw stored string
    pub fn decode(raw: String) -> Self {
        if let Ok(number) = raw.parse::<i64>() {
            return StoreValue::Integer(number);
        }

        let trimmed = raw.trim_start();
        if (trimmed.starts_with('{') || trimmed.starts_with('['))
            && let Ok(json) = serde_json::from_str::<serde_json::Value>(&raw)
        {
            return StoreValue::Json(json);
        }

        StoreValue::Text(raw)
    }

    /// Encode for storage; JSON is written in compact form
    pub fn encode(&self) -> String {
        match self {
            StoreValue::Integer(number) => number.to_string(),
            StoreValue::Json(json) => json.to_string(),
            StoreValue::Text(text) => text.clone(),
        }
    }

    /// Wrap any serializable value
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, StoreError> {
        Ok(StoreValue::Json(serde_json::to_value(value)?))
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StoreValue::Integer(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoreValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Deserialize the value into a typed structure
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, StoreError> {
        let json = match self {
            StoreValue::Integer(number) => serde_json::Value::from(number),
            StoreValue::Json(json) => json,
            StoreValue::Text(text) => serde_json::Value::String(text),
        };
        Ok(serde_json::from_value(json)?)
    }
}

impl From<i64> for StoreValue {
    fn from(value: i64) -> Self {
        StoreValue::Integer(value)
    }
}

impl From<&str> for StoreValue {
    fn from(value: &str) -> Self {
        StoreValue::Text(value.to_string())
    }
}

impl From<String> for StoreValue {
    fn from(value: String) -> Self {
        StoreValue::Text(value)
    }
}

impl From<serde_json::Value> for StoreValue {
    fn from(value: serde_json::Value) -> Self {
        StoreValue::Json(value)
    }
}

/// Reply of an atomic script
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Text(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(value) => Some(*value),
            ScriptValue::Text(text) => text.parse().ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ScriptValue]> {
        match self {
            ScriptValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Operations every store backend provides
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key; a missing key is `Ok(None)`, never an error
    async fn get(&self, key: &str) -> Result<Option<StoreValue>, StoreError>;

    /// Write a key, optionally with a TTL and only when it does not exist yet.
    /// Returns whether the write took effect.
    async fn set(
        &self,
        key: &str,
        value: &StoreValue,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically read and delete a key
    async fn get_del(&self, key: &str) -> Result<Option<StoreValue>, StoreError>;

    /// Increment an integer key, creating it at zero first
    async fn incr_by(&self, key: &str, step: i64) -> Result<i64, StoreError>;

    /// Set a TTL on an existing key, returning whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL; `None` when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Execute a built-in atomic script.
    ///
    /// Backends that cache scripts server-side re-register a script that has
    /// been evicted and retry exactly once before failing.
    async fn eval_script(
        &self,
        script: &StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue, StoreError>;

    /// Publish a message, returning the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError>;

    /// Subscribe to a channel; messages published after this returns are delivered
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Round-trip latency check
    async fn ping(&self) -> Result<Duration, StoreError>;

    /// Release connections held by the backend
    async fn close(&self);
}

impl dyn KeyValueStore {
    /// Read and deserialize a structured value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(value) => value.into_typed().map(Some),
            None => Ok(None),
        }
    }

    /// Serialize and write a structured value
    pub async fn set_json<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let value = StoreValue::json(value)?;
        self.set(key, &value, ttl, false).await
    }
}

/// Build a fixed-width store key for an arbitrary identity string.
///
/// Identities may be long or contain characters with meaning in key
/// patterns, so only a truncated SHA-256 digest ends up in the key.
pub fn hashed_key(prefix: &str, identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let hex = hex::encode(digest);
    format!("{}:{}", prefix, &hex[..HASHED_KEY_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integer_json_and_text() {
        assert_eq!(StoreValue::decode("42".to_string()), StoreValue::Integer(42));
        assert_eq!(
            StoreValue::decode("{\"a\":1}".to_string()),
            StoreValue::Json(serde_json::json!({"a": 1}))
        );
        assert_eq!(
            StoreValue::decode("[1,2]".to_string()),
            StoreValue::Json(serde_json::json!([1, 2]))
        );
        assert_eq!(
            StoreValue::decode("2024-01-01T00:00:00Z".to_string()),
            StoreValue::Text("2024-01-01T00:00:00Z".to_string())
        );
        assert_eq!(
            StoreValue::decode("{not json".to_string()),
            StoreValue::Text("{not json".to_string())
        );
    }

    #[test]
    fn test_json_encoding_is_compact() {
        let value = StoreValue::json(&serde_json::json!({"a": [1, 2]})).unwrap();
        assert_eq!(value.encode(), "{\"a\":[1,2]}");
    }

    #[test]
    fn test_into_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Owner {
            cluster: u32,
        }

        let value = StoreValue::Json(serde_json::json!({"cluster": 3}));
        let owner: Owner = value.into_typed().unwrap();
        assert_eq!(owner, Owner { cluster: 3 });

        let number: u64 = StoreValue::Integer(7).into_typed().unwrap();
        assert_eq!(number, 7);
    }

    #[test]
    fn test_hashed_key_is_fixed_width() {
        let short = hashed_key("rl", "user:1");
        let long = hashed_key("rl", &"guild:".repeat(500));

        assert_eq!(short.len(), "rl:".len() + HASHED_KEY_LEN);
        assert_eq!(long.len(), short.len());
        assert_ne!(short, long);
        assert_eq!(short, hashed_key("rl", "user:1"));
    }
}
