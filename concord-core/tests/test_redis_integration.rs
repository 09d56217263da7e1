//! Integration tests against a real Redis server
//!
//! Uses `CONCORD_TEST_REDIS_URL` when set, otherwise starts a Redis
//! container. Run with `--ignored`.

mod common;

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{ContainerAsync, GenericImage, core::WaitFor, runners::AsyncRunner};

use common::*;
use concord_core::application::errors::{HandlerError, LockError};
use concord_core::infrastructure::ipc::ClusterCoordinator;
use concord_core::infrastructure::lock::LockManager;
use concord_core::infrastructure::rate_limiter::WindowLimiter;
use concord_core::infrastructure::store::scripts::INCREMENT_WINDOW;
use concord_core::infrastructure::store::{KeyValueStore, RedisStore, StoreValue};

struct TestRedis {
    _container: Option<ContainerAsync<GenericImage>>,
    url: String,
}

async fn start_redis() -> TestRedis {
    if let Ok(url) = std::env::var("CONCORD_TEST_REDIS_URL") {
        return TestRedis {
            _container: None,
            url,
        };
    }

    let container = GenericImage::new("redis", "7-alpine")
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get port");

    TestRedis {
        _container: Some(container),
        url: format!("redis://127.0.0.1:{}", port),
    }
}

async fn connect(redis: &TestRedis) -> Arc<dyn KeyValueStore> {
    Arc::new(
        RedisStore::connect(&redis.url, 5, Duration::from_secs(10))
            .await
            .expect("Failed to connect to Redis"),
    )
}

fn unique(name: &str) -> String {
    format!("concord-test:{}:{}", name, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_basic_commands() {
    let redis = start_redis().await;
    let store = connect(&redis).await;
    let key = unique("basic");

    assert!(store.set(&key, &StoreValue::Integer(1), None, true).await.unwrap());
    assert!(!store.set(&key, &StoreValue::Integer(2), None, true).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), Some(StoreValue::Integer(1)));

    assert_eq!(store.incr_by(&key, 4).await.unwrap(), 5);
    assert_eq!(store.ttl(&key).await.unwrap(), None);
    assert!(store.expire(&key, Duration::from_secs(30)).await.unwrap());
    let ttl = store.ttl(&key).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30) && ttl > Duration::from_secs(25));

    assert_eq!(store.get_del(&key).await.unwrap(), Some(StoreValue::Integer(5)));
    assert!(!store.exists(&key).await.unwrap());

    let json_key = unique("json");
    store
        .set_json(&json_key, &json!({"guild": 7}), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    let value: Option<Value> = store.get_json(&json_key).await.unwrap();
    assert_eq!(value, Some(json!({"guild": 7})));
    store.delete(&json_key).await.unwrap();

    store.close().await;
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_window_limiter_on_redis() {
    let redis = start_redis().await;
    let store = connect(&redis).await;
    let limiter = WindowLimiter::new(Arc::clone(&store), &unique("rl"));
    let window = Duration::from_secs(10);

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(limiter.check("user:1", 3, window, 1).await.unwrap());
    }
    assert_eq!(results, vec![false, false, false, true]);

    let ttl = store.ttl(&limiter.key_for("user:1")).await.unwrap().unwrap();
    assert!(ttl <= window);
    assert!(ttl > Duration::from_secs(8));
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_scripts_reload_after_flush() {
    let redis = start_redis().await;
    let store = connect(&redis).await;
    let key = unique("flush");

    let client = redis::Client::open(redis.url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    redis::cmd("SCRIPT")
        .arg("FLUSH")
        .query_async::<()>(&mut conn)
        .await
        .unwrap();

    let reply = store
        .eval_script(&INCREMENT_WINDOW, &[key.clone()], &["5000".to_string(), "1".to_string()])
        .await
        .unwrap();
    assert_eq!(reply.as_array().and_then(|items| items[0].as_int()), Some(1));

    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_lock_contention_across_connections() {
    let redis = start_redis().await;
    let prefix = unique("rlock");
    let first = LockManager::new(connect(&redis).await, &prefix, short_lock_config()).unwrap();
    let second = LockManager::new(connect(&redis).await, &prefix, short_lock_config()).unwrap();

    let guard = first.acquire("reminders").await.unwrap();
    let err = second.acquire("reminders").await.unwrap_err();
    assert!(matches!(err, LockError::NotAcquired { .. }));

    // Renewal keeps the record alive past its TTL
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(second.lock("reminders").try_acquire().await.unwrap().is_none());

    assert!(guard.release().await.unwrap());
    let taken = second.acquire("reminders").await.unwrap();
    assert!(taken.release().await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_broadcast_between_processes() {
    let redis = start_redis().await;
    let prefix = format!("{}_", unique("cluster"));

    let mut clusters = Vec::new();
    for id in 0..2 {
        let mut config = coordinator_config(id, 2);
        config.channel_prefix = prefix.clone();
        let coordinator = ClusterCoordinator::new(connect(&redis).await, config);
        coordinator
            .add_handler("cluster_name", move |_payload: Value| async move {
                Ok::<_, HandlerError>(json!(id))
            })
            .await;
        coordinator.start().await.unwrap();
        clusters.push(coordinator);
    }

    let responses = clusters[0]
        .broadcast_with_deadline("cluster_name", Value::Null, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(responses.get(&0), Some(&json!(0)));
    assert_eq!(responses.get(&1), Some(&json!(1)));

    for cluster in &clusters {
        cluster.shutdown().await;
    }
}

#[tokio::test]
#[ignore = "requires Docker for Redis container"]
async fn test_subscription_survives_killed_connection() {
    let redis = start_redis().await;
    let store = connect(&redis).await;
    let channel = unique("resubscribe");
    let mut subscription = store.subscribe(&channel).await.unwrap();

    store.publish(&channel, "before").await.unwrap();
    assert_eq!(
        subscription.recv_timeout(Duration::from_secs(5)).await.as_deref(),
        Some("before")
    );

    let client = redis::Client::open(redis.url.as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let killed: i64 = redis::cmd("CLIENT")
        .arg("KILL")
        .arg("TYPE")
        .arg("pubsub")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(killed >= 1);

    // Publishes before the forwarder resubscribes have no receiver
    let mut received = None;
    for _ in 0..50 {
        store.publish(&channel, "after").await.unwrap();
        if let Some(message) = subscription.recv_timeout(Duration::from_millis(200)).await {
            received = Some(message);
            break;
        }
    }
    assert_eq!(received.as_deref(), Some("after"));

    subscription.unsubscribe().await;
    store.close().await;
}
