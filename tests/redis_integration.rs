//! Exercises `RedisBrokerAdapter` against a live broker: identity
//! uniqueness and TTL-bearing identity keys, which the in-memory
//! `FakeBroker` has no concept of.
//!
//! Ignored by default — run with a broker at `redis://127.0.0.1/` and
//! `cargo test --features redis-integration -- --ignored`.
#![cfg(feature = "redis-integration")]

use std::time::Duration;

use redis::AsyncCommands;
use swarmbus::broker::redis::{RedisBrokerAdapter, RedisConfig};
use swarmbus::broker::BrokerAdapter;

fn test_config(namespace: &str) -> RedisConfig {
    RedisConfig {
        url: "redis://127.0.0.1/".to_string(),
        namespace: namespace.to_string(),
        identity_ttl: Duration::from_secs(5),
        heartbeat_interval: Duration::from_millis(500),
        ping_while_sending: true,
        send_timeout: None,
    }
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open("redis://127.0.0.1/")
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .expect("a Redis broker must be reachable at redis://127.0.0.1/ for this test")
}

#[tokio::test]
#[ignore]
async fn identity_uniqueness_across_concurrent_connects() {
    let ns = format!("swarmbus-it-{}", uuid::Uuid::new_v4());
    let adapters: Vec<_> = (0..5)
        .map(|_| RedisBrokerAdapter::new(test_config(&ns)).unwrap())
        .collect();

    let mut nids = Vec::new();
    for a in &adapters {
        nids.push(a.connect().await.unwrap());
    }

    let mut sorted = nids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), nids.len(), "every connected node must claim a distinct nid");

    let mut conn = raw_connection().await;
    for nid in &nids {
        let key = format!("{ns}:{nid}");
        let value: i64 = conn.get(&key).await.unwrap();
        assert_eq!(value, 1);
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 5, "ttl {ttl} out of (0, expire] range");
    }

    for a in &adapters {
        a.close().await.unwrap();
    }
}

#[tokio::test]
#[ignore]
async fn heartbeat_keeps_identity_key_alive_past_its_own_ttl() {
    let ns = format!("swarmbus-it-{}", uuid::Uuid::new_v4());
    let adapter = RedisBrokerAdapter::new(test_config(&ns)).unwrap();
    let nid = adapter.connect().await.unwrap();
    let key = format!("{ns}:{nid}");

    tokio::time::sleep(Duration::from_secs(7)).await;

    let mut conn = raw_connection().await;
    let exists: bool = conn.exists(&key).await.unwrap();
    assert!(exists, "heartbeat must have renewed the identity key past its own 5s ttl");

    adapter.close().await.unwrap();
    let exists_after_close: bool = conn.exists(&key).await.unwrap();
    assert!(!exists_after_close, "close() must delete the identity key");
}
