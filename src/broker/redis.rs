//! Reference [`BrokerAdapter`] implementation over a real Redis-like broker,
//! using the `redis` crate's async multiplexed connection and pub/sub.
//!
//! Identity is claimed via `INCR`+`EXPIRE NX`, kept alive by a heartbeat task
//! issuing periodic `SETEX`, and every publish is preceded by a liveness
//! ping to catch a session the broker has silently dropped. One task runs
//! the heartbeat for the adapter's lifetime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{join_topic, normalize_destinations, validate_name, BrokerAdapter, BROADCAST_NAME};
use crate::error::BrokerError;

const PING_PAYLOAD: &[u8] = b"swarmbus-ping";

/// Configuration for [`RedisBrokerAdapter::connect`]. Mirrors
/// `RedisConnection.__init__`'s keyword defaults.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub namespace: String,
    pub identity_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub ping_while_sending: bool,
    pub send_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1/".to_string(),
            namespace: "swarmbus".to_string(),
            identity_ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(1),
            ping_while_sending: true,
            send_timeout: None,
        }
    }
}

struct Session {
    uid: String,
    uid_key: String,
    heartbeat: JoinHandle<()>,
}

/// A [`BrokerAdapter`] backed by a live Redis (or Redis-protocol-compatible)
/// server.
pub struct RedisBrokerAdapter {
    config: RedisConfig,
    client: redis::Client,
    manager: Mutex<Option<redis::aio::ConnectionManager>>,
    pubsub: Mutex<Option<redis::aio::PubSub>>,
    session: Mutex<Option<Session>>,
}

impl RedisBrokerAdapter {
    pub fn new(config: RedisConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            config,
            client,
            manager: Mutex::new(None),
            pubsub: Mutex::new(None),
            session: Mutex::new(None),
        })
    }

    fn uid_key(&self, uid: &str) -> String {
        format!("{}:{}", self.config.namespace, uid)
    }
}

#[async_trait::async_trait]
impl BrokerAdapter for RedisBrokerAdapter {
    async fn connect(&self) -> Result<String, BrokerError> {
        let mut session_guard = self.session.lock().await;
        if let Some(s) = session_guard.as_ref() {
            return Ok(s.uid.clone());
        }

        let manager = redis::aio::ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        let pubsub_conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let mut mgr = manager.clone();
        let (uid, uid_key) = loop {
            let uid = uuid::Uuid::new_v4().to_string();
            let uid_key = self.uid_key(&uid);
            // INCR + EXPIRE NX in one pipeline: the first writer to bump the
            // key to 1 owns this uid.
            let (code, _): (i64, i64) = redis::pipe()
                .incr(&uid_key, 1)
                .cmd("EXPIRE")
                .arg(&uid_key)
                .arg(self.config.identity_ttl.as_secs())
                .arg("NX")
                .query_async(&mut mgr)
                .await
                .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
            if code == 1 {
                break (uid, uid_key);
            }
        };

        *self.manager.lock().await = Some(manager.clone());
        *self.pubsub.lock().await = Some(pubsub_conn);

        let heartbeat = spawn_heartbeat(
            manager,
            uid_key.clone(),
            self.config.identity_ttl,
            self.config.heartbeat_interval,
        );

        *session_guard = Some(Session {
            uid: uid.clone(),
            uid_key,
            heartbeat,
        });
        Ok(uid)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let session_guard = self.session.lock().await;
        let session = session_guard.as_ref().ok_or(BrokerError::NotConnected)?;
        let mut mgr_guard = self.manager.lock().await;
        let mgr = mgr_guard.as_mut().ok_or(BrokerError::NotConnected)?;
        let _: () = mgr
            .set_ex(&session.uid_key, 1, self.config.identity_ttl.as_secs())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut session_guard = self.session.lock().await;
        if let Some(session) = session_guard.take() {
            session.heartbeat.abort();
            if let Some(mut mgr) = self.manager.lock().await.take() {
                let _: Result<(), _> = mgr.del(&session.uid_key).await;
            }
            *self.pubsub.lock().await = None;
        }
        Ok(())
    }

    async fn join(&self, name: &str) -> Result<(), BrokerError> {
        validate_name(name)?;
        let mut guard = self.pubsub.lock().await;
        let pubsub = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        pubsub
            .psubscribe(format!("*|{name}|*"))
            .await
            .map_err(|e| BrokerError::ServerDisconnected(e.to_string()))
    }

    async fn leave(&self, name: &str) -> Result<(), BrokerError> {
        validate_name(name)?;
        let mut guard = self.pubsub.lock().await;
        let pubsub = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        pubsub
            .punsubscribe(format!("*|{name}|*"))
            .await
            .map_err(|e| BrokerError::ServerDisconnected(e.to_string()))
    }

    async fn send(&self, data: Vec<u8>, destinations: &[String]) -> Result<Option<i64>, BrokerError> {
        let destinations = normalize_destinations(destinations)?;
        if destinations.is_empty() {
            tracing::warn!("send called with an empty destination set, short-circuiting");
            return Ok(Some(0));
        }
        let mut mgr_guard = self.manager.lock().await;
        let mgr = mgr_guard.as_mut().ok_or(BrokerError::NotConnected)?;

        if self.config.ping_while_sending {
            let _: String = redis::cmd("PING")
                .arg(PING_PAYLOAD)
                .query_async(mgr)
                .await
                .map_err(|_| BrokerError::ServerDisconnected("ping before publish failed".into()))?;
        }

        let topic = join_topic(&destinations);
        let count: i64 = mgr
            .publish(&topic, data)
            .await
            .map_err(|e| BrokerError::ServerDisconnected(e.to_string()))?;
        Ok(Some(count))
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut guard = self.pubsub.lock().await;
        let pubsub = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        let mut stream = pubsub.on_message();

        let msg = match timeout {
            None => stream.next().await,
            Some(d) if d.is_zero() => {
                tokio::time::timeout(Duration::from_millis(1), stream.next())
                    .await
                    .unwrap_or(None)
            }
            Some(d) => tokio::time::timeout(d, stream.next()).await.unwrap_or(None),
        };

        match msg {
            Some(m) => Ok(Some(m.get_payload_bytes().to_vec())),
            None => Ok(None),
        }
    }
}

fn spawn_heartbeat(
    mut manager: redis::aio::ConnectionManager,
    uid_key: String,
    ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connected = true;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let result: redis::RedisResult<()> = manager
                .set_ex(&uid_key, 1, ttl.as_secs())
                .await;
            match result {
                Ok(_) => {
                    if !connected {
                        connected = true;
                        tracing::warn!(key = %uid_key, "server reconnected");
                    }
                }
                Err(e) => {
                    if connected {
                        connected = false;
                        tracing::warn!(key = %uid_key, error = %e, "server disconnected");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_original_namespace_and_ttl() {
        let cfg = RedisConfig::default();
        assert_eq!(cfg.namespace, "swarmbus");
        assert_eq!(cfg.identity_ttl, Duration::from_secs(120));
    }

    #[test]
    fn uid_key_is_namespace_scoped() {
        let adapter = RedisBrokerAdapter::new(RedisConfig::default()).unwrap();
        assert_eq!(adapter.uid_key("abc"), "swarmbus:abc");
    }

    #[test]
    fn broadcast_name_constant_is_all() {
        assert_eq!(BROADCAST_NAME, "all");
    }
}
