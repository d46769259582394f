//! An in-memory [`BrokerAdapter`] double, letting node-runtime and
//! end-to-end scenario tests run without a live broker. The "transport" is
//! a shared [`FakeNetwork`] multiple adapters attach to, reproducing the
//! real pattern-subscribe addressing rule in plain Rust collections instead
//! of `PSUBSCRIBE`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::broker::{join_topic, normalize_destinations, validate_name, BrokerAdapter};
use crate::error::BrokerError;

struct NetworkState {
    claimed_ids: HashSet<String>,
    subscriptions: HashMap<String, HashSet<String>>,
    mailboxes: HashMap<String, VecDeque<Vec<u8>>>,
}

/// A shared in-memory broker all [`FakeBroker`] instances in a test attach
/// to. Construct one and hand out `FakeBroker::new(network.clone())` per
/// simulated node.
pub struct FakeNetwork {
    state: Mutex<NetworkState>,
    notify: Notify,
    paused: AtomicBool,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NetworkState {
                claimed_ids: HashSet::new(),
                subscriptions: HashMap::new(),
                mailboxes: HashMap::new(),
            }),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
        }
    }

    /// Simulates a broker outage: every adapter's `send`/`recv` fails with
    /// `ServerDisconnected` until [`FakeNetwork::resume`] is called, so
    /// tests can exercise reconnect behavior without a real broker.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// An adapter over a [`FakeNetwork`]. One instance per simulated node.
pub struct FakeBroker {
    network: Arc<FakeNetwork>,
    id: Mutex<Option<String>>,
}

impl FakeBroker {
    pub fn new(network: Arc<FakeNetwork>) -> Self {
        Self {
            network,
            id: Mutex::new(None),
        }
    }

    /// Convenience for single-node tests that don't need to share a
    /// network with anyone else.
    pub fn new_network() -> Self {
        Self::new(Arc::new(FakeNetwork::new()))
    }

    async fn require_id(&self) -> Result<String, BrokerError> {
        self.id.lock().await.clone().ok_or(BrokerError::NotConnected)
    }
}

#[async_trait::async_trait]
impl BrokerAdapter for FakeBroker {
    async fn connect(&self) -> Result<String, BrokerError> {
        let mut id_guard = self.id.lock().await;
        if let Some(existing) = id_guard.as_ref() {
            return Ok(existing.clone());
        }
        let mut state = self.network.state.lock().await;
        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if state.claimed_ids.insert(candidate.clone()) {
                break candidate;
            }
        };
        state.subscriptions.insert(id.clone(), HashSet::new());
        state.mailboxes.insert(id.clone(), VecDeque::new());
        *id_guard = Some(id.clone());
        Ok(id)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let id = self.require_id().await?;
        let state = self.network.state.lock().await;
        if state.claimed_ids.contains(&id) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionFailed("identity no longer claimed".into()))
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut id_guard = self.id.lock().await;
        if let Some(id) = id_guard.take() {
            let mut state = self.network.state.lock().await;
            state.claimed_ids.remove(&id);
            state.subscriptions.remove(&id);
            state.mailboxes.remove(&id);
        }
        Ok(())
    }

    async fn join(&self, name: &str) -> Result<(), BrokerError> {
        validate_name(name)?;
        let id = self.require_id().await?;
        let mut state = self.network.state.lock().await;
        state.subscriptions.entry(id).or_default().insert(name.to_string());
        Ok(())
    }

    async fn leave(&self, name: &str) -> Result<(), BrokerError> {
        validate_name(name)?;
        let id = self.require_id().await?;
        let mut state = self.network.state.lock().await;
        if let Some(names) = state.subscriptions.get_mut(&id) {
            names.remove(name);
        }
        Ok(())
    }

    async fn send(&self, data: Vec<u8>, destinations: &[String]) -> Result<Option<i64>, BrokerError> {
        self.require_id().await?;
        if self.network.is_paused() {
            return Err(BrokerError::ServerDisconnected("network paused".into()));
        }
        let destinations = normalize_destinations(destinations)?;
        if destinations.is_empty() {
            tracing::warn!("send_no_response called with an empty destination set, short-circuiting");
            return Ok(Some(0));
        }
        let dest_set: HashSet<&String> = destinations.iter().collect();
        let _topic = join_topic(&destinations);

        let mut state = self.network.state.lock().await;
        let mut matched = 0i64;
        let matching_ids: Vec<String> = state
            .subscriptions
            .iter()
            .filter(|(_, names)| names.iter().any(|n| dest_set.contains(n)))
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching_ids {
            if let Some(mailbox) = state.mailboxes.get_mut(&id) {
                mailbox.push_back(data.clone());
                matched += 1;
            }
        }
        drop(state);
        self.network.notify.notify_waiters();
        Ok(Some(matched))
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, BrokerError> {
        let id = self.require_id().await?;
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);
        loop {
            if self.network.is_paused() {
                return Err(BrokerError::ServerDisconnected("network paused".into()));
            }
            {
                let mut state = self.network.state.lock().await;
                if let Some(mailbox) = state.mailboxes.get_mut(&id) {
                    if let Some(msg) = mailbox.pop_front() {
                        return Ok(Some(msg));
                    }
                }
            }
            match deadline {
                Some(d) if tokio::time::Instant::now() >= d => return Ok(None),
                Some(d) => {
                    let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                    let _ = tokio::time::timeout(remaining, self.network.notify.notified()).await;
                }
                None => self.network.notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_claims_distinct_ids() {
        let network = Arc::new(FakeNetwork::new());
        let a = FakeBroker::new(network.clone());
        let b = FakeBroker::new(network.clone());
        let id_a = a.connect().await.unwrap();
        let id_b = b.connect().await.unwrap();
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn delivers_to_joined_subscriber_only() {
        let network = Arc::new(FakeNetwork::new());
        let a = FakeBroker::new(network.clone());
        let b = FakeBroker::new(network.clone());
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        a.join("room").await.unwrap();

        let count = a.send(b"hi".to_vec(), &["room".to_string()]).await.unwrap();
        assert_eq!(count, Some(1));
        let received = a.recv(Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(received, Some(b"hi".to_vec()));
        let not_received = b.recv(Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(not_received, None);
    }

    #[tokio::test]
    async fn paused_network_fails_send_and_recv() {
        let network = Arc::new(FakeNetwork::new());
        let a = FakeBroker::new(network.clone());
        a.connect().await.unwrap();
        a.join("x").await.unwrap();
        network.pause();
        assert!(a.send(vec![1], &["x".to_string()]).await.is_err());
        assert!(a.recv(Some(Duration::from_millis(10))).await.is_err());
        network.resume();
        assert!(a.send(vec![1], &["x".to_string()]).await.is_ok());
    }

    #[tokio::test]
    async fn close_releases_identity_and_mailbox() {
        let network = Arc::new(FakeNetwork::new());
        let a = FakeBroker::new(network.clone());
        a.connect().await.unwrap();
        a.close().await.unwrap();
        assert!(matches!(a.recv(Some(Duration::from_millis(10))).await, Err(BrokerError::NotConnected)));
    }
}
