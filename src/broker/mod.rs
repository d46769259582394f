//! The broker adapter boundary (C1): connect/identity, pattern-subscription
//! addressing, and publish/receive over whatever pub/sub transport backs a
//! node.
//!
//! [`BrokerAdapter`] is the seam a `Node` is generic over — the reference
//! implementation lives in [`crate::broker::redis`], and [`crate::testing`]
//! supplies an in-memory double with the same contract for tests.

pub mod redis;

use async_trait::async_trait;

use crate::error::BrokerError;

/// The reserved destination name every connected node implicitly joins,
/// matching the "broadcast" pattern subscription `*|all|*`.
pub const BROADCAST_NAME: &str = "all";

/// Channel/destination names and the delimiter-joined topic they're
/// published under must never contain this character — it's the field
/// separator of the topic itself (`|d1|d2|...|dn|`).
pub const NAME_DELIMITER: char = '|';

/// Rejects a channel/destination name containing the reserved delimiter.
pub fn validate_name(name: &str) -> Result<(), BrokerError> {
    if name.contains(NAME_DELIMITER) {
        return Err(BrokerError::InvalidChannel(name.to_string()));
    }
    Ok(())
}

/// Deduplicates a destination list and validates each entry, preserving
/// first-seen order. If `"all"` appears alongside any other name, the set
/// collapses to just `{"all"}` since broadcast already reaches every other
/// destination. The adapter — not the node — owns this normalization, so
/// both `send` and `send_no_response` get it for free by routing through
/// the same adapter method.
pub fn normalize_destinations(destinations: &[String]) -> Result<Vec<String>, BrokerError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(destinations.len());
    for d in destinations {
        validate_name(d)?;
        if seen.insert(d.clone()) {
            out.push(d.clone());
        } else {
            tracing::warn!(name = %d, "duplicate destination collapsed");
        }
    }
    if out.len() > 1 && out.iter().any(|d| d == BROADCAST_NAME) {
        tracing::warn!(destinations = ?out, "\"all\" present alongside other destinations, collapsing to \"all\"");
        out = vec![BROADCAST_NAME.to_string()];
    }
    Ok(out)
}

/// Joins a normalized destination list into the wire topic
/// `|d1|d2|...|dn|` a publish targets.
pub fn join_topic(destinations: &[String]) -> String {
    let mut s = String::from("|");
    for d in destinations {
        s.push_str(d);
        s.push('|');
    }
    s
}

/// A connected session's transport: identity/heartbeat, pattern-subscribe
/// addressing, and raw byte publish/receive. One adapter instance backs one
/// `Node`.
///
/// Object-safe and `async_trait`-based: `Node` needs to hold
/// `Arc<dyn BrokerAdapter>` so the same runtime works against the real
/// broker or [`crate::testing::FakeBroker`] without a generic parameter
/// infecting every call site.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Establishes a session and claims a fresh node id. Idempotent: calling
    /// `connect` again on an already-connected adapter returns the existing
    /// id without re-claiming.
    async fn connect(&self) -> Result<String, BrokerError>;

    /// Re-asserts the session's identity key with a fresh TTL without
    /// minting a new id — used after a transient broker outage while the
    /// node kept its `nid`. `NotConnected` if `connect` was never called.
    async fn reconnect(&self) -> Result<(), BrokerError>;

    /// Tears the session down: unsubscribes everything, releases the
    /// identity key, stops the heartbeat task. Safe to call more than once.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Subscribes to a named destination pattern (`*|name|*`).
    async fn join(&self, name: &str) -> Result<(), BrokerError>;

    /// Unsubscribes from a named destination pattern.
    async fn leave(&self, name: &str) -> Result<(), BrokerError>;

    /// Publishes `data` to the topic addressing the (already-normalized)
    /// destination set, pinging first to catch a silently-dead connection
    /// before committing to a publish the caller expects to be delivered.
    /// Returns the receiver count the broker reports, if any.
    async fn send(&self, data: Vec<u8>, destinations: &[String]) -> Result<Option<i64>, BrokerError>;

    /// Receives the next message addressed to this node's subscriptions.
    /// `timeout` of `None` blocks forever; `Some(Duration::ZERO)` polls
    /// once without blocking.
    async fn recv(&self, timeout: Option<std::time::Duration>) -> Result<Option<Vec<u8>>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_delimiter_in_name() {
        assert!(validate_name("fine").is_ok());
        assert!(matches!(
            validate_name("bad|name"),
            Err(BrokerError::InvalidChannel(_))
        ));
    }

    #[test]
    fn normalize_dedupes_preserving_order() {
        let input = vec!["a".to_string(), "b".to_string(), "a".to_string(), "c".to_string()];
        let out = normalize_destinations(&input).unwrap();
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn normalize_rejects_bad_name() {
        let input = vec!["ok".to_string(), "bad|name".to_string()];
        assert!(normalize_destinations(&input).is_err());
    }

    #[test]
    fn normalize_collapses_all_with_other_names() {
        let input = vec!["all".to_string(), "x".to_string()];
        let out = normalize_destinations(&input).unwrap();
        assert_eq!(out, vec!["all"]);
    }

    #[test]
    fn join_topic_wraps_each_destination() {
        let dests = vec!["a".to_string(), "b".to_string()];
        assert_eq!(join_topic(&dests), "|a|b|");
    }
}
