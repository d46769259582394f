//! Response handlers: per-correlation-id result aggregation with pluggable
//! finalization strategies.
//!
//! Readers that want to consume responses as they arrive rather than wait
//! for finalization use [`ResponseAggregator::notified`]/
//! [`ResponseAggregator::pop_front`] instead of blocking a thread on a
//! semaphore — the async equivalent of polling with a timeout, without
//! tying up a worker while idle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;

/// How a [`ResponseHandler`] decides it has heard enough and should stop
/// accepting/waiting for responses. Implementors only need to answer
/// "should I finalize now", matching the original's `finalize_internal`.
pub trait ResponseHandler: Send + Sync {
    /// Records one more response for this correlation id.
    fn add_response(&self, response: Value);

    /// Number of responses recorded so far.
    fn num_received(&self) -> usize;

    /// The number of receivers this command was published to, if known
    /// (set once `send`'s publish call returns a receiver count).
    fn set_num_receivers(&self, n: Option<i64>);

    /// Called by the sweeper on every tick; returns `true` once this
    /// handler should be considered done and removed from the node's
    /// handler map.
    fn finalize_internal(&self) -> bool;

    /// `true` once [`ResponseHandler::finalize_internal`] has returned
    /// `true` at least once.
    fn is_finalized(&self) -> bool;

    /// Snapshots all responses received so far, if finalized; `None`
    /// means "not finalized yet, caller should keep waiting" (the
    /// blocking `get()` in the original; here the caller awaits
    /// [`ResponseAggregator::wait_until_finalized`] first).
    fn snapshot(&self) -> Vec<Value>;
}

/// Core bookkeeping shared by every strategy: the FIFO result buffer, the
/// received/expected counts, and the finalized latch. Strategies embed this
/// and add their own `finalize_internal` policy.
pub struct ResponseAggregator {
    results: Mutex<VecDeque<Value>>,
    num_received: AtomicUsize,
    num_receivers: Mutex<Option<i64>>,
    finalized: AtomicBool,
    notify: Notify,
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            num_received: AtomicUsize::new(0),
            num_receivers: Mutex::new(None),
            finalized: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn add_response(&self, response: Value) {
        self.results.lock().expect("aggregator lock poisoned").push_back(response);
        self.num_received.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn num_received(&self) -> usize {
        self.num_received.load(Ordering::SeqCst)
    }

    pub fn num_receivers(&self) -> Option<i64> {
        *self.num_receivers.lock().expect("aggregator lock poisoned")
    }

    pub fn set_num_receivers(&self, n: Option<i64>) {
        *self.num_receivers.lock().expect("aggregator lock poisoned") = n;
    }

    pub fn mark_finalized(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<Value> {
        self.results.lock().expect("aggregator lock poisoned").iter().cloned().collect()
    }

    /// Pops the next buffered response, if any. Callers that stream
    /// responses this way rather than waiting for [`ResponseAggregator::snapshot`]
    /// must check [`ResponseAggregator::is_finalized`] themselves to know
    /// when no more responses are coming — a result already drained here
    /// makes a later `snapshot()` call incomplete by construction.
    pub fn pop_front(&self) -> Option<Value> {
        self.results.lock().expect("aggregator lock poisoned").pop_front()
    }

    /// Waits until either a new response arrives or the handler finalizes.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Finalizes once every expected receiver has responded, or a deadline
/// passes — equivalent to `BlockUntilAllReceived`. With no receiver count
/// and no deadline the handler can never finalize on its own; the sweeper
/// still force-finalizes it after one tick and logs a warning (the
/// original's "This response handler has DROPPED" case).
pub struct BlockUntilAllReceived {
    inner: ResponseAggregator,
    deadline: Option<Instant>,
    warned_undroppable: AtomicBool,
}

impl BlockUntilAllReceived {
    pub fn new(timeout: Option<Duration>) -> Self {
        if timeout.is_none() {
            tracing::warn!("response handler created with no timeout: may never finalize on its own");
        }
        Self {
            inner: ResponseAggregator::new(),
            deadline: timeout.map(|d| Instant::now() + d),
            warned_undroppable: AtomicBool::new(false),
        }
    }

    fn past_deadline(&self) -> bool {
        self.deadline.map(|d| Instant::now() > d).unwrap_or(false)
    }
}

impl ResponseHandler for BlockUntilAllReceived {
    fn add_response(&self, response: Value) {
        self.inner.add_response(response);
    }

    fn num_received(&self) -> usize {
        self.inner.num_received()
    }

    fn set_num_receivers(&self, n: Option<i64>) {
        self.inner.set_num_receivers(n);
    }

    fn finalize_internal(&self) -> bool {
        let num_receivers = self.inner.num_receivers();
        if num_receivers.is_none() && self.deadline.is_none() {
            if !self.warned_undroppable.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "response handler has no receiver count or timeout; force-finalizing to avoid leaking forever"
                );
            }
            self.inner.mark_finalized();
            return true;
        }
        let enough = num_receivers
            .map(|n| self.inner.num_received() as i64 >= n)
            .unwrap_or(false);
        if enough || self.past_deadline() {
            self.inner.mark_finalized();
            true
        } else {
            false
        }
    }

    fn is_finalized(&self) -> bool {
        self.inner.is_finalized()
    }

    fn snapshot(&self) -> Vec<Value> {
        self.inner.snapshot()
    }
}

/// Like [`BlockUntilAllReceived`], but every new response pushes the
/// deadline forward by `timeout` instead of leaving it fixed — useful for
/// streaming/fan-in commands where the sender only cares that responses
/// have stopped arriving, not that a fixed clock has elapsed.
pub struct UpdateTimeoutPerReceive {
    inner: ResponseAggregator,
    timeout: Duration,
    deadline: Mutex<Instant>,
}

impl UpdateTimeoutPerReceive {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: ResponseAggregator::new(),
            timeout,
            deadline: Mutex::new(Instant::now() + timeout),
        }
    }
}

impl ResponseHandler for UpdateTimeoutPerReceive {
    fn add_response(&self, response: Value) {
        self.inner.add_response(response);
        *self.deadline.lock().expect("deadline lock poisoned") = Instant::now() + self.timeout;
    }

    fn num_received(&self) -> usize {
        self.inner.num_received()
    }

    fn set_num_receivers(&self, n: Option<i64>) {
        self.inner.set_num_receivers(n);
    }

    fn finalize_internal(&self) -> bool {
        let num_receivers = self.inner.num_receivers();
        let enough = num_receivers
            .map(|n| self.inner.num_received() as i64 >= n)
            .unwrap_or(false);
        let past_deadline = Instant::now() > *self.deadline.lock().expect("deadline lock poisoned");
        if enough || past_deadline {
            self.inner.mark_finalized();
            true
        } else {
            false
        }
    }

    fn is_finalized(&self) -> bool {
        self.inner.is_finalized()
    }

    fn snapshot(&self) -> Vec<Value> {
        self.inner.snapshot()
    }
}

/// Invokes `callback` synchronously on every response as it arrives, after
/// it has been enqueued, in addition to the usual buffering/finalization
/// behavior of [`BlockUntilAllReceived`] — a callback that inspects
/// `num_received()`/`snapshot()` on its own handler sees this response
/// already reflected.
pub struct Callback {
    base: BlockUntilAllReceived,
    callback: Box<dyn Fn(&Value) + Send + Sync>,
}

impl Callback {
    pub fn new(timeout: Option<Duration>, callback: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        Self {
            base: BlockUntilAllReceived::new(timeout),
            callback: Box::new(callback),
        }
    }
}

impl ResponseHandler for Callback {
    fn add_response(&self, response: Value) {
        self.base.add_response(response.clone());
        (self.callback)(&response);
    }

    fn num_received(&self) -> usize {
        self.base.num_received()
    }

    fn set_num_receivers(&self, n: Option<i64>) {
        self.base.set_num_receivers(n);
    }

    fn finalize_internal(&self) -> bool {
        self.base.finalize_internal()
    }

    fn is_finalized(&self) -> bool {
        self.base.is_finalized()
    }

    fn snapshot(&self) -> Vec<Value> {
        self.base.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_until_all_received_finalizes_on_count() {
        let h = BlockUntilAllReceived::new(Some(Duration::from_secs(60)));
        h.set_num_receivers(Some(2));
        h.add_response(json!(1));
        assert!(!h.finalize_internal());
        h.add_response(json!(2));
        assert!(h.finalize_internal());
        assert!(h.is_finalized());
        assert_eq!(h.snapshot(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn block_until_all_received_finalizes_on_deadline() {
        let h = BlockUntilAllReceived::new(Some(Duration::from_millis(1)));
        h.set_num_receivers(Some(5));
        std::thread::sleep(Duration::from_millis(5));
        assert!(h.finalize_internal());
    }

    #[test]
    fn undroppable_handler_force_finalizes_immediately() {
        let h = BlockUntilAllReceived::new(None);
        assert!(h.finalize_internal());
        assert!(h.is_finalized());
    }

    #[test]
    fn update_timeout_per_receive_extends_deadline() {
        let h = UpdateTimeoutPerReceive::new(Duration::from_millis(20));
        h.set_num_receivers(None);
        assert!(!h.finalize_internal());
        h.add_response(json!("partial"));
        assert!(!h.finalize_internal());
        std::thread::sleep(Duration::from_millis(30));
        assert!(h.finalize_internal());
    }

    #[test]
    fn callback_invoked_on_each_response() {
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let h = Callback::new(Some(Duration::from_secs(1)), move |v| {
            seen2.lock().unwrap().push(v.clone());
        });
        h.add_response(json!("a"));
        h.add_response(json!("b"));
        assert_eq!(*seen.lock().unwrap(), vec![json!("a"), json!("b")]);
    }
}
