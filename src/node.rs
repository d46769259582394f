//! The node runtime: identity, channel membership, send/recv, the
//! worker-pool-backed `recv_until_close` loop, and the command-context map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::broker::BrokerAdapter;
use crate::command::{Command, CommandType};
use crate::commands::{AddResponse, CommandWrapper, GetNodeInfos};
use crate::error::{BrokerError, CommandExecutionError, CodecError, NodeError};
use crate::handler::{BlockUntilAllReceived, ResponseHandler};
use crate::ipc::codec::Codec;

const WRAPPER_CONTEXT_NAME: &str = "__cmd_wrapper__";

/// How often the sweeper snapshots the handler map and finalizes entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Options for [`Node::recv_until_close`].
#[derive(Clone)]
pub struct RecvUntilCloseOptions {
    pub sleep: Duration,
    pub num_workers: usize,
    pub close_when_exit: bool,
    pub reconnect_max_tries: usize,
    pub reconnect_interval: Duration,
    pub error_handler: Arc<dyn Fn(CommandExecutionError) + Send + Sync>,
}

impl Default for RecvUntilCloseOptions {
    fn default() -> Self {
        Self {
            sleep: Duration::from_millis(500),
            num_workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).max(3),
            close_when_exit: true,
            reconnect_max_tries: 10,
            reconnect_interval: Duration::from_secs(10),
            error_handler: Arc::new(default_error_handler),
        }
    }
}

fn default_error_handler(err: CommandExecutionError) {
    tracing::error!(cmd_name = %err.cmd_name, error = %err, "command execution failed");
}

#[derive(Debug)]
struct PanicCause(String);

impl std::fmt::Display for PanicCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PanicCause {}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command panicked with a non-string payload".to_string()
    }
}

/// A connected (or not-yet-connected) participant on the bus.
///
/// Held behind `Arc` in all normal use — `connect`/`recv_until_close` spawn
/// tasks (sweeper, worker pool) that need to outlive the calling stack
/// frame, so `Node` is always used as `Arc<Node>`.
pub struct Node {
    broker: Arc<dyn BrokerAdapter>,
    codec: Arc<Codec>,
    nid: Mutex<Option<String>>,
    handlers: Mutex<HashMap<String, Arc<dyn ResponseHandler>>>,
    contexts: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    cid_counter: AtomicU64,
    closed: AtomicBool,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Builds a node over `broker`, registering the built-in commands
    /// (`CommandWrapper`, `AddResponse`, `GetNodeInfos`) exactly as
    /// `Node.__init__` does.
    pub fn new(broker: Arc<dyn BrokerAdapter>) -> Result<Arc<Self>, NodeError> {
        Self::with_sweep_interval(broker, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(
        broker: Arc<dyn BrokerAdapter>,
        sweep_interval: Duration,
    ) -> Result<Arc<Self>, NodeError> {
        let codec = Arc::new(Codec::new());
        let node = Arc::new(Self {
            broker,
            codec: codec.clone(),
            nid: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            cid_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            sweep_interval,
            sweeper: Mutex::new(None),
        });

        node.register_cmd::<CommandWrapper>(Some(codec as Arc<dyn Any + Send + Sync>))?;
        node.register_cmd::<AddResponse>(None)?;
        node.register_cmd::<GetNodeInfos>(None)?;
        Ok(node)
    }

    /// The codec backing this node — `CommandWrapper` prefers reaching the
    /// codec through [`Node::get_cmd_context`], but this is exposed for
    /// convenience/tests.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// This node's id. Panics if called before `connect` — commands only
    /// ever execute on a connected node, so this invariant always holds at
    /// the call sites that use it.
    pub fn nid(&self) -> String {
        self.nid
            .lock()
            .expect("nid lock poisoned")
            .clone()
            .expect("Node::nid called before connect")
    }

    fn nid_opt(&self) -> Option<String> {
        self.nid.lock().expect("nid lock poisoned").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connects to the broker, joins `nid` and `"all"`, and starts the
    /// sweeper. A second call (including after `close`) logs a warning and
    /// is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.nid_opt().is_some() {
            tracing::warn!("connect called on an already-connected (or closed) node, ignoring");
            return Ok(());
        }
        let nid = self.broker.connect().await?;
        *self.nid.lock().expect("nid lock poisoned") = Some(nid.clone());
        self.join(&nid).await?;
        self.join(crate::broker::BROADCAST_NAME).await?;
        self.start_sweeper();
        Ok(())
    }

    fn start_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(node) = weak.upgrade() else { break };
                if node.is_closed() {
                    break;
                }
                let mut handlers = node.handlers.lock().expect("handler map lock poisoned");
                handlers.retain(|_, h| !h.finalize_internal());
            }
        });
        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);
    }

    /// Idempotent teardown. Safe to call more than once.
    pub async fn close(&self) -> Result<(), NodeError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().expect("sweeper lock poisoned").take() {
            handle.abort();
        }
        self.broker.close().await?;
        Ok(())
    }

    pub async fn join(&self, name: &str) -> Result<(), NodeError> {
        self.broker.join(name).await.map_err(Into::into)
    }

    pub async fn leave(&self, name: &str) -> Result<(), NodeError> {
        self.broker.leave(name).await.map_err(Into::into)
    }

    fn generate_cid(&self) -> String {
        self.cid_counter.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Registers a command type in the codec and, if given, its execution
    /// context (looked up later via [`Node::get_cmd_context`]).
    pub fn register_cmd<T: CommandType + 'static>(
        &self,
        ctx: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<(), CodecError> {
        self.codec.register::<T>()?;
        if let Some(ctx) = ctx {
            self.contexts
                .lock()
                .expect("context map lock poisoned")
                .insert(T::NAME.to_string(), ctx);
        }
        Ok(())
    }

    pub fn get_cmd_context(&self, name: &str) -> Result<Arc<dyn Any + Send + Sync>, NodeError> {
        self.contexts
            .lock()
            .expect("context map lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::ContextNotFound(name.to_string()))
    }

    /// The codec registered as `CommandWrapper`'s execution context, used
    /// by [`CommandWrapper::execute`](crate::commands::CommandWrapper) to
    /// lazily decode its payload.
    pub fn wrapper_codec(&self) -> Result<Arc<Codec>, NodeError> {
        let any = self.get_cmd_context(WRAPPER_CONTEXT_NAME)?;
        any.downcast::<Codec>()
            .map_err(|_| NodeError::ContextNotFound(WRAPPER_CONTEXT_NAME.to_string()))
    }

    /// Sends `cmd` to `destinations`, wrapping it in a `CommandWrapper` and
    /// registering a response handler under a freshly allocated `cid`.
    /// Supplying both `response_handler` and `response_timeout` is an
    /// error.
    pub async fn send(
        self: &Arc<Self>,
        cmd: &dyn Command,
        destinations: &[String],
        response_handler: Option<Arc<dyn ResponseHandler>>,
        response_timeout: Option<Duration>,
    ) -> Result<Arc<dyn ResponseHandler>, NodeError> {
        if response_handler.is_some() && response_timeout.is_some() {
            return Err(NodeError::ConflictingHandlerArgs);
        }
        let cid = self.generate_cid();
        let nid = self.nid();
        let cmd_map = self.codec.encode_to_map(cmd);
        let wrapper = CommandWrapper::new(nid, cid.clone(), cmd_map);

        let handler: Arc<dyn ResponseHandler> = response_handler
            .unwrap_or_else(|| Arc::new(BlockUntilAllReceived::new(response_timeout)));

        let num_receivers = self.send_no_response(&wrapper, destinations).await?;
        handler.set_num_receivers(num_receivers);
        self.handlers
            .lock()
            .expect("handler map lock poisoned")
            .insert(cid, handler.clone());
        Ok(handler)
    }

    /// Encodes and publishes `cmd` without registering a response handler.
    /// Destination normalization (dedupe, `"all"` collapse) happens inside
    /// the broker adapter.
    pub async fn send_no_response(&self, cmd: &dyn Command, destinations: &[String]) -> Result<Option<i64>, NodeError> {
        let data = self.codec.encode(cmd)?;
        self.broker.send(data, destinations).await.map_err(Into::into)
    }

    /// Receives and decodes one command. `None` on timeout.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Option<Box<dyn Command>>, NodeError> {
        match self.broker.recv(timeout).await? {
            Some(raw) => Ok(Some(self.codec.decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Routes a response to the handler registered under `cid`, called by
    /// `AddResponse::execute` and by `CommandWrapper`'s loopback shortcut.
    /// Logs at WARNING (with the value truncated to 50 chars) when no
    /// handler is registered — a late reply, or one that raced ahead of
    /// `send`'s own handler registration.
    pub fn add_response(&self, cid: &str, value: Value) {
        let handler = self.handlers.lock().expect("handler map lock poisoned").get(cid).cloned();
        match handler {
            Some(h) => h.add_response(value),
            None => {
                let mut rendered = value.to_string();
                if rendered.len() > 50 {
                    rendered.truncate(50);
                    rendered.push_str("...");
                }
                tracing::warn!(cid, response = %rendered, "received response but command not found");
            }
        }
    }

    /// Live (not-yet-swept) response handler count, as surfaced by
    /// `GetNodeInfos`.
    pub fn num_response_handlers(&self) -> usize {
        self.handlers.lock().expect("handler map lock poisoned").len()
    }

    /// Attempts `reconnect` on the adapter up to `max_tries` times,
    /// `interval` apart, returning `true` on the first success.
    async fn reconnect_loop(&self, max_tries: usize, interval: Duration) -> bool {
        for attempt in 1..=max_tries {
            match self.broker.reconnect().await {
                Ok(()) => {
                    tracing::warn!(attempt, "server reconnected");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
            tokio::time::sleep(interval).await;
        }
        false
    }

    /// The main event loop: a single-threaded `recv` loop that submits
    /// each decoded command's `execute` to an `num_workers`-bounded pool,
    /// reconnecting on broker disconnection and funneling command panics
    /// into `error_handler` without ever terminating the loop itself.
    pub async fn recv_until_close(self: Arc<Self>, opts: RecvUntilCloseOptions) -> Result<(), NodeError> {
        let semaphore = Arc::new(Semaphore::new(opts.num_workers.max(1)));
        let result = self.recv_until_close_inner(&opts, &semaphore).await;
        if opts.close_when_exit {
            self.close().await?;
        }
        result
    }

    async fn recv_until_close_inner(
        self: &Arc<Self>,
        opts: &RecvUntilCloseOptions,
        semaphore: &Arc<Semaphore>,
    ) -> Result<(), NodeError> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            match self.recv(Some(opts.sleep)).await {
                Ok(Some(cmd)) => self.dispatch(cmd, semaphore.clone(), opts.error_handler.clone()),
                Ok(None) => {}
                Err(NodeError::Codec(e)) => {
                    tracing::error!(error = %e, "failed to decode incoming command");
                }
                Err(NodeError::Broker(e)) if is_connection_error(&e) => {
                    if self.is_closed() {
                        return Ok(());
                    }
                    if !self.reconnect_loop(opts.reconnect_max_tries, opts.reconnect_interval).await {
                        return Err(NodeError::Broker(BrokerError::ServerDisconnected(
                            "reconnect attempts exhausted".to_string(),
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        cmd: Box<dyn Command>,
        semaphore: Arc<Semaphore>,
        error_handler: Arc<dyn Fn(CommandExecutionError) + Send + Sync>,
    ) {
        let node = self.clone();
        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let cmd_name = cmd.name().to_string();
            let outcome = std::panic::AssertUnwindSafe(cmd.execute(&node)).catch_unwind().await;
            drop(permit);
            if let Err(panic) = outcome {
                let cause = PanicCause(panic_message(panic.as_ref()));
                (error_handler)(CommandExecutionError {
                    cmd_name,
                    cause: Box::new(cause),
                });
            }
        });
    }
}

fn is_connection_error(e: &BrokerError) -> bool {
    matches!(
        e,
        BrokerError::NotConnected | BrokerError::ServerDisconnected(_) | BrokerError::ConnectionFailed(_)
    )
}
