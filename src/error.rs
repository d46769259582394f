//! Error taxonomy shared across the codec, broker adapter, and node runtime.
//!
//! Each variant below names one error kind independent of which component
//! raised it, so callers can match on the kind rather than a string.

use std::fmt;

/// Errors raised by the codec: encoding/decoding commands and
/// maintaining the name → type registry.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("command carries a field that cannot be serialized: {0}")]
    UnsupportedObject(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("command not registered: {0}")]
    CommandNotRegistered(String),

    #[error("command name already registered with a different type: {0}")]
    CommandHasRegistered(String),
}

/// Errors raised by a [`crate::broker::BrokerAdapter`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("operation requires a connected adapter")]
    NotConnected,

    #[error("server disconnected: {0}")]
    ServerDisconnected(String),

    #[error("invalid channel name {0:?}: must not contain '|'")]
    InvalidChannel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

/// Errors surfaced by the [`crate::node::Node`] runtime.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no context registered for command {0:?}")]
    ContextNotFound(String),

    #[error("response_handler and response_timeout are mutually exclusive")]
    ConflictingHandlerArgs,

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(usize),
}

/// Wraps a panic or error raised from a command's `execute`, as passed to
/// the node's `error_handler` in `recv_until_close`. Never escapes the recv
/// loop.
pub struct CommandExecutionError {
    /// `__cmd_name__` of the command whose execution failed.
    pub cmd_name: String,
    pub cause: Box<dyn std::error::Error + Send + Sync>,
}

impl fmt::Debug for CommandExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutionError")
            .field("cmd_name", &self.cmd_name)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for CommandExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {:?} raised: {}", self.cmd_name, self.cause)
    }
}

impl std::error::Error for CommandExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}
