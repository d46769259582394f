//! A distributed command bus layered over a pub/sub broker.
//!
//! Processes ("nodes") exchange typed commands addressed to logical
//! channels over a Redis-like broker; a command may return zero or more
//! responses back to its sender, collected by a pluggable response
//! handler. See [`node::Node`] for the runtime entry point and
//! [`broker::BrokerAdapter`] for the transport seam.

pub mod broker;
pub mod command;
pub mod commands;
pub mod error;
pub mod handler;
pub mod ipc;
pub mod node;
pub mod testing;

pub use command::{Command, CommandType, NoResponseType, Outcome};
pub use error::{BrokerError, CodecError, CommandExecutionError, NodeError};
pub use handler::{BlockUntilAllReceived, Callback, ResponseHandler, UpdateTimeoutPerReceive};
pub use node::{Node, RecvUntilCloseOptions};
