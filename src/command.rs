//! The command abstraction: a record with a stable name, encoded options,
//! and an `execute(ctx)` function.
//!
//! Implemented as a trait object rather than an enum because the set of
//! command types is open — user code registers its own alongside the
//! built-ins in [`crate::commands`], and new variants must not require
//! touching this module.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use crate::node::Node;

/// A boxed, `Send` future — the manual equivalent of what `async-trait`
/// generates, used here only where trait objects (not generics) are
/// required: [`Command::execute`] is dispatched dynamically from the
/// codec's registry, so it cannot be a generic `async fn`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sentinel return value signalling that a command has nothing to return.
/// Distinct from "returned `null`" — a command that legitimately wants to
/// reply with JSON `null` should return `Outcome::Response(Value::Null)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoResponseType;

/// The result of executing a command's body.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing is routed back to the sender.
    NoResponse,
    /// This value is wrapped in an `AddResponse` and routed to the sender.
    Response(Value),
}

impl From<NoResponseType> for Outcome {
    fn from(_: NoResponseType) -> Self {
        Outcome::NoResponse
    }
}

impl From<Value> for Outcome {
    fn from(v: Value) -> Self {
        Outcome::Response(v)
    }
}

/// A registered command type: a stable name, a set of declared "option"
/// fields that round-trip through the codec, and a body executed on the
/// receiving node.
///
/// Implementors should derive `Serialize`/`Deserialize` for their option
/// fields and implement [`Command::name`]/[`Command::encode_fields`] in
/// terms of that derive — see [`crate::commands::get_node_infos::GetNodeInfos`]
/// for the minimal shape.
pub trait Command: Any + Send + Sync + fmt::Debug {
    /// The command's `__cmd_name__` — stable across the wire.
    fn name(&self) -> &'static str;

    /// Encode this command's declared option fields as a JSON object,
    /// excluding `__cmd_name__` itself (the codec adds that). Only
    /// declared option fields are emitted — derived/lazy fields are
    /// recomputed on decode instead of round-tripped over the wire.
    fn encode_fields(&self) -> Map<String, Value>;

    /// Run this command's body against the receiving node's context and
    /// produce an [`Outcome`].
    fn execute<'a>(&'a self, ctx: &'a Node) -> BoxFuture<'a, Outcome>;

    /// Upcast for downstream code that needs to recover a concrete type
    /// (e.g. the wrapper's loopback shortcut never needs this, but test
    /// code and `get_cmd_context` callers sometimes do).
    fn as_any(&self) -> &dyn Any;
}

/// A command type usable with the registry: constructible from its own
/// decoded field map. Kept as a separate trait from [`Command`] (rather
/// than a `fn new` on `Command` itself) so `Command` stays object-safe.
pub trait CommandType: Command + Sized {
    /// The wire name this type registers under. Must equal
    /// `Self::default().name()` for any constructed instance — the codec
    /// enforces this is consistent by construction, not by assertion.
    const NAME: &'static str;

    /// Build an instance from its decoded field map (the inverse of
    /// [`Command::encode_fields`]).
    fn decode_fields(fields: Map<String, Value>) -> Result<Self, crate::error::CodecError>;
}
