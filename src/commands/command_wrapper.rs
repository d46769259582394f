//! `CommandWrapper`: the envelope every `send`/`send_no_response` call puts
//! a user command inside, carrying the sender's `nid` and the
//! correlation id it expects replies tagged with.

use serde_json::{Map, Value};

use crate::command::{BoxFuture, Command, CommandType, NoResponseType, Outcome};
use crate::commands::add_response::AddResponse;
use crate::error::CodecError;
use crate::node::Node;

#[derive(Debug, Clone)]
pub struct CommandWrapper {
    pub nid: String,
    pub cid: String,
    pub cmd: Map<String, Value>,
}

impl CommandWrapper {
    /// Builds a wrapper around an already-encoded inner command map
    /// (see [`crate::ipc::codec::Codec::encode_to_map`]).
    pub fn new(nid: String, cid: String, cmd: Map<String, Value>) -> Self {
        Self { nid, cid, cmd }
    }
}

impl Command for CommandWrapper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode_fields(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("nid".to_string(), Value::String(self.nid.clone()));
        m.insert("cid".to_string(), Value::String(self.cid.clone()));
        m.insert("cmd".to_string(), Value::Object(self.cmd.clone()));
        m
    }

    fn execute<'a>(&'a self, ctx: &'a Node) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let codec = match ctx.wrapper_codec() {
                Ok(codec) => codec,
                Err(e) => {
                    tracing::error!(error = %e, "wrapper has no registered codec context");
                    return Outcome::from(NoResponseType);
                }
            };
            let inner = match codec.decode_map(self.cmd.clone()) {
                Ok(cmd) => cmd,
                Err(e) => {
                    tracing::warn!(error = %e, cid = %self.cid, "wrapped command failed to decode");
                    return Outcome::from(NoResponseType);
                }
            };
            let response = inner.execute(ctx).await;
            if let Outcome::Response(value) = response {
                if self.nid == ctx.nid() {
                    ctx.add_response(&self.cid, value);
                } else {
                    let reply = AddResponse {
                        cid: self.cid.clone(),
                        response: value,
                    };
                    if let Err(e) = ctx.send_no_response(&reply, &[self.nid.clone()]).await {
                        tracing::warn!(error = %e, nid = %self.nid, "failed to route response back to sender");
                    }
                }
            }
            Outcome::from(NoResponseType)
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CommandType for CommandWrapper {
    const NAME: &'static str = "__cmd_wrapper__";

    fn decode_fields(mut fields: Map<String, Value>) -> Result<Self, CodecError> {
        let nid = match fields.remove("nid") {
            Some(Value::String(s)) => s,
            _ => return Err(CodecError::InvalidFormat("wrapper.nid missing".into())),
        };
        let cid = match fields.remove("cid") {
            Some(Value::String(s)) => s,
            _ => return Err(CodecError::InvalidFormat("wrapper.cid missing".into())),
        };
        let cmd = match fields.remove("cmd") {
            Some(Value::Object(m)) => m,
            _ => return Err(CodecError::InvalidFormat("wrapper.cmd missing".into())),
        };
        Ok(CommandWrapper { nid, cid, cmd })
    }
}
