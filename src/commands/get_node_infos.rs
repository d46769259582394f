//! `GetNodeInfos`: reports the receiving node's id and live response-handler
//! count. Has no declared option fields — it carries no state of its own.

use serde_json::{json, Map, Value};

use crate::command::{BoxFuture, Command, CommandType, Outcome};
use crate::error::CodecError;
use crate::node::Node;

#[derive(Debug, Default, Clone, Copy)]
pub struct GetNodeInfos;

impl Command for GetNodeInfos {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode_fields(&self) -> Map<String, Value> {
        Map::new()
    }

    fn execute<'a>(&'a self, ctx: &'a Node) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            Outcome::from(json!({
                "nid": ctx.nid(),
                "num_response_handlers": ctx.num_response_handlers(),
            }))
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CommandType for GetNodeInfos {
    const NAME: &'static str = "__cmd_get_node_infos__";

    fn decode_fields(_fields: Map<String, Value>) -> Result<Self, CodecError> {
        Ok(GetNodeInfos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_no_declared_fields() {
        assert!(GetNodeInfos.encode_fields().is_empty());
    }
}
