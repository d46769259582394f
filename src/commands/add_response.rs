//! `AddResponse`: delivers a reply back to the node that sent the original
//! command.

use serde_json::{Map, Value};

use crate::command::{BoxFuture, Command, CommandType, NoResponseType, Outcome};
use crate::error::CodecError;
use crate::node::Node;

#[derive(Debug, Clone)]
pub struct AddResponse {
    pub cid: String,
    pub response: Value,
}

impl Command for AddResponse {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode_fields(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("cid".to_string(), Value::String(self.cid.clone()));
        m.insert("response".to_string(), self.response.clone());
        m
    }

    fn execute<'a>(&'a self, ctx: &'a Node) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            ctx.add_response(&self.cid, self.response.clone());
            Outcome::from(NoResponseType)
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CommandType for AddResponse {
    const NAME: &'static str = "__cmd_add_response__";

    fn decode_fields(mut fields: Map<String, Value>) -> Result<Self, CodecError> {
        let cid = match fields.remove("cid") {
            Some(Value::String(s)) => s,
            _ => return Err(CodecError::InvalidFormat("add_response.cid missing".into())),
        };
        let response = fields
            .remove("response")
            .ok_or_else(|| CodecError::InvalidFormat("add_response.response missing".into()))?;
        Ok(AddResponse { cid, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let cmd = AddResponse {
            cid: "42".to_string(),
            response: json!({"ok": true}),
        };
        let fields = cmd.encode_fields();
        let decoded = AddResponse::decode_fields(fields).unwrap();
        assert_eq!(decoded.cid, "42");
        assert_eq!(decoded.response, json!({"ok": true}));
    }
}
