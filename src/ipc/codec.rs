//! JSON codec and command registry: a registry guarded by its own lock,
//! with `encode`/`decode` as the two public operations.
//!
//! The wire format is UTF-8 JSON: a `__cmd_name__` tag alongside the
//! command's declared option fields.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::command::{Command, CommandType};
use crate::error::CodecError;

const CMD_NAME_TAG: &str = "__cmd_name__";

type DecodeFn = Box<dyn Fn(serde_json::Map<String, Value>) -> Result<Box<dyn Command>, CodecError> + Send + Sync>;

struct RegistryEntry {
    type_id: std::any::TypeId,
    decode: DecodeFn,
}

/// Maintains the open name → type registry and implements the
/// encode/decode round trip.
///
/// `Mutex`-guarded rather than `RwLock`: registrations are rare (at
/// `connect`/`register_cmd` time) and decodes are quick, so reader/writer
/// bookkeeping would only add overhead without reducing contention.
pub struct Codec {
    registry: Mutex<HashMap<&'static str, RegistryEntry>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `T` under `T::NAME`. Registering the same name with a
    /// different concrete type is an error (`CommandHasRegistered`);
    /// re-registering the same type under the same name is a no-op,
    /// matching `JSONSerializer.register_cmd`'s identity check.
    pub fn register<T: CommandType + 'static>(&self) -> Result<(), CodecError> {
        let mut registry = self.registry.lock().expect("codec registry lock poisoned");
        let type_id = std::any::TypeId::of::<T>();
        if let Some(existing) = registry.get(T::NAME) {
            if existing.type_id != type_id {
                return Err(CodecError::CommandHasRegistered(T::NAME.to_string()));
            }
            return Ok(());
        }
        registry.insert(
            T::NAME,
            RegistryEntry {
                type_id,
                decode: Box::new(|fields| T::decode_fields(fields).map(|c| Box::new(c) as Box<dyn Command>)),
            },
        );
        Ok(())
    }

    /// Encodes a command's declared option fields plus its `__cmd_name__`
    /// tag into a single JSON object — the in-memory form a
    /// [`crate::commands::CommandWrapper`] embeds its inner command as.
    pub fn encode_to_map(&self, cmd: &dyn Command) -> serde_json::Map<String, Value> {
        let mut fields = cmd.encode_fields();
        fields.insert(CMD_NAME_TAG.to_string(), Value::String(cmd.name().to_string()));
        fields
    }

    /// Serializes a command to its wire bytes: the declared option fields
    /// plus the `__cmd_name__` tag, as a single JSON object.
    pub fn encode(&self, cmd: &dyn Command) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&Value::Object(self.encode_to_map(cmd)))
            .map_err(|e| CodecError::UnsupportedObject(e.to_string()))
    }

    /// Decodes an already-parsed JSON object back into a registered
    /// command, looking up its concrete type by the `__cmd_name__` tag.
    pub fn decode_map(&self, mut map: serde_json::Map<String, Value>) -> Result<Box<dyn Command>, CodecError> {
        let name = match map.remove(CMD_NAME_TAG) {
            Some(Value::String(s)) => s,
            Some(_) | None => {
                return Err(CodecError::InvalidFormat(format!(
                    "missing or non-string {CMD_NAME_TAG:?}"
                )))
            }
        };
        let registry = self.registry.lock().expect("codec registry lock poisoned");
        let entry = registry
            .get(name.as_str())
            .ok_or_else(|| CodecError::CommandNotRegistered(name.clone()))?;
        (entry.decode)(map)
    }

    /// Decodes wire bytes back into a registered command, looking up its
    /// concrete type by the `__cmd_name__` tag.
    pub fn decode(&self, raw: &[u8]) -> Result<Box<dyn Command>, CodecError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| CodecError::InvalidFormat(e.to_string()))?;
        let map = match value {
            Value::Object(map) => map,
            other => return Err(CodecError::InvalidFormat(format!("expected a JSON object, got {other}"))),
        };
        self.decode_map(map)
    }

    /// `true` if a name has been registered — used by the node to decide
    /// whether an incoming command is dispatchable before logging a
    /// warning and dropping it.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry
            .lock()
            .expect("codec registry lock poisoned")
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BoxFuture, NoResponseType, Outcome};
    use crate::node::Node;
    use serde_json::json;

    #[derive(Debug)]
    struct Ping {
        nonce: u32,
    }

    impl Command for Ping {
        fn name(&self) -> &'static str {
            "ping"
        }

        fn encode_fields(&self) -> serde_json::Map<String, Value> {
            let mut m = serde_json::Map::new();
            m.insert("nonce".to_string(), json!(self.nonce));
            m
        }

        fn execute<'a>(&'a self, _ctx: &'a Node) -> BoxFuture<'a, Outcome> {
            Box::pin(async move { Outcome::from(NoResponseType) })
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    impl CommandType for Ping {
        const NAME: &'static str = "ping";

        fn decode_fields(mut fields: serde_json::Map<String, Value>) -> Result<Self, CodecError> {
            let nonce = fields
                .remove("nonce")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| CodecError::InvalidFormat("ping.nonce missing".into()))?;
            Ok(Ping { nonce: nonce as u32 })
        }
    }

    #[test]
    fn round_trips_a_registered_command() {
        let codec = Codec::new();
        codec.register::<Ping>().unwrap();
        let encoded = codec.encode(&Ping { nonce: 7 }).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.name(), "ping");
        let ping = decoded.as_any().downcast_ref::<Ping>().unwrap();
        assert_eq!(ping.nonce, 7);
    }

    #[test]
    fn decode_rejects_unregistered_name() {
        let codec = Codec::new();
        let raw = serde_json::to_vec(&json!({"__cmd_name__": "nope"})).unwrap();
        assert!(matches!(
            codec.decode(&raw),
            Err(CodecError::CommandNotRegistered(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_tag() {
        let codec = Codec::new();
        let raw = serde_json::to_vec(&json!({"nonce": 1})).unwrap();
        assert!(matches!(codec.decode(&raw), Err(CodecError::InvalidFormat(_))));
    }

    #[test]
    fn register_same_type_twice_is_a_no_op() {
        let codec = Codec::new();
        codec.register::<Ping>().unwrap();
        assert!(codec.register::<Ping>().is_ok());
    }

    #[test]
    fn is_registered_reflects_registry_state() {
        let codec = Codec::new();
        assert!(!codec.is_registered("ping"));
        codec.register::<Ping>().unwrap();
        assert!(codec.is_registered("ping"));
    }
}
