//! Commands that flow through the replicated log.
//!
//! The wire form is a small JSON object, the same payload a client posts to
//! `/apply`:
//!
//! ```json
//! {"op": "set", "key": "x", "value": "1"}
//! {"op": "delete", "key": "x"}
//! ```
//!
//! The serialized bytes are what the leader proposes, so every replica decodes
//! and validates the exact same input. Validation is deterministic, which means
//! a rejected entry is rejected identically everywhere and the tables never
//! diverge.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

const OP_SET: &str = "set";
const OP_DELETE: &str = "delete";
const OP_DELETE_SHORT: &str = "del";

/// A validated key-value mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Loose shape of a command as it appears on the wire, before validation.
///
/// Every field is optional here so that missing fields turn into a
/// `MalformedCommand` with a useful message instead of a serde error.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct WireCommand {
    #[serde(alias = "Op", default)]
    op: Option<String>,
    #[serde(alias = "Key", default)]
    key: Option<String>,
    #[serde(alias = "Value", default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    /// Serializes the command into its canonical wire form.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(&self.to_wire())
            .map_err(|err| StoreError::MalformedCommand(err.to_string()))
    }

    /// Parses and validates a wire payload.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let wire: WireCommand = serde_json::from_slice(bytes)
            .map_err(|err| StoreError::MalformedCommand(format!("invalid payload: {err}")))?;
        Command::try_from(wire)
    }

    pub(crate) fn to_wire(&self) -> WireCommand {
        match self {
            Command::Set { key, value } => WireCommand {
                op: Some(OP_SET.to_string()),
                key: Some(key.clone()),
                value: Some(value.clone()),
            },
            Command::Delete { key } => WireCommand {
                op: Some(OP_DELETE.to_string()),
                key: Some(key.clone()),
                value: None,
            },
        }
    }
}

impl TryFrom<WireCommand> for Command {
    type Error = StoreError;

    fn try_from(wire: WireCommand) -> StoreResult<Self> {
        let op = wire
            .op
            .ok_or_else(|| StoreError::MalformedCommand("missing field `op`".into()))?;
        let key = match wire.key {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(StoreError::MalformedCommand(
                    "missing or empty field `key`".into(),
                ));
            }
        };

        match op.as_str() {
            OP_SET => match wire.value {
                Some(value) if !value.is_empty() => Ok(Command::Set { key, value }),
                _ => Err(StoreError::MalformedCommand(
                    "`set` requires a non-empty `value`".into(),
                )),
            },
            OP_DELETE | OP_DELETE_SHORT => match wire.value {
                None => Ok(Command::Delete { key }),
                Some(_) => Err(StoreError::MalformedCommand(
                    "`delete` must not carry a `value`".into(),
                )),
            },
            other => Err(StoreError::MalformedCommand(format!(
                "unknown op `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn malformed(bytes: &[u8]) -> bool {
        matches!(Command::decode(bytes), Err(StoreError::MalformedCommand(_)))
    }

    #[test]
    fn decodes_canonical_payloads() {
        assert_eq!(
            Command::decode(br#"{"op":"set","key":"x","value":"1"}"#).unwrap(),
            Command::set("x", "1")
        );
        assert_eq!(
            Command::decode(br#"{"op":"delete","key":"x"}"#).unwrap(),
            Command::delete("x")
        );
    }

    #[test]
    fn accepts_capitalised_fields_and_short_delete() {
        assert_eq!(
            Command::decode(br#"{"Op":"set","Key":"x","Value":"1"}"#).unwrap(),
            Command::set("x", "1")
        );
        assert_eq!(
            Command::decode(br#"{"Op":"del","Key":"x"}"#).unwrap(),
            Command::delete("x")
        );
    }

    #[test]
    fn set_with_empty_value_is_malformed() {
        assert!(malformed(br#"{"op":"set","key":"x","value":""}"#));
        assert!(malformed(br#"{"op":"set","key":"x"}"#));
    }

    #[test]
    fn rejects_structural_problems() {
        assert!(malformed(b"not json"));
        assert!(malformed(b""));
        assert!(malformed(br#"{"key":"x","value":"1"}"#));
        assert!(malformed(br#"{"op":"set","value":"1"}"#));
        assert!(malformed(br#"{"op":"set","key":"","value":"1"}"#));
        assert!(malformed(br#"{"op":"upsert","key":"x","value":"1"}"#));
        assert!(malformed(br#"{"op":"delete","key":"x","value":"1"}"#));
    }

    #[test]
    fn rejects_non_string_values() {
        assert!(malformed(br#"{"op":"set","key":"x","value":1}"#));
        assert!(malformed(br#"{"op":"set","key":"x","value":{"nested":true}}"#));
        assert!(malformed(br#"{"op":"set","key":7,"value":"1"}"#));
    }

    #[test]
    fn delete_encodes_without_value() {
        let bytes = Command::delete("gone").encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"op": "delete", "key": "gone"}));
    }

    fn arb_command() -> impl Strategy<Value = Command> {
        let key = ".{1,24}";
        prop_oneof![
            (key, ".{1,64}").prop_map(|(k, v)| Command::set(k, v)),
            key.prop_map(|k| Command::delete(k)),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(command in arb_command()) {
            let bytes = command.encode().unwrap();
            prop_assert_eq!(Command::decode(&bytes).unwrap(), command);
        }
    }
}
