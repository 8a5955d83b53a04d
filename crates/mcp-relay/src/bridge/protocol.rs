//! JSON-RPC wire types shared by the stdio and HTTP sides of the bridge.
//!
//! The bridge never interprets method names or payloads. It only needs to know
//! whether a message carries an `id` (call vs notification) and what that id is,
//! so [`RpcMessage`] keeps the parsed value for inspection and the original text
//! for byte-for-byte forwarding.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;

/// Implementation-defined server error, used for transport failures.
pub const SERVER_ERROR: i64 = -32000;

/// A JSON-RPC identifier, exactly as supplied by the caller.
///
/// Equality and hashing use the compact JSON text of the value, so `"42"`,
/// `42` and `42.0` are three distinct identifiers.
#[derive(Debug, Clone)]
pub struct RpcId {
    value: Value,
    key: String,
}

impl RpcId {
    pub fn new(value: Value) -> Self {
        let key = value.to_string();
        Self { value, key }
    }

    pub fn null() -> Self {
        Self::new(Value::Null)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }
}

impl PartialEq for RpcId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for RpcId {}

impl Hash for RpcId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<Value> for RpcId {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<&str> for RpcId {
    fn from(value: &str) -> Self {
        Self::new(Value::String(value.to_string()))
    }
}

impl From<i64> for RpcId {
    fn from(value: i64) -> Self {
        Self::new(Value::from(value))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("expected a JSON-RPC object, got {0}")]
    NotAnObject(&'static str),
}

/// A parsed JSON-RPC message. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct RpcMessage {
    id: Option<RpcId>,
    value: Value,
    /// Single-line JSON text. The original text when it was already a single
    /// line, otherwise the compact re-serialization.
    text: String,
}

impl RpcMessage {
    /// Parse one message from text.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let trimmed = text.trim();
        let single_line = !trimmed.contains(['\n', '\r']);
        Self::build(value, single_line.then(|| trimmed.to_string()))
    }

    /// Parse one message from raw bytes, e.g. an HTTP body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse(std::str::from_utf8(bytes)?)
    }

    fn build(value: Value, text: Option<String>) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::NotAnObject(json_kind(&value)))?;
        // A present-but-null id still makes this a call.
        let id = object.get("id").cloned().map(RpcId::new);
        let text = text.unwrap_or_else(|| value.to_string());
        Ok(Self { id, value, text })
    }

    /// Build a JSON-RPC error reply. `None` produces `"id": null`.
    pub fn error_reply(id: Option<&RpcId>, code: i64, message: impl Into<String>) -> Self {
        let id = id.cloned().unwrap_or_else(RpcId::null);
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.as_value(),
            "error": {
                "code": code,
                "message": message.into(),
            },
        });
        let text = value.to_string();
        Self {
            id: Some(id),
            value,
            text,
        }
    }

    pub fn parse_error() -> Self {
        Self::error_reply(None, PARSE_ERROR, "Parse error")
    }

    pub fn id(&self) -> Option<&RpcId> {
        self.id.as_ref()
    }

    /// Notifications carry no `id` key at all and expect no reply.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn method(&self) -> Option<&str> {
        self.value.get("method").and_then(Value::as_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// The message as a single line of JSON, without a terminator.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_keeps_original_text() {
        let text = r#"{"jsonrpc":"2.0","id":"42","method":"ping"}"#;
        let msg = RpcMessage::parse(text).unwrap();

        assert_eq!(msg.id(), Some(&RpcId::from("42")));
        assert_eq!(msg.method(), Some("ping"));
        assert!(!msg.is_notification());
        assert_eq!(msg.as_str(), text);
    }

    #[test]
    fn missing_id_is_notification() {
        let msg = RpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(msg.is_notification());
        assert!(msg.id().is_none());
    }

    #[test]
    fn null_id_is_still_a_call() {
        let msg = RpcMessage::parse(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(!msg.is_notification());
        assert_eq!(msg.id(), Some(&RpcId::null()));
    }

    #[test]
    fn ids_compare_without_coercion() {
        assert_ne!(RpcId::from("1"), RpcId::from(1));
        assert_ne!(RpcId::from(1), RpcId::new(json!(1.0)));
        assert_eq!(RpcId::from(7), RpcId::new(json!(7)));
        assert_eq!(RpcId::from("abc").to_string(), r#""abc""#);
    }

    #[test]
    fn multiline_input_is_compacted() {
        let msg = RpcMessage::parse("{\n  \"jsonrpc\": \"2.0\",\n  \"id\": 1\n}\n").unwrap();
        assert!(!msg.as_str().contains('\n'));
        assert_eq!(msg.as_value(), &json!({"jsonrpc": "2.0", "id": 1}));
    }

    #[test]
    fn rejects_non_objects() {
        let err = RpcMessage::parse("[1,2]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject("an array")));

        let err = RpcMessage::parse("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }

    #[test]
    fn error_reply_shape() {
        let reply = RpcMessage::error_reply(Some(&RpcId::from(3)), SERVER_ERROR, "gone");
        insta::assert_json_snapshot!(reply.as_value(), @r#"
        {
          "error": {
            "code": -32000,
            "message": "gone"
          },
          "id": 3,
          "jsonrpc": "2.0"
        }
        "#);
    }

    #[test]
    fn parse_error_has_null_id() {
        let reply = RpcMessage::parse_error();
        assert_eq!(reply.as_value()["id"], Value::Null);
        assert_eq!(reply.as_value()["error"]["code"], PARSE_ERROR);
    }
}
