//! Wire-level shared types: the opaque JSON-RPC envelope and the
//! event-stream message shape produced by the SSE reader.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque JSON-RPC 2.0 message.
///
/// The transport layer never inspects fields beyond what is required for
/// delivery; request/response correlation happens at the [`crate::jsonrpc`]
/// layer above. Unknown/extra fields are preserved via `extra` so that
/// envelopes round-trip untouched even as the protocol evolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcMessage {
    /// Always `"2.0"` on the wire; preserved verbatim rather than validated,
    /// since this crate treats payload semantics as opaque.
    pub jsonrpc: String,

    /// Present on requests and responses; absent on notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Present on requests and notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Present on requests and notifications that carry parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    /// Present on successful responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Present on failed responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,

    /// Any field not recognized above, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: std::collections::HashMap<String, Value>,
}

impl JsonRpcMessage {
    /// True when this envelope has no `id` -- a notification.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// True when this envelope carries a `result` or `error` -- a response.
    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

/// The JSON-RPC 2.0 error object, nested inside an error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// The JSON-RPC error code.
    pub code: i64,
    /// A short, human-readable error message.
    pub message: String,
    /// Optional additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// One parsed record from a `text/event-stream` body.
///
/// `id` is sticky across records at the reader level (see
/// [`crate::transport::event_stream::EventStreamReader`]); this struct just
/// carries the resolved values for a single dispatched record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventStreamMessage {
    /// Defaults to `"message"` when the record carried no `event` field.
    pub event: String,
    /// Multi-line data joined with `\n`.
    pub data: String,
    /// The sticky `id`, if any has been seen so far on this connection.
    pub id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_has_no_id_but_has_method() {
        let msg = JsonRpcMessage {
            jsonrpc: "2.0".into(),
            id: None,
            method: Some("notifications/initialized".into()),
            params: None,
            result: None,
            error: None,
            extra: Default::default(),
        };
        assert!(msg.is_notification());
        assert!(!msg.is_response());
    }

    #[test]
    fn response_round_trips_through_json() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#;
        let msg: JsonRpcMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.is_response());
        let out = serde_json::to_string(&msg).unwrap();
        let reparsed: JsonRpcMessage = serde_json::from_str(&out).unwrap();
        assert_eq!(msg, reparsed);
    }

    #[test]
    fn unknown_fields_are_preserved_via_extra() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":{},"weird":"field"}"#;
        let msg: JsonRpcMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg.extra.get("weird").and_then(|v| v.as_str()),
            Some("field")
        );
    }
}
