//! Hub wire protocol: JSON messages separated by the 0x1E record separator.
//!
//! The hub speaks a SignalR-style JSON protocol. Only the message kinds the
//! call core needs are modeled: invocations (type 1), pings (type 6) and
//! close (type 7). The handshake response is a bare `{}` frame.

use serde_json::{Value, json};

use super::SignalingError;

/// Frame terminator used by the hub protocol.
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// A decoded frame from the hub.
#[derive(Debug, Clone)]
pub enum HubMessage {
    /// The hub acknowledged our protocol handshake.
    HandshakeAck,
    /// A server-to-client method invocation.
    Invocation {
        target: String,
        arguments: Vec<Value>,
    },
    /// Keepalive from the server.
    Ping,
    /// The server is closing the connection.
    Close { error: Option<String> },
}

/// The handshake frame sent immediately after the socket opens.
pub fn handshake_frame() -> String {
    json!({"protocol": "json", "version": 1}).to_string()
}

/// Encodes a fire-and-forget client-to-server invocation.
pub fn encode_invocation(target: &str, arguments: &[Value]) -> String {
    json!({
        "type": 1,
        "target": target,
        "arguments": arguments,
    })
    .to_string()
}

/// Encodes a keepalive ping frame.
pub fn encode_ping() -> String {
    json!({"type": 6}).to_string()
}

/// Decodes one frame (without its record separator).
pub fn decode_frame(frame: &str) -> Result<HubMessage, SignalingError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| SignalingError::Protocol(e.to_string()))?;

    match value.get("type").and_then(Value::as_u64) {
        // The handshake response carries no "type" field.
        None => Ok(HubMessage::HandshakeAck),
        Some(1) => {
            let target = value
                .get("target")
                .and_then(Value::as_str)
                .ok_or_else(|| SignalingError::Protocol("invocation without target".into()))?
                .to_string();
            let arguments = value
                .get("arguments")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok(HubMessage::Invocation { target, arguments })
        }
        Some(6) => Ok(HubMessage::Ping),
        Some(7) => Ok(HubMessage::Close {
            error: value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        Some(other) => Err(SignalingError::Protocol(format!(
            "unsupported hub message type {other}"
        ))),
    }
}

/// Canonicalizes an event target name. The backend has historically emitted
/// targets in PascalCase, camelCase and lowercase; matching happens on the
/// lowercased form only.
pub fn canonical_target(target: &str) -> String {
    target.to_ascii_lowercase()
}
