//! JSON wire protocol for the ordered update stream.
//!
//! One JSON object per WebSocket text frame:
//! ```text
//! client → server   {"type": "update", "payload": <opaque>}
//! server → client   {"index": <u64>,  "payload": <opaque>}
//! ```
//!
//! Server→client frames carry no `"type"` field — they are always log
//! entries. Client→server frames are tagged, and unrecognized tags decode
//! to [`ClientMessage::Other`] so that newer clients cannot crash an older
//! server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client→server frame, dispatched by its `"type"` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// An update submission: the payload is an opaque application update.
    Update { payload: Value },
    /// Any recognizably-framed message with an unknown type tag.
    /// Ignored by the server (forward compatibility).
    Other,
}

impl ClientMessage {
    /// Create an update submission.
    pub fn update(payload: Value) -> Self {
        Self::Update { payload }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Self::Update { payload } => serde_json::json!({
                "type": "update",
                "payload": payload,
            }),
            Self::Other => serde_json::json!({ "type": "unknown" }),
        };
        serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// Frames that are not valid JSON objects are errors; valid objects with
    /// an unrecognized (or absent) `"type"` decode to [`ClientMessage::Other`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::Deserialization(
                "frame is not a JSON object".to_string(),
            ));
        }

        match value.get("type").and_then(Value::as_str) {
            Some("update") => {
                let payload = value.get("payload").cloned().ok_or_else(|| {
                    ProtocolError::Deserialization("update frame missing payload".to_string())
                })?;
                Ok(Self::Update { payload })
            }
            _ => Ok(Self::Other),
        }
    }
}

/// One entry of the event log: a sequence index paired with an opaque
/// update payload. This is both the server→client frame and the durable
/// log record (one per line of the log file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Dense, zero-based position in the log.
    pub index: u64,
    /// The application update, opaque to the protocol.
    pub payload: Value,
}

impl LogEntry {
    /// Create a new entry.
    pub fn new(index: u64, payload: Value) -> Self {
        Self { index, payload }
    }

    /// Serialize to a JSON text frame / log record.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a JSON text frame / log record.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
