//! JSON wire protocol shared by the relay server and the client room.
//!
//! Every frame is a WebSocket text message holding one JSON object with a
//! string `type` field:
//!
//! | `type`            | direction        | body                      |
//! |-------------------|------------------|---------------------------|
//! | `presence`        | server → client  | `users` (full roster)     |
//! | `cursor:update`   | client → server  | `x`, `y`, optional extras |
//! | `cursor:update`   | server → client  | `cursor` (stamped)        |
//! | `presence:update` | client → server  | `metadata` patch          |
//! | `storage:init`    | server → client  | `root` or `null`          |
//! | `storage:ops`     | both             | `ops`, optional `clock`   |
//!
//! Any other object with a string `type` is an application message and is
//! relayed untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tandem_core::{SerializedCrdt, StorageOp};
use thiserror::Error;

use crate::presence::{CursorData, CursorPosition, PresenceUser};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// A closed family of typed messages with a known set of `type` tags.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Tags this family claims. Frames with any other tag decode as
    /// [`Frame::Custom`].
    const TYPES: &'static [&'static str];
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "presence")]
    Presence { users: Vec<PresenceUser> },
    #[serde(rename = "cursor:update")]
    CursorUpdate { cursor: CursorData },
    #[serde(rename = "storage:init")]
    StorageInit { root: Option<SerializedCrdt> },
    #[serde(rename = "storage:ops")]
    StorageOps {
        ops: Vec<StorageOp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clock: Option<u64>,
    },
}

impl WireMessage for ServerMessage {
    const TYPES: &'static [&'static str] =
        &["presence", "cursor:update", "storage:init", "storage:ops"];
}

/// Messages clients send to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "cursor:update")]
    CursorUpdate(CursorPosition),
    #[serde(rename = "presence:update")]
    PresenceUpdate { metadata: Map<String, Value> },
    #[serde(rename = "storage:ops")]
    StorageOps {
        ops: Vec<StorageOp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clock: Option<u64>,
    },
}

impl WireMessage for ClientMessage {
    const TYPES: &'static [&'static str] = &["cursor:update", "presence:update", "storage:ops"];
}

/// A decoded frame: either one of the family's own messages or an
/// application message to pass through.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<M> {
    Message(M),
    Custom(Value),
}

/// Decode one text frame.
///
/// Fails with [`ProtocolError::Malformed`] when the text is not a JSON
/// object with a string `type`, or when a known tag carries the wrong shape.
pub fn decode<M: WireMessage>(text: &str) -> Result<Frame<M>, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let tag = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("expected an object with a string `type`".into()))?;

    if !M::TYPES.contains(&tag) {
        return Ok(Frame::Custom(value));
    }
    let tag = tag.to_string();
    serde_json::from_value(value)
        .map(Frame::Message)
        .map_err(|e| ProtocolError::Malformed(format!("{tag}: {e}")))
}

pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}
