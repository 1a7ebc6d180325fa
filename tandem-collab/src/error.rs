use tandem_core::StorageError;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by the client room and the relay server.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoomError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("WebSocket error: {0}")]
    Transport(String),
    #[error("room {room} is full ({max} connections)")]
    RoomFull { room: String, max: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
