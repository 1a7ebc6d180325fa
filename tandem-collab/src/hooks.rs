//! Extension points of the relay server: who may join, and what happens
//! around joins, leaves, messages and persistence.

use std::collections::HashMap;

use serde_json::Value;
use tandem_core::SerializedCrdt;

use crate::presence::PresenceUser;

/// A connection attempt, parsed from the WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: String,
    /// Decoded query parameters (`userId`, `displayName`, `token`, ...).
    pub query: HashMap<String, String>,
}

impl JoinRequest {
    /// Parse `{prefix}/{roomId}?{query}`. Returns `None` when the path does
    /// not address a room under `prefix`.
    pub fn from_uri(prefix: &str, uri: &str) -> Option<Self> {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri, ""),
        };
        let raw_room = path
            .strip_prefix(prefix.trim_end_matches('/'))?
            .strip_prefix('/')?;
        if raw_room.is_empty() || raw_room.contains('/') {
            return None;
        }
        let room_id = urlencoding::decode(raw_room).ok()?.into_owned();

        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let key = urlencoding::decode(key).ok()?.into_owned();
                let value = urlencoding::decode(value).ok()?.into_owned();
                Some((key, value))
            })
            .collect();

        Some(Self { room_id, query })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.param("userId").filter(|id| !id.is_empty())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.param("displayName").filter(|name| !name.is_empty())
    }

    pub fn token(&self) -> Option<&str> {
        self.param("token")
    }
}

/// Who a connection belongs to, as decided by an [`AuthHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

/// Decides whether a connection may join. Returning `None` rejects it.
pub trait AuthHandler: Send + Sync {
    fn authenticate(&self, request: &JoinRequest) -> Option<Identity>;
}

/// Trusts the `userId` / `displayName` query parameters. The display name
/// falls back to the user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAuth;

impl AuthHandler for QueryAuth {
    fn authenticate(&self, request: &JoinRequest) -> Option<Identity> {
        let user_id = request.user_id()?;
        Some(Identity {
            user_id: user_id.to_string(),
            display_name: request.display_name().unwrap_or(user_id).to_string(),
        })
    }
}

/// Lifecycle callbacks. Every method defaults to doing nothing.
///
/// Callbacks run on the connection task; anything slow should be handed off
/// to a spawned task.
pub trait RoomHooks: Send + Sync {
    fn on_join(&self, _room_id: &str, _user: &PresenceUser) {}

    fn on_leave(&self, _room_id: &str, _user: &PresenceUser) {}

    /// An application message relayed to the room.
    fn on_message(&self, _room_id: &str, _sender_id: &str, _message: &Value) {}

    /// Stored snapshot for a room, asked once when the room is first joined.
    fn load(&self, _room_id: &str) -> Option<SerializedCrdt> {
        None
    }

    /// Called after each batch of ops that changed the room's storage.
    fn save(&self, _room_id: &str, _snapshot: &SerializedCrdt) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl RoomHooks for NoopHooks {}
