//! Per-room fan-out and membership on the relay server.
//!
//! Every connection in a room holds a receiver on the room's broadcast
//! channel. Frames are encoded once and shared as `Arc<str>`; each
//! connection task skips envelopes it sent itself, so a relay reaches the
//! other N-1 connections.
//!
//! The room also keeps a storage replica: incoming `storage:ops` are merged
//! into it so late joiners get a current `storage:init` and the save hook
//! always sees a whole snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tandem_core::{Document, SerializedCrdt, StorageOp};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::error::RoomError;
use crate::presence::PresenceUser;
use crate::protocol::{self, ProtocolError, ServerMessage};

pub type ConnectionId = Uuid;

/// One encoded frame on its way to the room's connections.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection that produced the frame; it will not receive it back.
    /// `None` reaches everyone.
    pub sender: Option<ConnectionId>,
    pub payload: Arc<str>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct RoomStorage {
    document: Document,
    /// Set once storage was loaded or a client wrote to it. Until then
    /// joiners get `storage:init` with a `null` root and seed it.
    initialized: bool,
    load_attempted: bool,
}

/// A single room: its connections, their presence, and the storage replica.
pub struct BroadcastRoom {
    id: String,
    sender: broadcast::Sender<Envelope>,
    connections: RwLock<HashMap<ConnectionId, PresenceUser>>,
    storage: Mutex<RoomStorage>,
    capacity: usize,
    max_connections: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastRoom {
    /// `capacity` is how many frames a slow connection may fall behind
    /// before it starts losing them.
    pub fn new(id: impl Into<String>, capacity: usize, max_connections: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            id: id.into(),
            sender,
            connections: RwLock::new(HashMap::new()),
            storage: Mutex::new(RoomStorage {
                document: Document::new(),
                initialized: false,
                load_attempted: false,
            }),
            capacity,
            max_connections,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ─── Membership ─────────────────────────────────────────────────

    /// Register a connection and hand back its receiver.
    pub async fn add_connection(
        &self,
        id: ConnectionId,
        user: PresenceUser,
    ) -> Result<broadcast::Receiver<Envelope>, RoomError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(RoomError::RoomFull {
                room: self.id.clone(),
                max: self.max_connections,
            });
        }
        connections.insert(id, user);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_connection(&self, id: &ConnectionId) -> Option<PresenceUser> {
        self.connections.write().await.remove(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn hold_connections(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, PresenceUser>> {
        self.connections.write().await
    }

    pub async fn user(&self, id: &ConnectionId) -> Option<PresenceUser> {
        self.connections.read().await.get(id).cloned()
    }

    /// Everyone in the room, oldest connection first.
    pub async fn roster(&self) -> Vec<PresenceUser> {
        let mut users: Vec<PresenceUser> =
            self.connections.read().await.values().cloned().collect();
        users.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }

    /// Merge a metadata patch into one connection's presence. Returns
    /// `false` if the connection is gone.
    pub async fn update_metadata(
        &self,
        id: &ConnectionId,
        patch: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        match self.connections.write().await.get_mut(id) {
            Some(user) => {
                user.merge_metadata(patch);
                true
            }
            None => false,
        }
    }

    // ─── Fan-out ────────────────────────────────────────────────────

    /// Encode and send to every connection except `sender`.
    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        sender: Option<ConnectionId>,
        message: &T,
    ) -> Result<usize, ProtocolError> {
        let payload: Arc<str> = protocol::encode(message)?.into();
        Ok(self.broadcast_raw(sender, payload))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, sender: Option<ConnectionId>, payload: Arc<str>) -> usize {
        let count = self.sender.send(Envelope { sender, payload }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Send the full roster to everyone.
    pub async fn broadcast_presence(&self) -> Result<usize, ProtocolError> {
        let users = self.roster().await;
        self.broadcast(None, &ServerMessage::Presence { users })
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }

    // ─── Storage replica ────────────────────────────────────────────

    /// Run `load` the first time this is called for the room and adopt its
    /// snapshot. Later calls are no-ops.
    pub async fn ensure_loaded<F>(&self, load: F) -> Result<(), RoomError>
    where
        F: FnOnce() -> Option<SerializedCrdt>,
    {
        let mut storage = self.storage.lock().await;
        if storage.load_attempted {
            return Ok(());
        }
        storage.load_attempted = true;
        if let Some(root) = load() {
            storage.document = Document::deserialize(&root)?;
            storage.initialized = true;
            log::info!("Room {} loaded stored snapshot", self.id);
        }
        Ok(())
    }

    /// The `storage:init` frame for a joining connection.
    pub async fn storage_init(&self) -> ServerMessage {
        let storage = self.storage.lock().await;
        ServerMessage::StorageInit {
            root: storage
                .initialized
                .then(|| storage.document.serialize()),
        }
    }

    /// Merge client ops into the replica. Returns how many applied and the
    /// resulting snapshot when anything changed.
    pub async fn apply_ops(&self, ops: &[StorageOp]) -> (usize, Option<SerializedCrdt>) {
        let mut storage = self.storage.lock().await;
        storage.initialized = true;
        let applied = storage.document.apply_ops(ops);
        let snapshot = (applied > 0).then(|| storage.document.serialize());
        (applied, snapshot)
    }

    pub async fn snapshot(&self) -> SerializedCrdt {
        self.storage.lock().await.document.serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Frame};

    fn user(id: &str) -> PresenceUser {
        PresenceUser::new(id, id.to_uppercase())
    }

    #[tokio::test]
    async fn test_add_remove_connections() {
        let room = BroadcastRoom::new("board", 16, 10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let _rx_a = room.add_connection(a, user("alice")).await.unwrap();
        let _rx_b = room.add_connection(b, user("bob")).await.unwrap();
        assert_eq!(room.connection_count().await, 2);

        let removed = room.remove_connection(&a).await.unwrap();
        assert_eq!(removed.user_id, "alice");
        assert_eq!(room.connection_count().await, 1);
        assert!(room.remove_connection(&a).await.is_none());
    }

    #[tokio::test]
    async fn test_room_full() {
        let room = BroadcastRoom::new("board", 16, 1);
        let _rx = room.add_connection(Uuid::new_v4(), user("alice")).await.unwrap();
        let err = room
            .add_connection(Uuid::new_v4(), user("bob"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoomError::RoomFull {
                room: "board".into(),
                max: 1
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_carries_sender() {
        let room = BroadcastRoom::new("board", 16, 10);
        let a = Uuid::new_v4();
        let mut rx_a = room.add_connection(a, user("alice")).await.unwrap();
        let mut rx_b = room.add_connection(Uuid::new_v4(), user("bob")).await.unwrap();

        let delivered = room
            .broadcast(Some(a), &serde_json::json!({"type": "ping"}))
            .unwrap();
        assert_eq!(delivered, 2);

        // Filtering happens in the connection task; both receivers see it.
        let env_a = rx_a.recv().await.unwrap();
        let env_b = rx_b.recv().await.unwrap();
        assert_eq!(env_a.sender, Some(a));
        assert_eq!(&*env_b.payload, r#"{"type":"ping"}"#);

        let stats = room.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.active_connections, 2);
    }

    #[tokio::test]
    async fn test_presence_roster_and_metadata() {
        let room = BroadcastRoom::new("board", 16, 10);
        let a = Uuid::new_v4();
        let mut rx = room.add_connection(a, user("alice")).await.unwrap();

        let patch = serde_json::json!({"following": "bob"});
        assert!(room.update_metadata(&a, patch.as_object().unwrap().clone()).await);
        room.broadcast_presence().await.unwrap();

        let env = rx.recv().await.unwrap();
        match decode::<ServerMessage>(&env.payload).unwrap() {
            Frame::Message(ServerMessage::Presence { users }) => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].following(), Some("bob"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_storage_replica() {
        let room = BroadcastRoom::new("board", 16, 10);
        assert_eq!(room.storage_init().await, ServerMessage::StorageInit { root: None });

        room.ensure_loaded(|| Some(SerializedCrdt::object([("title", "Plan")])))
            .await
            .unwrap();
        // Only the first call loads.
        room.ensure_loaded(|| panic!("loaded twice")).await.unwrap();

        let (applied, snapshot) = room
            .apply_ops(&[StorageOp::Set {
                path: vec![],
                key: "title".into(),
                value: "Roadmap".into(),
                clock: 1,
            }])
            .await;
        assert_eq!(applied, 1);
        assert_eq!(snapshot, Some(SerializedCrdt::object([("title", "Roadmap")])));

        match room.storage_init().await {
            ServerMessage::StorageInit { root: Some(root) } => {
                assert_eq!(root, SerializedCrdt::object([("title", "Roadmap")]))
            }
            other => panic!("unexpected init: {other:?}"),
        }
    }
}
