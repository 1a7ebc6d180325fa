//! Client side of a room: connection lifecycle, presence and cursor cache,
//! and the shared [`Document`].
//!
//! ```text
//!            connect()                 transport open
//! Disconnected ──────► Connecting ───────────────────► Connected
//!      ▲                   ▲                              │
//!      │                   │ backoff elapsed              │ transport closed
//!      │ disconnect() /    │                              ▼
//!      │ attempts spent    └──────────────────────── Reconnecting
//!      └─────────────────────────────────────────────────┘
//! ```
//!
//! Local storage mutations go through [`Room::mutate`] / [`Room::batch`];
//! the ops they generate are sent as one `storage:ops` frame. Frames from
//! the relay are applied in arrival order, each under one lock of the
//! document.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tandem_core::{Document, SerializedContainer, SerializedCrdt, StorageOp};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::RoomError;
use crate::presence::{
    followers_of, CursorData, CursorPosition, PresenceUser, FOLLOWING_KEY,
};
use crate::protocol::{self, ClientMessage, Frame, ServerMessage};
use crate::transport::{Connector, TransportEvent, WebSocketConnector};

/// Room connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by a room.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Status(ConnectionState),
    /// The full roster after a change.
    Presence(Vec<PresenceUser>),
    /// All known cursors after a change.
    Cursors(HashMap<String, CursorData>),
    /// An application message from another client.
    Message(Value),
    Error(RoomError),
    /// The document was (re)loaded from `storage:init`.
    StorageLoaded,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// `ws(s)://` or `http(s)://` base address of the relay.
    pub server_url: String,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub token: Option<String>,
    /// Minimum spacing between cursor frames. Clamped to at least 1ms.
    pub cursor_throttle: Duration,
    pub reconnect: ReconnectPolicy,
    /// Root fields to seed when the relay has no storage for the room yet.
    pub initial_storage: Option<SerializedCrdt>,
}

impl RoomOptions {
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            token: None,
            cursor_throttle: Duration::from_millis(50),
            reconnect: ReconnectPolicy::default(),
            initial_storage: None,
        }
    }

    /// `{server}/rooms/{roomId}?userId=..&displayName=..[&token=..]`
    pub fn url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };

        let mut url = format!(
            "{base}/rooms/{}?userId={}&displayName={}",
            urlencoding::encode(&self.room_id),
            urlencoding::encode(&self.user_id),
            urlencoding::encode(&self.display_name),
        );
        if let Some(token) = &self.token {
            url.push_str("&token=");
            url.push_str(&urlencoding::encode(token));
        }
        url
    }

    fn cursor_interval(&self) -> Duration {
        self.cursor_throttle.max(Duration::from_millis(1))
    }
}

#[derive(Default)]
struct CursorThrottle {
    last_sent: Option<Instant>,
    pending: Option<CursorPosition>,
    timer: Option<JoinHandle<()>>,
}

impl CursorThrottle {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.pending = None;
    }
}

struct RoomState {
    status: ConnectionState,
    presence: Vec<PresenceUser>,
    cursors: HashMap<String, CursorData>,
    following: Option<String>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    /// Bumped by `connect()` and `disconnect()`; tasks from an older session
    /// stop touching state.
    session: u64,
    driver: Option<JoinHandle<()>>,
    cursor: CursorThrottle,
}

struct Shared {
    options: RoomOptions,
    connector: Arc<dyn Connector>,
    state: RwLock<RoomState>,
    document: Mutex<Document>,
    /// Filled by the document's op hook, drained into `storage:ops` frames.
    outbox: Arc<StdMutex<Vec<StorageOp>>>,
    events: broadcast::Sender<RoomEvent>,
}

/// A connection to one room. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Room {
    shared: Arc<Shared>,
}

impl Room {
    pub fn new(options: RoomOptions) -> Self {
        Self::with_connector(options, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(options: RoomOptions, connector: Arc<dyn Connector>) -> Self {
        let outbox = Arc::new(StdMutex::new(Vec::new()));
        let mut document = Document::new();
        let sink = outbox.clone();
        document.set_on_ops_generated(move |ops: &[StorageOp]| {
            if let Ok(mut queue) = sink.lock() {
                queue.extend_from_slice(ops);
            }
        });

        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                options,
                connector,
                state: RwLock::new(RoomState {
                    status: ConnectionState::Disconnected,
                    presence: Vec::new(),
                    cursors: HashMap::new(),
                    following: None,
                    outgoing: None,
                    session: 0,
                    driver: None,
                    cursor: CursorThrottle::default(),
                }),
                document: Mutex::new(document),
                outbox,
                events,
            }),
        }
    }

    pub fn options(&self) -> &RoomOptions {
        &self.shared.options
    }

    /// Receive room events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.shared.events.subscribe()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start connecting. Does nothing while already connecting or connected.
    pub async fn connect(&self) {
        let shared = &self.shared;
        let mut state = shared.state.write().await;
        if matches!(
            state.status,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        state.session += 1;
        let session = state.session;
        shared.set_status(&mut state, ConnectionState::Connecting);
        state.driver = Some(tokio::spawn(run_session(shared.clone(), session)));
    }

    /// Close the connection and stop reconnecting. Pending cursor frames are
    /// discarded.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let mut state = shared.state.write().await;
        state.session += 1;
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        state.cursor.cancel();
        state.outgoing = None;
        shared.clear_peers(&mut state);
        shared.set_status(&mut state, ConnectionState::Disconnected);
        log::info!("Left room {}", shared.options.room_id);
    }

    // ─── Messaging ──────────────────────────────────────────────────

    /// Send an application message to the other clients. Dropped silently
    /// when not connected.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), RoomError> {
        let text = protocol::encode(message)?;
        self.shared.send_text(text).await;
        Ok(())
    }

    /// Report the local pointer. Frames are spaced at least
    /// `cursor_throttle` apart; only the latest position inside a window is
    /// sent.
    pub async fn update_cursor(&self, position: CursorPosition) {
        let shared = &self.shared;
        let mut state = shared.state.write().await;
        if state.status != ConnectionState::Connected {
            return;
        }

        let interval = shared.options.cursor_interval();
        let now = Instant::now();
        let elapsed = state.cursor.last_sent.map(|last| now.duration_since(last));
        let due = elapsed.map_or(true, |e| e >= interval);

        if due && state.cursor.timer.is_none() {
            state.cursor.last_sent = Some(now);
            state.cursor.pending = None;
            shared.send_cursor(&state, position);
            return;
        }

        state.cursor.pending = Some(position);
        if state.cursor.timer.is_none() {
            let wait = elapsed.map_or(Duration::ZERO, |e| interval.saturating_sub(e));
            let task_shared = shared.clone();
            let session = state.session;
            state.cursor.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                task_shared.flush_cursor(session).await;
            }));
        }
    }

    pub async fn follow_user(&self, user_id: impl Into<String>) {
        self.set_following(Some(user_id.into())).await;
    }

    pub async fn stop_following(&self) {
        self.set_following(None).await;
    }

    async fn set_following(&self, following: Option<String>) {
        let shared = &self.shared;
        let mut patch = Map::new();
        patch.insert(
            FOLLOWING_KEY.to_string(),
            following.clone().map_or(Value::Null, Value::String),
        );
        {
            let mut state = shared.state.write().await;
            state.following = following;
            let me = shared.options.user_id.as_str();
            if let Some(user) = state.presence.iter_mut().find(|u| u.user_id == me) {
                user.merge_metadata(patch.clone());
            }
        }
        shared
            .send_message(&ClientMessage::PresenceUpdate { metadata: patch })
            .await;
    }

    // ─── Getters ────────────────────────────────────────────────────

    pub async fn get_status(&self) -> ConnectionState {
        self.shared.state.read().await.status
    }

    pub async fn get_presence(&self) -> Vec<PresenceUser> {
        self.shared.state.read().await.presence.clone()
    }

    /// This client's roster entry, once the relay has sent one.
    pub async fn get_self(&self) -> Option<PresenceUser> {
        let me = &self.shared.options.user_id;
        self.shared
            .state
            .read()
            .await
            .presence
            .iter()
            .find(|u| &u.user_id == me)
            .cloned()
    }

    pub async fn get_others(&self) -> Vec<PresenceUser> {
        let me = &self.shared.options.user_id;
        self.shared
            .state
            .read()
            .await
            .presence
            .iter()
            .filter(|u| &u.user_id != me)
            .cloned()
            .collect()
    }

    pub async fn get_cursors(&self) -> HashMap<String, CursorData> {
        self.shared.state.read().await.cursors.clone()
    }

    pub async fn get_following(&self) -> Option<String> {
        self.shared.state.read().await.following.clone()
    }

    /// Users currently following this one, sorted by id.
    pub async fn get_followers(&self) -> Vec<String> {
        let state = self.shared.state.read().await;
        followers_of(&state.presence, &self.shared.options.user_id)
    }

    // ─── Storage ────────────────────────────────────────────────────

    /// Read the document.
    pub async fn storage<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        let doc = self.shared.document.lock().await;
        f(&doc)
    }

    /// Mutate the document and send the generated ops as one frame.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        let mut doc = self.shared.document.lock().await;
        let result = f(&mut doc);
        self.shared.flush(doc.clock()).await;
        result
    }

    /// Like [`mutate`](Self::mutate), recorded as one undoable step.
    pub async fn batch<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        self.mutate(|doc| doc.batch(f)).await
    }

    /// Undo the last local step. Returns `false` when there was nothing to
    /// undo.
    pub async fn undo(&self) -> bool {
        self.mutate(|doc| doc.undo().is_some()).await
    }

    pub async fn redo(&self) -> bool {
        self.mutate(|doc| doc.redo().is_some()).await
    }
}

impl Shared {
    fn emit(&self, event: RoomEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn set_status(&self, state: &mut RoomState, status: ConnectionState) {
        if state.status != status {
            log::debug!(
                "Room {}: {:?} -> {:?}",
                self.options.room_id,
                state.status,
                status
            );
            state.status = status;
            self.emit(RoomEvent::Status(status));
        }
    }

    fn clear_peers(&self, state: &mut RoomState) {
        if !state.presence.is_empty() {
            state.presence.clear();
            self.emit(RoomEvent::Presence(Vec::new()));
        }
        if !state.cursors.is_empty() {
            state.cursors.clear();
            self.emit(RoomEvent::Cursors(HashMap::new()));
        }
    }

    async fn send_text(&self, text: String) -> bool {
        let state = self.state.read().await;
        match (&state.status, &state.outgoing) {
            (ConnectionState::Connected, Some(tx)) => tx.send(text).is_ok(),
            _ => {
                log::debug!("Room {}: not connected, message dropped", self.options.room_id);
                false
            }
        }
    }

    async fn send_message(&self, message: &ClientMessage) -> bool {
        match protocol::encode(message) {
            Ok(text) => self.send_text(text).await,
            Err(e) => {
                log::error!("{e}");
                false
            }
        }
    }

    fn send_cursor(&self, state: &RoomState, position: CursorPosition) {
        log::trace!("Cursor -> ({}, {})", position.x, position.y);
        let Some(tx) = &state.outgoing else {
            return;
        };
        match protocol::encode(&ClientMessage::CursorUpdate(position)) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => log::error!("{e}"),
        }
    }

    async fn flush_cursor(&self, session: u64) {
        let mut state = self.state.write().await;
        if state.session != session {
            return;
        }
        state.cursor.timer = None;
        if state.status != ConnectionState::Connected {
            state.cursor.pending = None;
            return;
        }
        if let Some(position) = state.cursor.pending.take() {
            state.cursor.last_sent = Some(Instant::now());
            self.send_cursor(&state, position);
        }
    }

    /// Drain the outbox into one `storage:ops` frame.
    async fn flush(&self, clock: u64) {
        let ops = match self.outbox.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => return,
        };
        if ops.is_empty() {
            return;
        }
        log::debug!("Room {}: sending {} ops", self.options.room_id, ops.len());
        self.send_message(&ClientMessage::StorageOps {
            ops,
            clock: Some(clock),
        })
        .await;
    }

    /// Adopt a freshly opened transport. Returns `false` if the session was
    /// superseded in the meantime.
    async fn on_open(&self, session: u64, outgoing: mpsc::UnboundedSender<String>) -> bool {
        let mut state = self.state.write().await;
        if state.session != session {
            return false;
        }
        state.outgoing = Some(outgoing);
        self.clear_peers(&mut state);
        self.set_status(&mut state, ConnectionState::Connected);
        log::info!(
            "Joined room {} as {}",
            self.options.room_id,
            self.options.user_id
        );

        // A new connection starts with empty metadata on the relay.
        if let Some(following) = state.following.clone() {
            let mut metadata = Map::new();
            metadata.insert(FOLLOWING_KEY.to_string(), Value::String(following));
            if let (Ok(text), Some(tx)) = (
                protocol::encode(&ClientMessage::PresenceUpdate { metadata }),
                &state.outgoing,
            ) {
                let _ = tx.send(text);
            }
        }
        true
    }

    /// Forget the closed transport. Returns `false` if the session was
    /// superseded.
    async fn on_close(&self, session: u64) -> bool {
        let mut state = self.state.write().await;
        if state.session != session {
            return false;
        }
        state.outgoing = None;
        state.cursor.cancel();
        self.clear_peers(&mut state);
        true
    }

    async fn handle_message(&self, session: u64, text: &str) {
        let frame = match protocol::decode::<ServerMessage>(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Room {}: {e}", self.options.room_id);
                return;
            }
        };

        match frame {
            Frame::Message(ServerMessage::Presence { users }) => {
                let mut state = self.state.write().await;
                if state.session != session {
                    return;
                }
                let before = state.cursors.len();
                state
                    .cursors
                    .retain(|id, _| users.iter().any(|u| &u.user_id == id));
                let pruned = state.cursors.len() != before;
                state.presence = users.clone();
                self.emit(RoomEvent::Presence(users));
                if pruned {
                    self.emit(RoomEvent::Cursors(state.cursors.clone()));
                }
            }
            Frame::Message(ServerMessage::CursorUpdate { cursor }) => {
                if cursor.user_id == self.options.user_id {
                    return;
                }
                let mut state = self.state.write().await;
                if state.session != session {
                    return;
                }
                log::trace!("Cursor {} at ({}, {})", cursor.user_id, cursor.x, cursor.y);
                state.cursors.insert(cursor.user_id.clone(), cursor);
                self.emit(RoomEvent::Cursors(state.cursors.clone()));
            }
            Frame::Message(ServerMessage::StorageInit { root }) => {
                self.load_storage(root).await;
            }
            Frame::Message(ServerMessage::StorageOps { ops, .. }) => {
                let mut doc = self.document.lock().await;
                let applied = doc.apply_ops(&ops);
                log::debug!(
                    "Room {}: applied {applied}/{} remote ops",
                    self.options.room_id,
                    ops.len()
                );
            }
            Frame::Custom(message) => self.emit(RoomEvent::Message(message)),
        }
    }

    async fn load_storage(&self, root: Option<SerializedCrdt>) {
        let mut doc = self.document.lock().await;
        match root {
            Some(root) => {
                if let Err(e) = doc.apply_snapshot(&root) {
                    log::error!("Room {}: rejected storage snapshot: {e}", self.options.room_id);
                    self.emit(RoomEvent::Error(e.into()));
                    return;
                }
            }
            None => {
                let empty = doc.size(doc.root()).map_or(true, |n| n == 0);
                if let (true, Some(initial)) = (empty, &self.options.initial_storage) {
                    if let Err(e) = seed(&mut doc, initial) {
                        log::error!("Room {}: failed to seed storage: {e}", self.options.room_id);
                        self.emit(RoomEvent::Error(e));
                    }
                }
            }
        }
        self.flush(doc.clock()).await;
        drop(doc);
        self.emit(RoomEvent::StorageLoaded);
    }
}

/// Write `initial`'s root fields into an empty document. Seeding is not an
/// undoable step.
fn seed(doc: &mut Document, initial: &SerializedCrdt) -> Result<(), RoomError> {
    let SerializedCrdt::Container(SerializedContainer::LiveObject { data }) = initial else {
        return Err(RoomError::Storage(tandem_core::StorageError::InvalidRoot));
    };
    let root = doc.root();
    doc.update(root, data.clone())?;
    doc.history_mut().clear();
    Ok(())
}

/// Drive one connect session: connect, pump incoming frames, and reconnect
/// with backoff until the policy gives up or the session is superseded.
async fn run_session(shared: Arc<Shared>, session: u64) {
    let url = shared.options.url();
    let policy = shared.options.reconnect.clone();
    let mut attempt: u32 = 0;

    loop {
        match shared.connector.connect(&url).await {
            Ok(transport) => {
                attempt = 0;
                if !shared.on_open(session, transport.outgoing).await {
                    return;
                }
                let mut incoming = transport.incoming;
                while let Some(event) = incoming.recv().await {
                    match event {
                        TransportEvent::Message(text) => shared.handle_message(session, &text).await,
                        TransportEvent::Error(reason) => {
                            shared.emit(RoomEvent::Error(RoomError::Transport(reason)));
                        }
                        TransportEvent::Closed => break,
                    }
                }
                if !shared.on_close(session).await {
                    return;
                }
                log::info!("Connection to room {} lost", shared.options.room_id);
            }
            Err(e) => {
                log::error!("{e}");
                shared.emit(RoomEvent::Error(e));
            }
        }

        attempt += 1;
        {
            let mut state = shared.state.write().await;
            if state.session != session {
                return;
            }
            if !policy.enabled || attempt > policy.max_attempts {
                if policy.enabled {
                    log::warn!(
                        "Room {}: giving up after {} reconnect attempts",
                        shared.options.room_id,
                        policy.max_attempts
                    );
                }
                shared.set_status(&mut state, ConnectionState::Disconnected);
                return;
            }
            shared.set_status(&mut state, ConnectionState::Reconnecting);
        }

        let delay = policy.delay(attempt);
        log::info!(
            "Room {}: reconnecting in {}ms (attempt {attempt})",
            shared.options.room_id,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;

        let mut state = shared.state.write().await;
        if state.session != session {
            return;
        }
        shared.set_status(&mut state, ConnectionState::Connecting);
    }
}
