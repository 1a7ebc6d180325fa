//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── storage replica ── RoomHooks::save
//!             ├── /rooms/{id} ── BroadcastRoom
//! Client B ──┘        │             └── broadcast channel
//!                     │                     │
//!               RoomRegistry          ┌─────┴─────┐
//!            (idle cleanup timers)    ▼           ▼
//!                                  Client A    Client B
//! ```
//!
//! The server never interprets container semantics beyond keeping a replica
//! of each room's storage; it stamps identity on cursors, keeps the roster,
//! and relays everything else to the other connections in the room.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastRoom, ConnectionId, Envelope};
use crate::hooks::{AuthHandler, Identity, JoinRequest, NoopHooks, QueryAuth, RoomHooks};
use crate::presence::{CursorData, PresenceUser};
use crate::protocol::{self, ClientMessage, Frame, ServerMessage};
use crate::registry::RoomRegistry;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Rooms live at `{path_prefix}/{roomId}`
    pub path_prefix: String,
    pub max_connections_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long an empty room is kept before it is dropped
    pub cleanup_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path_prefix: "/rooms".to_string(),
            max_connections_per_room: 100,
            broadcast_capacity: 256,
            cleanup_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND_ADDR`, `TANDEM_CLEANUP_TIMEOUT_MS`
    /// and `TANDEM_MAX_CONNECTIONS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("TANDEM_CLEANUP_TIMEOUT_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.cleanup_timeout = Duration::from_millis(ms),
                Err(e) => log::warn!("Ignoring TANDEM_CLEANUP_TIMEOUT_MS={raw:?}: {e}"),
            }
        }
        if let Some(raw) = lookup("TANDEM_MAX_CONNECTIONS") {
            match raw.parse::<usize>() {
                Ok(max) if max > 0 => config.max_connections_per_room = max,
                _ => log::warn!("Ignoring TANDEM_MAX_CONNECTIONS={raw:?}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused by path, auth, or a full room
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct Context {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    hooks: Arc<dyn RoomHooks>,
    auth: Arc<dyn AuthHandler>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The relay server.
pub struct RelayServer {
    ctx: Context,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            config.max_connections_per_room,
        ));
        Self {
            ctx: Context {
                config,
                registry,
                hooks: Arc::new(NoopHooks),
                auth: Arc::new(QueryAuth),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RoomHooks>) -> Self {
        self.ctx.hooks = hooks;
        self
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthHandler>) -> Self {
        self.ctx.auth = auth;
        self
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Context,
    ) -> Result<(), BoxError> {
        let mut joined: Option<(JoinRequest, Identity)> = None;
        let accepted = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                let uri = req.uri().to_string();
                let Some(request) = JoinRequest::from_uri(&ctx.config.path_prefix, &uri) else {
                    return Err(reject(StatusCode::NOT_FOUND, "no room at this path"));
                };
                let Some(identity) = ctx.auth.authenticate(&request) else {
                    return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
                };
                joined = Some((request, identity));
                Ok(response)
            },
        )
        .await;

        let (ws_stream, (request, identity)) = match (accepted, joined) {
            (Ok(ws), Some(join)) => (ws, join),
            (result, _) => {
                ctx.stats.write().await.rejected_connections += 1;
                match result {
                    Err(e) => log::info!("Rejected connection from {addr}: {e}"),
                    Ok(_) => log::info!("Rejected connection from {addr}"),
                }
                return Ok(());
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let room_id = request.room_id;

        let room = ctx.registry.get_or_create(&room_id).await;
        if let Err(e) = room.ensure_loaded(|| ctx.hooks.load(&room_id)).await {
            log::error!("Room {room_id}: stored snapshot rejected: {e}");
        }

        let connection_id = Uuid::new_v4();
        let user = PresenceUser::new(identity.user_id, identity.display_name);
        let mut rx = match room.add_connection(connection_id, user.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                log::warn!("Refusing {} from {addr}: {e}", user.user_id);
                ctx.stats.write().await.rejected_connections += 1;
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: e.to_string().into(),
                };
                ws_sender.send(Message::Close(Some(frame))).await?;
                return Ok(());
            }
        };

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("{} joined room {room_id} from {addr}", user.user_id);
        ctx.hooks.on_join(&room_id, &user);

        let result = async {
            let init = protocol::encode(&room.storage_init().await)?;
            ws_sender.send(Message::Text(init.into())).await?;
            room.broadcast_presence().await?;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                Self::route(&ctx, &room, connection_id, text.as_str()).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    envelope = rx.recv() => {
                        match envelope {
                            Ok(Envelope { sender, payload }) => {
                                if sender == Some(connection_id) {
                                    continue;
                                }
                                ws_sender.send(Message::Text(payload.to_string().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} messages");
                                room.record_dropped(n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup runs whatever ended the loop.
        room.remove_connection(&connection_id).await;
        if let Err(e) = room.broadcast_presence().await {
            log::error!("Room {room_id}: failed to broadcast roster: {e}");
        }
        ctx.hooks.on_leave(&room_id, &user);
        log::info!("{} left room {room_id}", user.user_id);
        if room.connection_count().await == 0 {
            ctx.registry
                .schedule_cleanup(&room_id, ctx.config.cleanup_timeout)
                .await;
        }
        ctx.stats.write().await.active_connections -= 1;

        result
    }

    /// Route one text frame from `connection_id`.
    async fn route(
        ctx: &Context,
        room: &BroadcastRoom,
        connection_id: ConnectionId,
        text: &str,
    ) -> Result<(), BoxError> {
        ctx.stats.write().await.total_messages += 1;

        match protocol::decode::<ClientMessage>(text) {
            Ok(Frame::Message(ClientMessage::CursorUpdate(position))) => {
                if let Some(user) = room.user(&connection_id).await {
                    log::trace!("Cursor {} at ({}, {})", user.user_id, position.x, position.y);
                    let cursor = CursorData::stamp(&user, position);
                    room.broadcast(Some(connection_id), &ServerMessage::CursorUpdate { cursor })?;
                }
            }
            Ok(Frame::Message(ClientMessage::PresenceUpdate { metadata })) => {
                if room.update_metadata(&connection_id, metadata).await {
                    room.broadcast_presence().await?;
                }
            }
            Ok(Frame::Message(ClientMessage::StorageOps { ops, clock })) => {
                let (applied, snapshot) = room.apply_ops(&ops).await;
                log::debug!(
                    "Room {}: {applied}/{} ops applied to replica",
                    room.id(),
                    ops.len()
                );
                if let Some(snapshot) = snapshot {
                    ctx.hooks.save(room.id(), &snapshot);
                }
                room.broadcast(Some(connection_id), &ServerMessage::StorageOps { ops, clock })?;
            }
            Ok(Frame::Custom(message)) => {
                room.broadcast_raw(Some(connection_id), Arc::from(text));
                if let Some(user) = room.user(&connection_id).await {
                    ctx.hooks.on_message(room.id(), &user.user_id, &message);
                }
            }
            Err(e) => {
                ctx.stats.write().await.malformed_messages += 1;
                log::warn!("Dropping frame in room {}: {e}", room.id());
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.active_rooms = self.ctx.registry.room_count().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.ctx.registry
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}
