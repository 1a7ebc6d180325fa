//! # tandem-collab — rooms, presence and storage sync over WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ Room        │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │    JSON frames      │ (central)    │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌──────────────┐
//! │ Document    │                     │ RoomRegistry │
//! │ (replica)   │                     │ idle cleanup │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ BroadcastRoom  │
//!                                    │ fan-out+replica│
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire messages
//! - [`presence`] — roster entries, cursors, colors, follow helpers
//! - [`broadcast`] — per-room fan-out, membership and storage replica
//! - [`registry`] — room lookup and idle-room cleanup
//! - [`hooks`] — auth and lifecycle extension points
//! - [`server`] — WebSocket relay server
//! - [`transport`] — client transport abstraction
//! - [`client`] — client room with reconnect and cursor throttling

pub mod broadcast;
pub mod client;
pub mod error;
pub mod hooks;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastRoom, BroadcastStats, ConnectionId, Envelope};
pub use client::{ConnectionState, ReconnectPolicy, Room, RoomEvent, RoomOptions};
pub use error::RoomError;
pub use hooks::{AuthHandler, Identity, JoinRequest, NoopHooks, QueryAuth, RoomHooks};
pub use presence::{
    color_for, followers_of, CursorData, CursorPosition, CursorType, HighlightRect,
    PresenceUser, ViewportPos,
};
pub use protocol::{ClientMessage, Frame, ProtocolError, ServerMessage, WireMessage};
pub use registry::RoomRegistry;
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use transport::{Connector, Transport, TransportEvent, WebSocketConnector};
