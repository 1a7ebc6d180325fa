//! # tandem-core — Replicated document engine for Tandem
//!
//! Conflict-free containers kept in sync by exchanging small operations.
//!
//! ## Architecture
//!
//! ```text
//!   local edit                              remote StorageOp
//!       │                                          │
//!       ▼                                          ▼
//! ┌─────────────┐  tick   ┌──────────────┐  merge ┌─────────────┐
//! │ Document API│ ──────► │ LamportClock │ ◄───── │ apply_op    │
//! └──────┬──────┘         └──────────────┘        └──────┬──────┘
//!        │ StorageOp                                     │ resolve path
//!        ▼                                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Arena<Node>: LiveObject / LiveMap / LiveList (per-key LWW)   │
//! └──────┬───────────────────────┬───────────────────────┬───────┘
//!        ▼                       ▼                       ▼
//!   History (undo)        subscriptions           on_ops_generated
//! ```
//!
//! ## Modules
//!
//! - [`clock`] — Lamport clock
//! - [`fractional_index`] — order keys for lists
//! - [`value`] — serialized snapshots and attached values
//! - [`op`] — wire operations
//! - [`document`] — the container tree and everything that mutates it
//! - [`history`] — undo/redo stacks
//!
//! ## Convergence rules
//!
//! | Container | Conflict policy |
//! |-----------|-----------------|
//! | `LiveObject` | per-key LWW, ties rejected, deletes keep their clock |
//! | `LiveMap` | per-key LWW with tombstones until `compact` |
//! | `LiveList` | ordered by `(position, clock, value)`, delete wins |

mod arena;
pub mod clock;
pub mod document;
pub mod error;
pub mod fractional_index;
pub mod history;
mod list;
mod map;
mod object;
pub mod op;
pub mod value;

pub use clock::LamportClock;
pub use document::{Document, OpsHook, SubscriptionId};
pub use error::{Result, StorageError};
pub use fractional_index::{generate_key_between, generate_n_keys_between, OrderKeyError};
pub use history::{History, HistoryEntry, DEFAULT_HISTORY_LIMIT};
pub use op::{ApplyOutcome, StorageOp};
pub use value::{
    ContainerKind, NodeId, SerializedContainer, SerializedCrdt, SerializedListItem, Value,
};
