//! Storage operations: the only unit that crosses the wire or enters history.

use serde::{Deserialize, Serialize};

use crate::value::SerializedCrdt;

/// A single mutation of one container, addressed by the container's path.
///
/// `path` lists the keys (for objects and maps) or positions (for lists)
/// from the root to the target container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageOp {
    Set {
        path: Vec<String>,
        key: String,
        value: SerializedCrdt,
        clock: u64,
    },
    Delete {
        path: Vec<String>,
        key: String,
        clock: u64,
    },
    ListInsert {
        path: Vec<String>,
        position: String,
        value: SerializedCrdt,
        clock: u64,
    },
    ListDelete {
        path: Vec<String>,
        position: String,
        clock: u64,
    },
    ListMove {
        path: Vec<String>,
        #[serde(rename = "fromPosition")]
        from_position: String,
        #[serde(rename = "toPosition")]
        to_position: String,
        clock: u64,
    },
}

impl StorageOp {
    pub fn clock(&self) -> u64 {
        match self {
            StorageOp::Set { clock, .. }
            | StorageOp::Delete { clock, .. }
            | StorageOp::ListInsert { clock, .. }
            | StorageOp::ListDelete { clock, .. }
            | StorageOp::ListMove { clock, .. } => *clock,
        }
    }

    pub(crate) fn set_clock(&mut self, value: u64) {
        match self {
            StorageOp::Set { clock, .. }
            | StorageOp::Delete { clock, .. }
            | StorageOp::ListInsert { clock, .. }
            | StorageOp::ListDelete { clock, .. }
            | StorageOp::ListMove { clock, .. } => *clock = value,
        }
    }

    pub fn path(&self) -> &[String] {
        match self {
            StorageOp::Set { path, .. }
            | StorageOp::Delete { path, .. }
            | StorageOp::ListInsert { path, .. }
            | StorageOp::ListDelete { path, .. }
            | StorageOp::ListMove { path, .. } => path,
        }
    }

    /// Wire name of the operation.
    pub fn type_name(&self) -> &'static str {
        match self {
            StorageOp::Set { .. } => "set",
            StorageOp::Delete { .. } => "delete",
            StorageOp::ListInsert { .. } => "list-insert",
            StorageOp::ListDelete { .. } => "list-delete",
            StorageOp::ListMove { .. } => "list-move",
        }
    }
}

/// Result of applying one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed.
    Applied,
    /// Rejected by the per-key clock comparison (or an exact duplicate).
    Stale,
    /// The path or position no longer resolves, or names the wrong kind of
    /// container.
    Unresolved,
}
