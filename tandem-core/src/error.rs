use thiserror::Error;

use crate::fractional_index::OrderKeyError;
use crate::value::{ContainerKind, NodeId};

/// Misuse of the local document API.
///
/// Remote operations never produce these; they report an
/// [`ApplyOutcome`](crate::ApplyOutcome) instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("node {0} is no longer part of the document")]
    StaleNode(NodeId),
    #[error("expected a {expected} container, found {found}")]
    WrongContainer {
        expected: &'static str,
        found: ContainerKind,
    },
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("document root must be a LiveObject")]
    InvalidRoot,
    #[error(transparent)]
    OrderKey(#[from] OrderKeyError),
}

pub type Result<T> = std::result::Result<T, StorageError>;
