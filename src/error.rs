use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// What family of object a lookup was for. Carried inside [`StoreError::NotFound`]
/// and used by the fetch pipeline to pick the right queue bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A directory listing.
    Tree,
    /// File contents.
    Blob,
    /// Derived hashes and size stored next to a blob.
    BlobAux,
    /// Derived digest stored next to a tree.
    TreeAux,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::Tree => "tree",
            ObjectKind::Blob => "blob",
            ObjectKind::BlobAux => "blob aux data",
            ObjectKind::TreeAux => "tree aux data",
        };
        f.write_str(name)
    }
}

/// Error taxonomy for the storage core.
///
/// Journal truncation observed through a range result is reported on the
/// range itself, not through this type; `Truncated` covers callers that
/// require a contiguous range and cannot proceed without one.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound {
        /// Object family the lookup was for.
        kind: ObjectKind,
        /// Rendered id of the missing object.
        id: String,
    },
    #[error("journal range precedes the oldest kept entry")]
    Truncated,
    #[error("corruption detected: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("fetch timed out")]
    Timeout,
    #[error("request dropped before completion")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("malformed path: {0}")]
    MalformedPath(String),
}

impl StoreError {
    /// Build a `NotFound` for the given kind and rendered id.
    pub fn not_found(kind: ObjectKind, id: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// A fetch failure is delivered to every deduplicated waiter, so errors must
// be duplicable. `io::Error` is not `Clone`; rebuild it from kind+message.
impl Clone for StoreError {
    fn clone(&self) -> Self {
        match self {
            StoreError::NotFound { kind, id } => StoreError::NotFound {
                kind: *kind,
                id: id.clone(),
            },
            StoreError::Truncated => StoreError::Truncated,
            StoreError::Corrupt(reason) => StoreError::Corrupt(reason.clone()),
            StoreError::Io(err) => StoreError::Io(io::Error::new(err.kind(), err.to_string())),
            StoreError::Timeout => StoreError::Timeout,
            StoreError::Cancelled => StoreError::Cancelled,
            StoreError::Protocol(reason) => StoreError::Protocol(reason.clone()),
            StoreError::MalformedPath(reason) => StoreError::MalformedPath(reason.clone()),
        }
    }
}
