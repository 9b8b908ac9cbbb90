//! Error types for the layered state database.

use crate::types::Hash;
use thiserror::Error;

/// State database errors.
#[derive(Error, Debug)]
pub enum PathDbError {
    /// Operation against a layer superseded by commit or revert.
    /// Callers should refetch the current head and retry.
    #[error("Layer is stale")]
    Stale,

    /// Mutation attempted after journaling or on a read-only database.
    #[error("Database is read-only")]
    ReadOnly,

    /// State access before an external state sync has completed.
    #[error("Database is waiting for state sync")]
    WaitSync,

    /// The requested flat state lies beyond the snapshot generation
    /// marker; the caller must fall back to trie traversal.
    #[error("Flat state not covered by snapshot yet")]
    NotCovered,

    /// The history entry's post root does not match the disk root.
    #[error("Unexpected state history: post root {post}, disk root {disk}")]
    UnexpectedHistory { post: Hash, disk: Hash },

    /// The requested target cannot be reached with available history.
    #[error("State is unrecoverable: {0}")]
    StateUnrecoverable(Hash),

    /// No shutdown journal is present.
    #[error("Shutdown journal is missing")]
    MissingJournal,

    /// The journal does not belong to the persistent state.
    #[error("Unmatched shutdown journal: journaled {journaled}, stored {stored}")]
    UnmatchedJournal { journaled: Hash, stored: Hash },

    /// The journal or history version is not understood.
    #[error("Unexpected version: {0}")]
    UnexpectedVersion(u64),

    /// Revert requested against an empty write buffer.
    #[error("Write buffer is empty")]
    BufferEmpty,

    /// The layer tree holds no layer for the requested root.
    #[error("Unknown state root: {0}")]
    UnknownRoot(Hash),

    /// A layer insertion would form a cycle.
    #[error("Layer cycle at root {0}")]
    Cycle(Hash),

    /// The provided root does not match the persistent state.
    #[error("State root mismatch: stored {stored}, provided {provided}")]
    RootMismatch { stored: Hash, provided: Hash },

    /// A persisted record failed decoding.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The state root produced by a reverse trie replay does not match
    /// the recorded prior root.
    #[error("Reverse replay root mismatch: computed {computed}, recorded {recorded}")]
    ReplayMismatch { computed: Hash, recorded: Hash },

    /// A background flush failed earlier; the original error is
    /// preserved as text for repeated waiters.
    #[error("Background flush failed: {0}")]
    Flush(String),

    /// Storage layer error.
    #[error("Storage error: {0}")]
    Storage(#[from] pathdb_storage::StorageError),
}

/// Result type for state database operations.
pub type PathDbResult<T> = Result<T, PathDbError>;
