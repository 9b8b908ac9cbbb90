//! Error types for the storage layer.

use thiserror::Error;

/// Storage layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Column family not found.
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Freezer item id outside the live range.
    #[error("Freezer id out of range: tail {tail}, head {head}, requested {requested}")]
    OutOfRange {
        tail: u64,
        head: u64,
        requested: u64,
    },

    /// Freezer append with a non-consecutive id.
    #[error("Non-consecutive freezer append: head {head}, appended {appended}")]
    StaleAppend { head: u64, appended: u64 },

    /// On-disk record failed validation.
    #[error("Corrupted storage record: {0}")]
    Corrupted(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
