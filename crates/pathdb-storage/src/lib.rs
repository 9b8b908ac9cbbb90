//! # pathdb-storage
//!
//! Storage layer for the path database.
//!
//! This crate provides the persistence surface consumed by the layered
//! state database:
//! - A [`KeyValueStore`] abstraction with atomic batch writes
//! - Column families separating trie nodes, flat snapshot entries and
//!   metadata
//! - A RocksDB-backed implementation and an in-memory implementation
//!   for tests
//! - An append-only [`Freezer`] holding the state history table
//!
//! ## Column Families
//!
//! - `AccountTrie`: account trie nodes keyed by node path
//! - `StorageTrie`: storage trie nodes keyed by owner hash and path
//! - `AccountSnapshot`: flat account entries keyed by account hash
//! - `StorageSnapshot`: flat storage entries keyed by account and slot hash
//! - `StateIds`: state root to state id lookups
//! - `Metadata`: singleton progress markers and the shutdown journal

mod batch;
mod database;
mod error;
mod freezer;
mod memory;
pub mod schema;

pub use batch::WriteBatch;
pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use freezer::Freezer;
pub use memory::MemoryStore;
pub use schema::ColumnFamily;

/// Storage trait for abstracting key-value database operations.
///
/// This allows the state database to run against RocksDB in production
/// and against an in-memory store in tests.
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute a batch of writes atomically.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Create an iterator over a column family.
    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Flush all pending writes durably to disk.
    fn sync(&self) -> StorageResult<()>;
}
