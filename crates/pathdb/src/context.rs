//! Shared collaborators threaded through every layer generation.

use crate::config::Config;
use crate::history::HistoryStore;
use crate::{HistoryIndexer, TrieOpener};
use parking_lot::RwLock;
use pathdb_storage::KeyValueStore;
use std::sync::Arc;

/// Immutable bundle of the database's external collaborators, shared
/// by the facade and every disk layer instance it produces.
pub(crate) struct DbContext {
    /// Persistent storage for matured trie nodes and flat state.
    pub store: Arc<dyn KeyValueStore>,
    /// State history table, absent when rollback is disabled.
    pub history: Option<Arc<HistoryStore>>,
    /// Trie access for reverse replays.
    pub opener: Arc<dyn TrieOpener>,
    /// Optional observer of history growth and shrinkage.
    pub indexer: RwLock<Option<Arc<dyn HistoryIndexer>>>,
    /// Effective (sanitized) configuration.
    pub config: Config,
}
