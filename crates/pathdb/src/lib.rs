//! # pathdb
//!
//! A path-addressed, versioned trie store for blockchain state.
//!
//! The database maintains a stack of in-memory state layers on top of
//! a single persistent key-value store:
//! - One disk layer anchored at the persisted state, owning the write
//!   buffer and the shared clean caches
//! - Arbitrarily many immutable diff layers stacked above it, one per
//!   block transition, forming a tree under reorgs
//! - A write buffer aggregating committed diffs, flushed to disk by a
//!   background worker once its size budget is exceeded
//! - An append-only state history journal of reverse diffs permitting
//!   bounded rollback
//! - A shutdown journal rehydrating the layer tree across restarts
//!
//! ## Architecture
//!
//! New layers are appended by [`Database::update`]; once the diff
//! stack grows beyond the configured depth the bottom-most diffs are
//! flattened into the disk layer. [`Database::recover`] walks the
//! state history backwards to restore a previous root.

mod account;
mod buffer;
mod cache;
mod codec;
mod config;
mod context;
mod database;
mod difflayer;
mod disklayer;
mod error;
mod history;
mod journal;
mod layertree;
mod nodes;
mod revert;
mod states;
mod types;

pub use account::Account;
pub use buffer::Buffer;
pub use cache::CleanCache;
pub use config::{
    Config, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_DIFF_LAYERS, DEFAULT_STATE_CLEAN_SIZE,
    DEFAULT_STATE_HISTORY, DEFAULT_TRIE_CLEAN_SIZE, MAX_BUFFER_SIZE,
};
pub use database::{Database, Reader};
pub use difflayer::{AccountFilter, DiffLayer};
pub use disklayer::DiskLayer;
pub use error::{PathDbError, PathDbResult};
pub use history::{HistoryEntry, HistoryMeta, HistoryStore, HISTORY_V0, HISTORY_V1};
pub use layertree::LayerTree;
pub use nodes::{Node, NodeSet};
pub use states::{StateSet, StateSetWithOrigin};
pub use types::{Address, Hash, EMPTY_CODE_HASH, EMPTY_ROOT};

use std::sync::Arc;

/// A trie opened at a specific root for reverse replays.
pub trait RevertTrie {
    /// Get the value stored under the key.
    fn get(&self, key: &[u8]) -> PathDbResult<Option<Vec<u8>>>;

    /// Insert or overwrite the value stored under the key.
    fn update(&mut self, key: &[u8], value: Vec<u8>) -> PathDbResult<()>;

    /// Remove the value stored under the key.
    fn delete(&mut self, key: &[u8]) -> PathDbResult<()>;

    /// Finalize the mutations, returning the new root hash and the set
    /// of trie nodes rewritten on the way.
    fn commit(self: Box<Self>) -> PathDbResult<(Hash, NodeSet)>;
}

/// Access to trie construction, consumed by the revert engine. The
/// trie encoding itself lives outside this crate.
pub trait TrieOpener: Send + Sync {
    /// Open the account trie at the given state root.
    fn open_account_trie(&self, post_root: Hash) -> PathDbResult<Box<dyn RevertTrie>>;

    /// Open the storage trie of an account at the given storage root,
    /// within the state identified by `post_root`.
    fn open_storage_trie(
        &self,
        post_root: Hash,
        account_hash: Hash,
        storage_root: Hash,
    ) -> PathDbResult<Box<dyn RevertTrie>>;
}

/// The background task rebuilding the flat snapshot by iterating the
/// trie in key order. Only its lifecycle surface matters here; the
/// generation itself lives outside this crate.
pub trait SnapshotGenerator: Send + Sync {
    /// Start or resume generation against the given state root.
    fn run(&self, root: Hash);

    /// Stop generation, blocking until acknowledged.
    fn stop(&self);

    /// The last key produced, or `None` once generation completed.
    fn progress_marker(&self) -> Option<Vec<u8>>;

    /// Whether the whole flat snapshot has been generated.
    fn completed(&self) -> bool;
}

/// Observer of the state history store, notified when entries are
/// appended or the head shrinks.
pub trait HistoryIndexer: Send + Sync {
    /// A history entry with the given id was appended.
    fn extend(&self, id: u64) -> PathDbResult<()>;

    /// The history head shrank below the given id.
    fn shorten(&self, id: u64) -> PathDbResult<()>;
}

/// Where a node read was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSource {
    /// A diff layer above the disk layer.
    DiffLayer,
    /// The live or frozen write buffer.
    Buffer,
    /// The clean node cache.
    CleanCache,
    /// The persistent key-value store.
    Persistent,
}

/// Resolution info attached to node reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLocation {
    /// Which tier served the read.
    pub source: NodeSource,
    /// How many layers were traversed to get there.
    pub depth: usize,
}

/// One state layer: the persistent disk layer or an in-memory diff.
/// Readers walk the parent chain by matching on the variant.
#[derive(Clone)]
pub enum Layer {
    /// The single persistent-anchored layer.
    Disk(Arc<DiskLayer>),
    /// An immutable in-memory diff stacked on a parent.
    Diff(Arc<DiffLayer>),
}

impl Layer {
    /// Root hash the layer was made for.
    pub fn root(&self) -> Hash {
        match self {
            Layer::Disk(disk) => disk.root(),
            Layer::Diff(diff) => diff.root(),
        }
    }

    /// State id of the layer.
    pub fn state_id(&self) -> u64 {
        match self {
            Layer::Disk(disk) => disk.state_id(),
            Layer::Diff(diff) => diff.state_id(),
        }
    }

    /// The layer below, `None` for the disk layer.
    pub fn parent(&self) -> Option<Layer> {
        match self {
            Layer::Disk(_) => None,
            Layer::Diff(diff) => Some(diff.parent()),
        }
    }

    /// Stack a new diff layer on top of this one.
    pub fn update(
        &self,
        root: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Arc<DiffLayer> {
        DiffLayer::new(self.clone(), root, self.state_id() + 1, block, nodes, states)
    }

    /// Retrieve a trie node, walking down the parent chain until a
    /// layer holds the entry.
    pub fn node(&self, owner: &Hash, path: &[u8]) -> PathDbResult<(Vec<u8>, Hash, NodeLocation)> {
        let mut layer = self.clone();
        let mut depth = 0;
        loop {
            match layer {
                Layer::Diff(diff) => {
                    if let Some(node) = diff.node(owner, path) {
                        return Ok((
                            node.blob.clone(),
                            node.hash,
                            NodeLocation {
                                source: NodeSource::DiffLayer,
                                depth,
                            },
                        ));
                    }
                    depth += 1;
                    layer = diff.parent();
                }
                Layer::Disk(disk) => return disk.node(owner, path, depth),
            }
        }
    }

    /// Retrieve a flat account entry; an empty blob means absent.
    pub fn account(&self, hash: &Hash) -> PathDbResult<Vec<u8>> {
        let mut layer = self.clone();
        let mut depth = 0;
        loop {
            match layer {
                Layer::Diff(diff) => {
                    if let Some(blob) = diff.account(hash) {
                        return Ok(blob.to_vec());
                    }
                    depth += 1;
                    layer = diff.parent();
                }
                Layer::Disk(disk) => return disk.account(hash, depth),
            }
        }
    }

    /// Retrieve a flat storage entry; an empty blob means absent.
    pub fn storage(&self, account: &Hash, slot: &Hash) -> PathDbResult<Vec<u8>> {
        let mut layer = self.clone();
        let mut depth = 0;
        loop {
            match layer {
                Layer::Diff(diff) => {
                    if let Some(blob) = diff.storage(account, slot) {
                        return Ok(blob.to_vec());
                    }
                    depth += 1;
                    layer = diff.parent();
                }
                Layer::Disk(disk) => return disk.storage(account, slot, depth),
            }
        }
    }
}
