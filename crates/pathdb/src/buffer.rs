//! Write buffer aggregating committed diffs ahead of persistence.

use crate::cache::{node_cache_key, state_cache_key, CleanCache};
use crate::error::{PathDbError, PathDbResult};
use crate::history::HistoryStore;
use crate::nodes::NodeSet;
use crate::states::StateSet;
use crate::types::Hash;
use parking_lot::{Mutex, RwLock};
use pathdb_storage::{schema, ColumnFamily, KeyValueStore, WriteBatch};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

#[derive(Default)]
struct BufferData {
    nodes: NodeSet,
    states: StateSet,
    layers: u64,
}

impl BufferData {
    fn size(&self) -> u64 {
        self.nodes.size() + self.states.size()
    }
}

#[derive(Default)]
struct FlushState {
    scheduled: bool,
    handle: Option<JoinHandle<PathDbResult<()>>>,
    /// Outcome replayed to waiters after the worker is joined.
    result: Option<Result<(), String>>,
}

/// A mutable accumulator of dirty trie nodes and flat state mutations
/// with a size bound and an asynchronous flush pipeline.
///
/// The buffer is only mutated under the owning disk layer's write
/// lock; it is frozen (never committed into again) before that layer
/// goes stale, so readers may consult it concurrently.
pub struct Buffer {
    limit: usize,
    data: RwLock<BufferData>,
    flush: Mutex<FlushState>,
}

impl Buffer {
    /// Create a buffer with the given size budget and initial content.
    pub fn new(limit: usize, nodes: Option<NodeSet>, states: Option<StateSet>, layers: u64) -> Self {
        Self {
            limit,
            data: RwLock::new(BufferData {
                nodes: nodes.unwrap_or_default(),
                states: states.unwrap_or_default(),
                layers,
            }),
            flush: Mutex::new(FlushState::default()),
        }
    }

    /// Fold one transition's diff into the buffer.
    pub fn commit(&self, nodes: NodeSet, states: StateSet) {
        let mut data = self.data.write();
        data.nodes.merge(nodes);
        data.states.merge(states);
        data.layers += 1;
    }

    /// Look up a buffered trie node.
    pub fn node(&self, owner: &Hash, path: &[u8]) -> Option<(Vec<u8>, Hash)> {
        let data = self.data.read();
        data.nodes.node(owner, path).map(|n| (n.blob.clone(), n.hash))
    }

    /// Look up a buffered flat account entry.
    pub fn account(&self, hash: &Hash) -> Option<Vec<u8>> {
        self.data.read().states.account(hash).map(|b| b.to_vec())
    }

    /// Look up a buffered flat storage entry.
    pub fn storage(&self, account: &Hash, slot: &Hash) -> Option<Vec<u8>> {
        self.data
            .read()
            .states
            .storage(account, slot)
            .map(|b| b.to_vec())
    }

    /// Number of transitions folded into the buffer.
    pub fn layers(&self) -> u64 {
        self.data.read().layers
    }

    /// Whether no transition is buffered.
    pub fn is_empty(&self) -> bool {
        self.layers() == 0
    }

    /// Whether the accumulated writes exceed the size budget.
    pub fn is_full(&self) -> bool {
        self.size() >= self.limit as u64
    }

    /// Approximate byte footprint of the buffered mutations.
    pub fn size(&self) -> u64 {
        self.data.read().size()
    }

    /// Snapshot the buffered content for journaling.
    pub fn contents(&self) -> (NodeSet, StateSet) {
        let data = self.data.read();
        (data.nodes.clone(), data.states.clone())
    }

    /// Undo the most recent transition by applying reverse deltas.
    ///
    /// Entries present in the buffer are rewound in place (an empty
    /// prior value leaves a deletion marker shadowing the persistent
    /// store). Entries absent from the buffer were flushed earlier and
    /// their prior values are written straight to the store, with the
    /// clean caches invalidated.
    pub fn revert_to(
        &self,
        store: &dyn KeyValueStore,
        nodes: &NodeSet,
        accounts: &HashMap<Hash, Vec<u8>>,
        storages: &HashMap<Hash, HashMap<Hash, Vec<u8>>>,
        node_cache: Option<&CleanCache>,
        state_cache: Option<&CleanCache>,
    ) -> PathDbResult<()> {
        let mut data = self.data.write();
        if data.layers == 0 {
            return Err(PathDbError::BufferEmpty);
        }
        data.layers -= 1;

        let mut batch = WriteBatch::new();
        for (owner, subset) in nodes.iter() {
            for (path, prev) in subset {
                if data.nodes.node(owner, path).is_some() {
                    data.nodes.insert(*owner, path.clone(), prev.clone());
                    continue;
                }
                let key = node_cache_key(owner, path);
                if owner.is_zero() {
                    if prev.is_deleted() {
                        batch.delete(ColumnFamily::AccountTrie, path.clone());
                    } else {
                        batch.put(ColumnFamily::AccountTrie, path.clone(), prev.blob.clone());
                    }
                } else {
                    let db_key = schema::storage_trie_key(owner.as_bytes(), path);
                    if prev.is_deleted() {
                        batch.delete(ColumnFamily::StorageTrie, db_key);
                    } else {
                        batch.put(ColumnFamily::StorageTrie, db_key, prev.blob.clone());
                    }
                }
                if let Some(cache) = node_cache {
                    cache.remove(&key);
                }
            }
        }
        for (hash, prev) in accounts {
            if data.states.account(hash).is_some() {
                data.states.insert_account(*hash, prev.clone());
                continue;
            }
            if prev.is_empty() {
                batch.delete(ColumnFamily::AccountSnapshot, hash.as_bytes().to_vec());
            } else {
                batch.put(
                    ColumnFamily::AccountSnapshot,
                    hash.as_bytes().to_vec(),
                    prev.clone(),
                );
            }
            if let Some(cache) = state_cache {
                cache.remove(hash.as_bytes());
            }
        }
        for (account, slots) in storages {
            for (slot, prev) in slots {
                if data.states.storage(account, slot).is_some() {
                    data.states.insert_storage(*account, *slot, prev.clone());
                    continue;
                }
                let db_key = schema::storage_snapshot_key(account.as_bytes(), slot.as_bytes());
                if prev.is_empty() {
                    batch.delete(ColumnFamily::StorageSnapshot, db_key);
                } else {
                    batch.put(ColumnFamily::StorageSnapshot, db_key, prev.clone());
                }
                if let Some(cache) = state_cache {
                    cache.remove(&state_cache_key(account, slot));
                }
            }
        }
        if !batch.is_empty() {
            store.write_batch(batch)?;
        }
        Ok(())
    }

    /// Schedule the background write of the buffered content.
    ///
    /// Idempotent: once scheduled, later calls are ignored and
    /// [`Self::wait_flush`] observes the recorded outcome. On success
    /// the buffer is cleared and `on_done` runs; on failure the buffer
    /// is left intact and the error surfaces at the next
    /// synchronization point.
    #[allow(clippy::too_many_arguments)]
    pub fn flush(
        self: &Arc<Self>,
        root: Hash,
        store: Arc<dyn KeyValueStore>,
        history: Option<Arc<HistoryStore>>,
        progress: Option<Vec<u8>>,
        node_cache: Option<Arc<CleanCache>>,
        state_cache: Option<Arc<CleanCache>>,
        state_id: u64,
        on_done: impl FnOnce() + Send + 'static,
    ) {
        let mut flush = self.flush.lock();
        if flush.scheduled {
            warn!(%root, "Buffer flush already scheduled");
            return;
        }
        flush.scheduled = true;

        let buffer = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("buffer-flusher".into())
            .spawn(move || {
                let result = buffer.run_flush(
                    root,
                    store,
                    history,
                    progress,
                    node_cache,
                    state_cache,
                    state_id,
                );
                if result.is_ok() {
                    on_done();
                }
                result
            })
            .expect("Failed to spawn buffer flush thread");
        flush.handle = Some(handle);
    }

    /// Block until the scheduled flush completes, surfacing its
    /// outcome. Safe to call repeatedly and before any flush was
    /// scheduled.
    pub fn wait_flush(&self) -> PathDbResult<()> {
        let mut flush = self.flush.lock();
        if let Some(handle) = flush.handle.take() {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(PathDbError::Flush("flush worker panicked".into())));
            match result {
                Ok(()) => {
                    flush.result = Some(Ok(()));
                    Ok(())
                }
                Err(err) => {
                    flush.result = Some(Err(err.to_string()));
                    Err(err)
                }
            }
        } else {
            match &flush.result {
                Some(Ok(())) | None => Ok(()),
                Some(Err(msg)) => Err(PathDbError::Flush(msg.clone())),
            }
        }
    }

    /// The flush body, run on the worker thread.
    #[allow(clippy::too_many_arguments)]
    fn run_flush(
        &self,
        root: Hash,
        store: Arc<dyn KeyValueStore>,
        history: Option<Arc<HistoryStore>>,
        progress: Option<Vec<u8>>,
        node_cache: Option<Arc<CleanCache>>,
        state_cache: Option<Arc<CleanCache>>,
        state_id: u64,
    ) -> PathDbResult<()> {
        // State histories must be durable before the persistent state
        // id is allowed to advance past them.
        if let Some(history) = &history {
            history.sync()?;
        }
        let data = self.data.read();
        let persisted = schema::read_persistent_state_id(store.as_ref())?;
        if persisted + data.layers != state_id {
            panic!(
                "inconsistent flush target: persisted {persisted}, buffered {}, flushing {state_id}",
                data.layers
            );
        }
        if data.layers == 0 && persisted == state_id {
            return Ok(());
        }
        let mut batch = WriteBatch::with_capacity(data.nodes.len());

        // 1. Trie nodes.
        write_nodes(&mut batch, &data.nodes, node_cache.as_deref());
        // 2. Flat states, gated by the generator progress marker.
        write_states(
            &mut batch,
            progress.as_deref(),
            data.states.accounts(),
            data.states.storages(),
            state_cache.as_deref(),
        );
        // 3-4. Metadata advances atomically with the state writes.
        schema::write_persistent_state_id(&mut batch, state_id);
        schema::write_snapshot_root(&mut batch, root.as_bytes());

        let written = batch.value_size();
        store.write_batch(batch)?;
        drop(data);

        let mut data = self.data.write();
        data.nodes.clear();
        data.states.clear();
        data.layers = 0;
        debug!(%root, state_id, written, "Flushed write buffer");
        Ok(())
    }
}

/// Queue the node set into the batch, keeping the clean cache in step:
/// written blobs are cached, deletions are dropped from the cache.
pub(crate) fn write_nodes(batch: &mut WriteBatch, nodes: &NodeSet, cache: Option<&CleanCache>) {
    for (owner, subset) in nodes.iter() {
        for (path, node) in subset {
            if owner.is_zero() {
                if node.is_deleted() {
                    batch.delete(ColumnFamily::AccountTrie, path.clone());
                } else {
                    batch.put(ColumnFamily::AccountTrie, path.clone(), node.blob.clone());
                }
            } else {
                let key = schema::storage_trie_key(owner.as_bytes(), path);
                if node.is_deleted() {
                    batch.delete(ColumnFamily::StorageTrie, key);
                } else {
                    batch.put(ColumnFamily::StorageTrie, key, node.blob.clone());
                }
            }
            if let Some(cache) = cache {
                let key = node_cache_key(owner, path);
                if node.is_deleted() {
                    cache.remove(&key);
                } else {
                    cache.set(key, node.blob.clone());
                }
            }
        }
    }
}

/// Queue the flat state mutations into the batch, skipping keys beyond
/// the generator progress marker: those regions will be produced
/// deterministically by the generator and must not be overwritten.
/// Cached entries include tombstones for deletions.
pub(crate) fn write_states(
    batch: &mut WriteBatch,
    marker: Option<&[u8]>,
    accounts: &HashMap<Hash, Vec<u8>>,
    storages: &HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    cache: Option<&CleanCache>,
) {
    for (hash, blob) in accounts {
        if let Some(marker) = marker {
            if hash.as_bytes().as_slice() > marker {
                continue;
            }
        }
        if blob.is_empty() {
            batch.delete(ColumnFamily::AccountSnapshot, hash.as_bytes().to_vec());
        } else {
            batch.put(
                ColumnFamily::AccountSnapshot,
                hash.as_bytes().to_vec(),
                blob.clone(),
            );
        }
        if let Some(cache) = cache {
            cache.set(hash.as_bytes().to_vec(), blob.clone());
        }
    }
    for (account, slots) in storages {
        for (slot, blob) in slots {
            let key = state_cache_key(account, slot);
            if let Some(marker) = marker {
                if key.as_slice() > marker {
                    continue;
                }
            }
            let db_key = schema::storage_snapshot_key(account.as_bytes(), slot.as_bytes());
            if blob.is_empty() {
                batch.delete(ColumnFamily::StorageSnapshot, db_key);
            } else {
                batch.put(ColumnFamily::StorageSnapshot, db_key, blob.clone());
            }
            if let Some(cache) = cache {
                cache.set(key, blob.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Node;
    use pathdb_storage::MemoryStore;

    fn simple_sets(seed: u8) -> (NodeSet, StateSet) {
        let mut nodes = NodeSet::new();
        nodes.insert(
            Hash::ZERO,
            vec![seed],
            Node::new(vec![seed; 4]),
        );
        let mut states = StateSet::empty();
        states.insert_account(Hash([seed; 32]), vec![seed; 3]);
        (nodes, states)
    }

    #[test]
    fn test_commit_and_lookup() {
        let buffer = Buffer::new(1 << 20, None, None, 0);
        assert!(buffer.is_empty());

        let (nodes, states) = simple_sets(1);
        buffer.commit(nodes, states);
        assert_eq!(buffer.layers(), 1);
        assert!(!buffer.is_empty());

        let (blob, hash) = buffer.node(&Hash::ZERO, &[1]).unwrap();
        assert_eq!(blob, vec![1; 4]);
        assert_eq!(hash, Hash::of_node(&[1; 4]));
        assert_eq!(buffer.account(&Hash([1u8; 32])).unwrap(), vec![1; 3]);
        assert_eq!(buffer.account(&Hash([9u8; 32])), None);
    }

    #[test]
    fn test_full_tracks_size_budget() {
        let buffer = Buffer::new(8, None, None, 0);
        assert!(!buffer.is_full());
        let (nodes, states) = simple_sets(1);
        buffer.commit(nodes, states);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_flush_writes_and_clears() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = Arc::new(Buffer::new(1 << 20, None, None, 0));
        let (nodes, states) = simple_sets(3);
        buffer.commit(nodes, states);

        let root = Hash([3u8; 32]);
        buffer.flush(root, Arc::clone(&store), None, None, None, None, 1, || {});
        buffer.wait_flush().unwrap();

        assert!(buffer.is_empty());
        assert_eq!(buffer.size(), 0);
        assert_eq!(
            store.get(ColumnFamily::AccountTrie, &[3]).unwrap(),
            Some(vec![3; 4])
        );
        assert_eq!(
            store
                .get(ColumnFamily::AccountSnapshot, Hash([3u8; 32]).as_bytes())
                .unwrap(),
            Some(vec![3; 3])
        );
        assert_eq!(schema::read_persistent_state_id(store.as_ref()).unwrap(), 1);
        assert_eq!(
            schema::read_snapshot_root(store.as_ref()).unwrap(),
            Some(*root.as_bytes())
        );
    }

    #[test]
    fn test_flush_respects_progress_marker() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = Arc::new(Buffer::new(1 << 20, None, None, 0));

        let mut states = StateSet::empty();
        states.insert_account(Hash([0x10; 32]), b"covered".to_vec());
        states.insert_account(Hash([0xf0; 32]), b"beyond".to_vec());
        buffer.commit(NodeSet::new(), states);

        // Marker sits between the two account hashes.
        buffer.flush(
            Hash([1u8; 32]),
            Arc::clone(&store),
            None,
            Some(vec![0x80; 32]),
            None,
            None,
            1,
            || {},
        );
        buffer.wait_flush().unwrap();

        assert_eq!(
            store
                .get(ColumnFamily::AccountSnapshot, Hash([0x10; 32]).as_bytes())
                .unwrap(),
            Some(b"covered".to_vec())
        );
        assert_eq!(
            store
                .get(ColumnFamily::AccountSnapshot, Hash([0xf0; 32]).as_bytes())
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_wait_flush_is_replayable() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let buffer = Arc::new(Buffer::new(1 << 20, None, None, 0));
        let (nodes, states) = simple_sets(5);
        buffer.commit(nodes, states);

        buffer.flush(Hash([5u8; 32]), store, None, None, None, None, 1, || {});
        buffer.wait_flush().unwrap();
        buffer.wait_flush().unwrap();
    }

    #[test]
    fn test_revert_to_rewinds_buffer() {
        let store = MemoryStore::new();
        let buffer = Buffer::new(1 << 20, None, None, 0);

        let (nodes, states) = simple_sets(7);
        buffer.commit(nodes, states);

        // The node existed with an older value, the account did not.
        let mut prev_nodes = NodeSet::new();
        prev_nodes.insert(Hash::ZERO, vec![7], Node::new(b"old".to_vec()));
        let mut prev_accounts = HashMap::new();
        prev_accounts.insert(Hash([7u8; 32]), Vec::new());

        buffer
            .revert_to(&store, &prev_nodes, &prev_accounts, &HashMap::new(), None, None)
            .unwrap();

        assert!(buffer.is_empty());
        let (blob, _) = buffer.node(&Hash::ZERO, &[7]).unwrap();
        assert_eq!(blob, b"old");
        // Deletion marker shadows whatever the store may hold.
        assert_eq!(buffer.account(&Hash([7u8; 32])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_revert_to_empty_buffer_fails() {
        let store = MemoryStore::new();
        let buffer = Buffer::new(1 << 20, None, None, 0);
        let result = buffer.revert_to(
            &store,
            &NodeSet::new(),
            &HashMap::new(),
            &HashMap::new(),
            None,
            None,
        );
        assert!(matches!(result, Err(PathDbError::BufferEmpty)));
    }

    #[test]
    fn test_revert_to_writes_through_for_flushed_entries() {
        let store = MemoryStore::new();
        store
            .put(ColumnFamily::AccountSnapshot, Hash([1u8; 32]).as_bytes(), b"flushed")
            .unwrap();

        // One layer buffered, but the reverted account is not in it.
        let buffer = Buffer::new(1 << 20, None, None, 1);
        let mut prev_accounts = HashMap::new();
        prev_accounts.insert(Hash([1u8; 32]), b"prior".to_vec());

        buffer
            .revert_to(&store, &NodeSet::new(), &prev_accounts, &HashMap::new(), None, None)
            .unwrap();

        assert_eq!(
            store
                .get(ColumnFamily::AccountSnapshot, Hash([1u8; 32]).as_bytes())
                .unwrap(),
            Some(b"prior".to_vec())
        );
    }
}
