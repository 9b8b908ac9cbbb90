//! The persistent-anchored disk layer.

use crate::buffer::{write_nodes, write_states, Buffer};
use crate::cache::{node_cache_key, state_cache_key, CleanCache};
use crate::context::DbContext;
use crate::difflayer::DiffLayer;
use crate::error::{PathDbError, PathDbResult};
use crate::history::HistoryEntry;
use crate::types::Hash;
use crate::{NodeLocation, NodeSource, SnapshotGenerator};
use parking_lot::RwLock;
use pathdb_storage::{schema, ColumnFamily, KeyValueStore, WriteBatch};
use std::sync::Arc;
use tracing::{debug, info};

struct DiskInner {
    /// Set when a newer disk layer supersedes this one; all reads are
    /// refused afterwards.
    stale: bool,
    /// Live buffer aggregating committed diffs.
    buffer: Arc<Buffer>,
    /// Frozen buffer waiting for its background flush, at most one.
    frozen: Option<Arc<Buffer>>,
    /// Set while the flat snapshot is not fully generated, regardless
    /// of whether generation is currently running.
    generator: Option<Arc<dyn SnapshotGenerator>>,
}

/// The sole persistent layer: serves reads through the buffers and
/// clean caches down to the key-value store, and mediates commit,
/// revert and generator lifecycle.
pub struct DiskLayer {
    root: Hash,
    id: u64,
    ctx: Arc<DbContext>,

    // The two caches are kept separate because the cache key of a
    // storage trie root node (the owner hash) collides with the cache
    // key of the same account's flat entry.
    node_cache: Option<Arc<CleanCache>>,
    state_cache: Option<Arc<CleanCache>>,

    inner: RwLock<DiskInner>,
}

impl DiskLayer {
    /// Build a disk layer, initializing the clean caches when they are
    /// not inherited from a previous generation.
    pub(crate) fn new(
        root: Hash,
        id: u64,
        ctx: Arc<DbContext>,
        node_cache: Option<Arc<CleanCache>>,
        state_cache: Option<Arc<CleanCache>>,
        buffer: Arc<Buffer>,
        frozen: Option<Arc<Buffer>>,
    ) -> Arc<Self> {
        let node_cache = node_cache.or_else(|| {
            (ctx.config.trie_clean_size != 0)
                .then(|| Arc::new(CleanCache::new(ctx.config.trie_clean_size)))
        });
        let state_cache = state_cache.or_else(|| {
            (ctx.config.state_clean_size != 0)
                .then(|| Arc::new(CleanCache::new(ctx.config.state_clean_size)))
        });
        Arc::new(Self {
            root,
            id,
            ctx,
            node_cache,
            state_cache,
            inner: RwLock::new(DiskInner {
                stale: false,
                buffer,
                frozen,
                generator: None,
            }),
        })
    }

    /// Root hash this layer was made for.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// State id of the newest transition folded into this layer.
    pub fn state_id(&self) -> u64 {
        self.id
    }

    /// Whether the layer was superseded.
    pub fn is_stale(&self) -> bool {
        self.inner.read().stale
    }

    /// Flag the layer as superseded. Marking twice means two children
    /// committed into the same base, which is a programming bug.
    pub(crate) fn mark_stale(&self) {
        let mut inner = self.inner.write();
        if inner.stale {
            panic!("disk layer is stale");
        }
        inner.stale = true;
    }

    /// Link or unlink the snapshot generator.
    pub(crate) fn set_generator(&self, generator: Option<Arc<dyn SnapshotGenerator>>) {
        self.inner.write().generator = generator;
    }

    /// The linked generator, if the snapshot is incomplete.
    pub(crate) fn generator(&self) -> Option<Arc<dyn SnapshotGenerator>> {
        self.inner.read().generator.clone()
    }

    /// The generation progress marker; `None` once the flat snapshot
    /// is fully generated.
    pub fn gen_marker(&self) -> Option<Vec<u8>> {
        self.inner
            .read()
            .generator
            .as_ref()
            .and_then(|gen| gen.progress_marker())
    }

    /// Whether the flat snapshot covers the whole key space.
    pub fn gen_complete(&self) -> bool {
        self.gen_marker().is_none()
    }

    /// Retrieve a trie node. Lookup order: live buffer, frozen buffer,
    /// clean cache, persistent store.
    pub(crate) fn node(
        &self,
        owner: &Hash,
        path: &[u8],
        depth: usize,
    ) -> PathDbResult<(Vec<u8>, Hash, NodeLocation)> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(PathDbError::Stale);
        }
        for buffer in [Some(&inner.buffer), inner.frozen.as_ref()].into_iter().flatten() {
            if let Some((blob, hash)) = buffer.node(owner, path) {
                return Ok((
                    blob,
                    hash,
                    NodeLocation {
                        source: NodeSource::Buffer,
                        depth,
                    },
                ));
            }
        }
        let key = node_cache_key(owner, path);
        if let Some(cache) = &self.node_cache {
            if let Some(blob) = cache.get(&key) {
                if !blob.is_empty() {
                    let hash = Hash::keccak256(&blob);
                    return Ok((
                        blob,
                        hash,
                        NodeLocation {
                            source: NodeSource::CleanCache,
                            depth,
                        },
                    ));
                }
            }
        }
        let blob = if owner.is_zero() {
            self.ctx.store.get(ColumnFamily::AccountTrie, path)?
        } else {
            let db_key = schema::storage_trie_key(owner.as_bytes(), path);
            self.ctx.store.get(ColumnFamily::StorageTrie, &db_key)?
        }
        .unwrap_or_default();

        // The background flusher may populate the cache concurrently,
        // but both writers always carry the same value: anything still
        // in flight is discoverable in the frozen buffer above.
        if let Some(cache) = &self.node_cache {
            if !blob.is_empty() {
                cache.set(key, blob.clone());
            }
        }
        let hash = Hash::of_node(&blob);
        Ok((
            blob,
            hash,
            NodeLocation {
                source: NodeSource::Persistent,
                depth,
            },
        ))
    }

    /// Retrieve a flat account entry; an empty blob means absent. When
    /// the snapshot is still being generated and the key lies beyond
    /// the progress marker, the read is refused with `NotCovered`.
    pub(crate) fn account(&self, hash: &Hash, _depth: usize) -> PathDbResult<Vec<u8>> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(PathDbError::Stale);
        }
        for buffer in [Some(&inner.buffer), inner.frozen.as_ref()].into_iter().flatten() {
            if let Some(blob) = buffer.account(hash) {
                return Ok(blob);
            }
        }
        if let Some(generator) = &inner.generator {
            if let Some(marker) = generator.progress_marker() {
                if hash.as_bytes().as_slice() > marker.as_slice() {
                    return Err(PathDbError::NotCovered);
                }
            }
        }
        if let Some(cache) = &self.state_cache {
            if let Some(blob) = cache.get(hash.as_bytes()) {
                return Ok(blob);
            }
        }
        let blob = self
            .ctx
            .store
            .get(ColumnFamily::AccountSnapshot, hash.as_bytes())?
            .unwrap_or_default();
        if let Some(cache) = &self.state_cache {
            cache.set(hash.as_bytes().to_vec(), blob.clone());
        }
        Ok(blob)
    }

    /// Retrieve a flat storage entry; an empty blob means absent. The
    /// generator marker key is `account_hash || storage_hash`.
    pub(crate) fn storage(&self, account: &Hash, slot: &Hash, _depth: usize) -> PathDbResult<Vec<u8>> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(PathDbError::Stale);
        }
        for buffer in [Some(&inner.buffer), inner.frozen.as_ref()].into_iter().flatten() {
            if let Some(blob) = buffer.storage(account, slot) {
                return Ok(blob);
            }
        }
        let key = state_cache_key(account, slot);
        if let Some(generator) = &inner.generator {
            if let Some(marker) = generator.progress_marker() {
                if key.as_slice() > marker.as_slice() {
                    return Err(PathDbError::NotCovered);
                }
            }
        }
        if let Some(cache) = &self.state_cache {
            if let Some(blob) = cache.get(&key) {
                return Ok(blob);
            }
        }
        let db_key = schema::storage_snapshot_key(account.as_bytes(), slot.as_bytes());
        let blob = self
            .ctx
            .store
            .get(ColumnFamily::StorageSnapshot, &db_key)?
            .unwrap_or_default();
        if let Some(cache) = &self.state_cache {
            cache.set(key, blob.clone());
        }
        Ok(blob)
    }

    /// Store the forward history entry for the diff being committed.
    /// Returns whether a flush must be forced because the history tail
    /// would otherwise overtake the persisted state id.
    fn write_history(&self, bottom: &DiffLayer) -> PathDbResult<bool> {
        let Some(history) = &self.ctx.history else {
            return Ok(false);
        };
        let entry = HistoryEntry::from_states(
            bottom.root(),
            bottom.parent().root(),
            bottom.states(),
        );
        history.append(&entry, bottom.state_id())?;
        if let Some(indexer) = self.ctx.indexer.read().clone() {
            indexer.extend(bottom.state_id())?;
        }
        let limit = self.ctx.config.state_history;
        if limit == 0 {
            return Ok(false);
        }
        let tail = history.tail();
        if bottom.state_id() - tail <= limit {
            return Ok(false);
        }
        // Id of the first history entry after truncation.
        let new_first = bottom.state_id() - limit + 1;

        // Truncating past the persisted state id would strip the
        // histories anchoring it. Skip the truncation for this round
        // and force a flush so the next one can proceed.
        let persisted = schema::read_persistent_state_id(self.ctx.store.as_ref())?;
        if persisted < new_first {
            debug!(
                persisted,
                tail_id = tail + 1,
                head_id = bottom.state_id(),
                limit,
                "Skipping history tail truncation"
            );
            return Ok(true);
        }
        history.truncate_from_tail(new_first - 1)?;
        Ok(false)
    }

    /// Merge the bottom-most diff layer into the live buffer and
    /// return the newly constructed disk layer. The current layer is
    /// marked stale before any mutation applies on top of it.
    pub(crate) fn commit(
        self: &Arc<Self>,
        bottom: &Arc<DiffLayer>,
        force: bool,
    ) -> PathDbResult<Arc<DiskLayer>> {
        let mut inner = self.inner.write();
        if inner.stale {
            // Two children committed into the same base.
            panic!("disk layer is stale");
        }
        // The history entry is stored first: if a crash follows before
        // the journal is written, the leftover entry is truncated from
        // the head on the next startup.
        let force_flush = self.write_history(bottom)?;
        inner.stale = true;

        // Store the root->id lookups, including the layer's own on the
        // first ever commit.
        if self.id == 0 {
            schema::write_state_id(self.ctx.store.as_ref(), self.root.as_bytes(), 0)?;
        }
        schema::write_state_id(
            self.ctx.store.as_ref(),
            bottom.root().as_bytes(),
            bottom.state_id(),
        )?;

        // Fold the diff into the live buffer as the combined layer.
        let combined = Arc::clone(&inner.buffer);
        combined.commit(bottom.nodes().clone(), bottom.states().state.clone());

        let mut live = Arc::clone(&combined);
        let mut frozen = inner.frozen.clone();
        if combined.is_full() || force || force_flush {
            // At most one frozen buffer: await and release the
            // previous one before freezing the next.
            if let Some(prev) = frozen.take() {
                prev.wait_flush()?;
            }
            inner.frozen = None;

            // The generator must not race the flush over the flat
            // state; pause it and hand the marker to the flusher.
            let mut progress = None;
            if let Some(generator) = inner.generator.clone() {
                generator.stop();
                progress = generator.progress_marker();
                if progress.is_none() {
                    // Snapshot completed, drop the linkage for good.
                    inner.generator = None;
                } else {
                    info!("Paused snapshot generation");
                }
            }
            let resume = inner.generator.clone().filter(|_| progress.is_some());
            let resume_root = bottom.root();
            combined.flush(
                bottom.root(),
                Arc::clone(&self.ctx.store),
                self.ctx.history.clone(),
                progress,
                self.node_cache.clone(),
                self.state_cache.clone(),
                bottom.state_id(),
                move || {
                    if let Some(generator) = resume {
                        generator.run(resume_root);
                    }
                },
            );
            frozen = Some(Arc::clone(&combined));
            if self.ctx.config.no_async_flush {
                combined.wait_flush()?;
                frozen = None;
            }
            live = Arc::new(Buffer::new(self.ctx.config.write_buffer_size, None, None, 0));
        }
        let ndl = DiskLayer::new(
            bottom.root(),
            bottom.state_id(),
            Arc::clone(&self.ctx),
            self.node_cache.clone(),
            self.state_cache.clone(),
            live,
            frozen,
        );
        // The generator outlives individual disk layer generations
        // until the snapshot completes.
        ndl.set_generator(inner.generator.clone());
        Ok(ndl)
    }

    /// Undo the layer's newest transition by applying the given
    /// history entry, returning the previous disk layer.
    pub(crate) fn revert(self: &Arc<Self>, entry: &HistoryEntry) -> PathDbResult<Arc<DiskLayer>> {
        if entry.root != self.root {
            return Err(PathDbError::UnexpectedHistory {
                post: entry.root,
                disk: self.root,
            });
        }
        if self.id == 0 {
            return Err(PathDbError::StateUnrecoverable(entry.parent));
        }
        // Reconstruct the reverse trie diff before taking the lock;
        // the replay reads state through this still-live layer.
        let nodes = crate::revert::apply(self.ctx.opener.as_ref(), entry)?;
        let (accounts, storages) = entry.state_set();

        let mut inner = self.inner.write();
        if inner.stale {
            return Err(PathDbError::Stale);
        }
        inner.stale = true;

        if let Some(indexer) = self.ctx.indexer.read().clone() {
            indexer.shorten(self.id)?;
        }
        // The reverted transition is still buffered if the buffer is
        // non-empty; rewind it in place. Otherwise the transition has
        // been persisted and the reverse diff goes straight to disk.
        if !inner.buffer.is_empty() {
            inner.buffer.revert_to(
                self.ctx.store.as_ref(),
                &nodes,
                &accounts,
                &storages,
                self.node_cache.as_deref(),
                self.state_cache.as_deref(),
            )?;
            let ndl = DiskLayer::new(
                entry.parent,
                self.id - 1,
                Arc::clone(&self.ctx),
                self.node_cache.clone(),
                self.state_cache.clone(),
                Arc::clone(&inner.buffer),
                inner.frozen.clone(),
            );
            ndl.set_generator(inner.generator.clone());
            debug!(oldroot = %entry.root, newroot = %entry.parent, "Reverted data in write buffer");
            return Ok(ndl);
        }
        if let Some(frozen) = inner.frozen.take() {
            frozen.wait_flush()?;
        }
        // Stop the generator only after the frozen buffer settled: the
        // flush completion may have restarted it.
        let mut progress = None;
        if let Some(generator) = inner.generator.clone() {
            generator.stop();
            progress = generator.progress_marker();
        }
        let mut batch = WriteBatch::new();
        write_nodes(&mut batch, &nodes, self.node_cache.as_deref());
        write_states(
            &mut batch,
            progress.as_deref(),
            &accounts,
            &storages,
            self.state_cache.as_deref(),
        );
        schema::write_persistent_state_id(&mut batch, self.id - 1);
        schema::write_snapshot_root(&mut batch, entry.parent.as_bytes());
        self.ctx.store.write_batch(batch)?;

        let ndl = DiskLayer::new(
            entry.parent,
            self.id - 1,
            Arc::clone(&self.ctx),
            self.node_cache.clone(),
            self.state_cache.clone(),
            Arc::clone(&inner.buffer),
            None,
        );
        if let Some(generator) = inner.generator.clone() {
            ndl.set_generator(Some(Arc::clone(&generator)));
            if !generator.completed() {
                generator.run(entry.parent);
            }
        }
        debug!(oldroot = %entry.root, newroot = %entry.parent, "Reverted data in persistent state");
        Ok(ndl)
    }

    /// Approximate size of the buffered writes held by this layer.
    pub fn size(&self) -> u64 {
        let inner = self.inner.read();
        if inner.stale {
            return 0;
        }
        inner.buffer.size()
    }

    /// Number of transitions buffered ahead of the persistent state.
    pub fn buffer_layers(&self) -> u64 {
        self.inner.read().buffer.layers()
    }

    /// Snapshot the live buffer content for journaling.
    pub(crate) fn buffer_contents(&self) -> (crate::nodes::NodeSet, crate::states::StateSet) {
        self.inner.read().buffer.contents()
    }

    /// Block until any scheduled background flush completes.
    pub fn wait_flush(&self) -> PathDbResult<()> {
        let frozen = self.inner.read().frozen.clone();
        match frozen {
            Some(frozen) => frozen.wait_flush(),
            None => Ok(()),
        }
    }

    /// Release the memory held by the clean caches. Only the current
    /// disk layer owns the right to reset them.
    pub(crate) fn reset_cache(&self) {
        let inner = self.inner.read();
        if inner.stale {
            return;
        }
        if let Some(cache) = &self.node_cache {
            cache.reset();
        }
        if let Some(cache) = &self.state_cache {
            cache.reset();
        }
    }

    /// Await the frozen flush, release it and stop the generator.
    pub(crate) fn terminate(&self) -> PathDbResult<()> {
        let mut inner = self.inner.write();
        if let Some(frozen) = inner.frozen.take() {
            frozen.wait_flush()?;
        }
        if let Some(generator) = &inner.generator {
            generator.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nodes::{Node, NodeSet};
    use crate::states::{StateSet, StateSetWithOrigin};
    use crate::{Layer, RevertTrie, TrieOpener};
    use pathdb_storage::MemoryStore;
    use std::collections::HashMap;

    /// Opener for tests that never reach the revert engine.
    pub(crate) struct NoopOpener;

    impl TrieOpener for NoopOpener {
        fn open_account_trie(&self, _post_root: Hash) -> PathDbResult<Box<dyn RevertTrie>> {
            Err(PathDbError::Decode("no trie access in this test".into()))
        }

        fn open_storage_trie(
            &self,
            _post_root: Hash,
            _account_hash: Hash,
            _storage_root: Hash,
        ) -> PathDbResult<Box<dyn RevertTrie>> {
            Err(PathDbError::Decode("no trie access in this test".into()))
        }
    }

    pub(crate) fn stub_ctx() -> Arc<DbContext> {
        stub_ctx_with_config(Config {
            history_directory: None,
            ..Config::default()
        })
    }

    pub(crate) fn stub_ctx_with_config(config: Config) -> Arc<DbContext> {
        Arc::new(DbContext {
            store: Arc::new(MemoryStore::new()),
            history: None,
            opener: Arc::new(NoopOpener),
            indexer: RwLock::new(None),
            config,
        })
    }

    pub(crate) fn stub_disk_layer() -> Arc<DiskLayer> {
        let ctx = stub_ctx();
        let buffer = Arc::new(Buffer::new(ctx.config.write_buffer_size, None, None, 0));
        DiskLayer::new(Hash::ZERO, 0, ctx, None, None, buffer, None)
    }

    fn diff_on(disk: &Arc<DiskLayer>, seed: u8) -> Arc<DiffLayer> {
        let mut nodes = NodeSet::new();
        nodes.insert(Hash::ZERO, vec![seed], Node::new(vec![seed; 8]));
        let mut state = StateSet::empty();
        state.insert_account(Hash([seed; 32]), vec![seed; 4]);
        let states = StateSetWithOrigin::new(state, HashMap::new(), HashMap::new(), false);
        DiffLayer::new(
            Layer::Disk(Arc::clone(disk)),
            Hash([seed; 32]),
            disk.state_id() + 1,
            seed as u64,
            nodes,
            states,
        )
    }

    #[test]
    fn test_read_cascade_buffer_then_store() {
        let disk = stub_disk_layer();

        // Persistent hit.
        disk.ctx
            .store
            .put(ColumnFamily::AccountTrie, &[1], b"persisted")
            .unwrap();
        let (blob, _, loc) = disk.node(&Hash::ZERO, &[1], 0).unwrap();
        assert_eq!(blob, b"persisted");
        assert_eq!(loc.source, NodeSource::Persistent);

        // Second read is served by the clean cache.
        let (_, _, loc) = disk.node(&Hash::ZERO, &[1], 0).unwrap();
        assert_eq!(loc.source, NodeSource::CleanCache);

        // Buffered writes shadow both.
        let mut nodes = NodeSet::new();
        nodes.insert(Hash::ZERO, vec![1], Node::new(b"buffered".to_vec()));
        disk.inner.read().buffer.commit(nodes, StateSet::empty());
        let (blob, _, loc) = disk.node(&Hash::ZERO, &[1], 0).unwrap();
        assert_eq!(blob, b"buffered");
        assert_eq!(loc.source, NodeSource::Buffer);
    }

    #[test]
    fn test_stale_layer_refuses_reads() {
        let disk = stub_disk_layer();
        disk.mark_stale();

        assert!(matches!(
            disk.node(&Hash::ZERO, &[], 0),
            Err(PathDbError::Stale)
        ));
        assert!(matches!(
            disk.account(&Hash::ZERO, 0),
            Err(PathDbError::Stale)
        ));
        assert!(matches!(
            disk.storage(&Hash::ZERO, &Hash::ZERO, 0),
            Err(PathDbError::Stale)
        ));
    }

    #[test]
    #[should_panic(expected = "disk layer is stale")]
    fn test_double_stale_aborts() {
        let disk = stub_disk_layer();
        disk.mark_stale();
        disk.mark_stale();
    }

    #[test]
    fn test_commit_produces_next_generation() {
        let disk = stub_disk_layer();
        let diff = diff_on(&disk, 1);

        let next = disk.commit(&diff, false).unwrap();
        assert!(disk.is_stale());
        assert_eq!(next.root(), Hash([1u8; 32]));
        assert_eq!(next.state_id(), 1);
        assert_eq!(next.buffer_layers(), 1);

        // Reads through the new layer see the folded diff.
        let blob = next.account(&Hash([1u8; 32]), 0).unwrap();
        assert_eq!(blob, vec![1; 4]);

        // Root->id lookups were persisted, including the first-commit
        // self lookup.
        let store = next.ctx.store.as_ref();
        assert_eq!(
            schema::read_state_id(store, Hash::ZERO.as_bytes()).unwrap(),
            Some(0)
        );
        assert_eq!(
            schema::read_state_id(store, Hash([1u8; 32]).as_bytes()).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_forced_commit_flushes_through() {
        let ctx = stub_ctx_with_config(Config {
            history_directory: None,
            no_async_flush: true,
            ..Config::default()
        });
        let buffer = Arc::new(Buffer::new(ctx.config.write_buffer_size, None, None, 0));
        let disk = DiskLayer::new(Hash::ZERO, 0, ctx, None, None, buffer, None);
        let diff = diff_on(&disk, 2);

        let next = disk.commit(&diff, true).unwrap();
        assert_eq!(next.buffer_layers(), 0);

        let store = next.ctx.store.as_ref();
        assert_eq!(schema::read_persistent_state_id(store).unwrap(), 1);
        assert_eq!(
            schema::read_snapshot_root(store).unwrap(),
            Some(*Hash([2u8; 32]).as_bytes())
        );
        assert_eq!(
            store
                .get(ColumnFamily::AccountSnapshot, Hash([2u8; 32]).as_bytes())
                .unwrap(),
            Some(vec![2; 4])
        );
    }
}
