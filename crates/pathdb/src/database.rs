//! Database facade orchestrating the layered state store.

use crate::config::Config;
use crate::context::DbContext;
use crate::disklayer::DiskLayer;
use crate::error::{PathDbError, PathDbResult};
use crate::history::HistoryStore;
use crate::journal;
use crate::layertree::LayerTree;
use crate::nodes::NodeSet;
use crate::states::StateSetWithOrigin;
use crate::types::Hash;
use crate::{Buffer, HistoryIndexer, Layer, NodeLocation, SnapshotGenerator, TrieOpener};
use parking_lot::{Mutex, RwLock};
use pathdb_storage::{schema, ColumnFamily, KeyValueStore};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

struct Flags {
    /// Set when opened read-only or after journaling; all mutations
    /// are rejected.
    read_only: bool,
    /// Set while an external state sync owns the persistent state.
    wait_sync: bool,
}

/// A multiple-layered structure maintaining in-memory state diffs on
/// top of one persistent disk layer. At most one writable instance may
/// operate on a given persistent store.
pub struct Database {
    ctx: Arc<DbContext>,
    tree: LayerTree,
    /// Outer lock covering layer-tree mutations, disable/enable and
    /// journaling.
    lock: Mutex<()>,
    flags: RwLock<Flags>,
}

impl Database {
    /// Open the database on the given store, rehydrating the layer
    /// tree from a previous shutdown journal when one matches the
    /// persistent state.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        opener: Arc<dyn TrieOpener>,
        config: Config,
    ) -> PathDbResult<Self> {
        let config = config.sanitize();
        let history = match &config.history_directory {
            Some(dir) => Some(Arc::new(HistoryStore::open(dir, Arc::clone(&store))?)),
            None => None,
        };
        let read_only = config.read_only;
        let ctx = Arc::new(DbContext {
            store,
            history,
            opener,
            indexer: RwLock::new(None),
            config,
        });
        let tree = Self::load_layers(&ctx)?;
        let db = Self {
            ctx,
            tree,
            lock: Mutex::new(()),
            flags: RwLock::new(Flags {
                read_only,
                wait_sync: false,
            }),
        };
        // Histories may be out of step with the key-value store after
        // an unclean shutdown.
        db.repair_history()?;

        // Re-enter the waiting-for-sync state if the process died in
        // the middle of an external state sync.
        let syncing = db
            .ctx
            .store
            .get(ColumnFamily::Metadata, schema::STATE_SYNC_RUNNING_KEY)?
            .is_some();
        if syncing && !read_only {
            db.disable()?;
        }
        info!(
            root = %db.tree.bottom().root(),
            id = db.tree.bottom().state_id(),
            read_only,
            history = db.ctx.history.is_some(),
            buffer = db.ctx.config.write_buffer_size,
            "Initialized path database"
        );
        Ok(db)
    }

    /// Construct the layer tree from the journal, falling back to the
    /// bare persistent state when the journal is missing or rejected.
    fn load_layers(ctx: &Arc<DbContext>) -> PathDbResult<LayerTree> {
        match journal::load(ctx) {
            Ok(tree) => return Ok(tree),
            Err(PathDbError::MissingJournal) => {
                info!("No state journal found");
            }
            Err(PathDbError::Storage(err)) => return Err(err.into()),
            Err(err) => {
                warn!(%err, "Discarded invalid state journal");
            }
        }
        let root = journal::persistent_root(ctx.store.as_ref())?;
        let id = schema::read_persistent_state_id(ctx.store.as_ref())?;
        let buffer = Arc::new(Buffer::new(ctx.config.write_buffer_size, None, None, 0));
        Ok(LayerTree::new(DiskLayer::new(
            root,
            id,
            Arc::clone(ctx),
            None,
            None,
            buffer,
            None,
        )))
    }

    /// Truncate history entries that outlive the disk layer, and drop
    /// the whole table when the database is uninitialized.
    fn repair_history(&self) -> PathDbResult<()> {
        if self.ctx.config.read_only {
            return Ok(());
        }
        let Some(history) = &self.ctx.history else {
            return Ok(());
        };
        let id = self.tree.bottom().state_id();
        if id == 0 {
            if history.head() != 0 {
                history.reset()?;
                info!("Truncated extraneous state history");
            }
            return Ok(());
        }
        if history.head() > id {
            let pruned = history.truncate_from_head(id)?;
            warn!(pruned, "Truncated extra state histories");
        }
        Ok(())
    }

    fn modify_allowed(&self) -> PathDbResult<()> {
        let flags = self.flags.read();
        if flags.read_only {
            return Err(PathDbError::ReadOnly);
        }
        if flags.wait_sync {
            return Err(PathDbError::WaitSync);
        }
        Ok(())
    }

    /// Add a new diff layer on top of an existing parent, then flatten
    /// any layers exceeding the configured depth into the disk layer.
    #[instrument(skip(self, nodes, states), fields(%root, %parent, block))]
    pub fn update(
        &self,
        root: Hash,
        parent: Hash,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        self.modify_allowed()?;
        self.tree.add(root, parent, block, nodes, states)?;
        self.tree.cap(root, self.ctx.config.max_diff_layers)
    }

    /// Flatten all layers from `root` downwards into the disk layer.
    #[instrument(skip(self), fields(%root))]
    pub fn commit(&self, root: Hash, report: bool) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        self.modify_allowed()?;
        self.tree.cap(root, 0)?;
        if report {
            info!(%root, id = self.tree.bottom().state_id(), "Committed state layers");
        }
        Ok(())
    }

    /// Roll the database back to a historical root by replaying the
    /// state history in reverse, one transition at a time.
    #[instrument(skip(self), fields(%root))]
    pub fn recover(&self, root: Hash) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        self.modify_allowed()?;
        let Some(history) = &self.ctx.history else {
            return Err(PathDbError::StateUnrecoverable(root));
        };
        if !self.recoverable_inner(root).unwrap_or(false) {
            return Err(PathDbError::StateUnrecoverable(root));
        }
        let mut disk = self.tree.bottom();
        while disk.root() != root {
            let entry = history.read(disk.state_id())?;
            disk = disk.revert(&entry)?;
            // The new disk layer must be published after every revert
            // step, otherwise it is unreachable from outside.
            self.tree.init(Arc::clone(&disk));
        }
        // Force the recent key-value writes out before dropping the
        // histories that would be needed to redo this rollback.
        self.ctx.store.sync()?;
        history.truncate_from_head(disk.state_id())?;
        debug!(%root, "Recovered state");
        Ok(())
    }

    /// Whether the given state is reachable by replaying the available
    /// history backwards from the disk layer.
    pub fn recoverable(&self, root: Hash) -> bool {
        self.recoverable_inner(root).unwrap_or(false)
    }

    fn recoverable_inner(&self, root: Hash) -> PathDbResult<bool> {
        let Some(id) = schema::read_state_id(self.ctx.store.as_ref(), root.as_bytes())? else {
            return Ok(false);
        };
        let disk = self.tree.bottom();
        // Recoverable states lie strictly below the disk layer; the
        // disk state itself is not a rollback destination.
        if id >= disk.state_id() {
            return Ok(false);
        }
        let Some(history) = &self.ctx.history else {
            return Ok(false);
        };
        // All histories in (id, disk] must exist and chain onto the
        // requested root.
        let mut expected = root;
        history.check_consistency(id + 1, disk.state_id() - id, |meta| {
            if meta.parent != expected {
                return false;
            }
            expected = meta.root;
            true
        })
    }

    /// Deactivate the database for an external state sync: all layers
    /// become stale, the journal and histories are wiped and further
    /// mutations are rejected until [`Self::enable`].
    pub fn disable(&self) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        {
            let mut flags = self.flags.write();
            if flags.read_only {
                return Err(PathDbError::ReadOnly);
            }
            if flags.wait_sync {
                warn!("Rejected duplicated disable operation");
                return Ok(());
            }
            flags.wait_sync = true;
        }
        let disk = self.tree.bottom();
        disk.terminate()?;
        disk.mark_stale();
        self.tree.init(disk);

        journal::delete(&self.ctx)?;
        if let Some(history) = &self.ctx.history {
            history.reset()?;
        }
        self.ctx.store.put(
            ColumnFamily::Metadata,
            schema::STATE_SYNC_RUNNING_KEY,
            &[1],
        )?;
        info!("Disabled trie database due to state sync");
        Ok(())
    }

    /// Reactivate the database around the freshly synced persistent
    /// state, which must match the provided root.
    pub fn enable(&self, root: Hash) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        if self.flags.read().read_only {
            return Err(PathDbError::ReadOnly);
        }
        let stored = journal::persistent_root(self.ctx.store.as_ref())?;
        if stored != root {
            return Err(PathDbError::RootMismatch {
                stored,
                provided: root,
            });
        }
        // Reset the state metadata; the root->id lookups of the old
        // chain are left behind and overwritten over time.
        let mut batch = pathdb_storage::WriteBatch::new();
        batch.delete(ColumnFamily::Metadata, schema::SNAPSHOT_ROOT_KEY.to_vec());
        schema::write_persistent_state_id(&mut batch, 0);
        self.ctx.store.write_batch(batch)?;

        journal::delete(&self.ctx)?;
        if let Some(history) = &self.ctx.history {
            history.reset()?;
        }
        let buffer = Arc::new(Buffer::new(self.ctx.config.write_buffer_size, None, None, 0));
        self.tree.init(DiskLayer::new(
            root,
            0,
            Arc::clone(&self.ctx),
            None,
            None,
            buffer,
            None,
        ));
        self.flags.write().wait_sync = false;
        self.ctx
            .store
            .delete(ColumnFamily::Metadata, schema::STATE_SYNC_RUNNING_KEY)?;
        info!(%root, "Rebuilt trie database");
        Ok(())
    }

    /// Persist the layer chain ending at `root` as the shutdown
    /// journal. The database becomes read-only afterwards.
    #[instrument(skip(self), fields(%root))]
    pub fn journal(&self, root: Hash) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        self.modify_allowed()?;

        // Settle the background flush so the frozen buffer cannot hold
        // states missing from both the journal and the disk.
        let disk = self.tree.bottom();
        disk.terminate()?;

        journal::store(&self.ctx, &self.tree, root)?;
        self.flags.write().read_only = true;
        Ok(())
    }

    /// Close the database: settle outstanding flushes, stop the
    /// generator and refuse further operations.
    pub fn close(&self) -> PathDbResult<()> {
        let _guard = self.lock.lock();
        self.flags.write().read_only = true;
        let disk = self.tree.bottom();
        disk.terminate()?;
        disk.reset_cache();
        Ok(())
    }

    /// A read handle for the state identified by `root`.
    pub fn reader(&self, root: Hash) -> PathDbResult<Reader> {
        if self.flags.read().wait_sync {
            return Err(PathDbError::WaitSync);
        }
        let layer = self.tree.get(root).ok_or(PathDbError::UnknownRoot(root))?;
        Ok(Reader { layer })
    }

    /// Link a snapshot generator to the current disk layer. Linkage
    /// migrates across disk layer generations until the snapshot
    /// completes; running and stopping it is driven by commit and
    /// revert.
    pub fn attach_generator(&self, generator: Arc<dyn SnapshotGenerator>) {
        if generator.completed() {
            return;
        }
        self.tree.bottom().set_generator(Some(generator));
    }

    /// Register the observer notified of history growth and shrinkage.
    pub fn attach_indexer(&self, indexer: Arc<dyn HistoryIndexer>) {
        *self.ctx.indexer.write() = Some(indexer);
    }

    /// The layer tree, exposed for inspection.
    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    /// Ids of the oldest and newest stored history entries, `None`
    /// when no history is stored.
    pub fn history_range(&self) -> Option<(u64, u64)> {
        let history = self.ctx.history.as_ref()?;
        if history.is_empty() {
            return None;
        }
        Some((history.tail() + 1, history.head()))
    }

    /// Current memory footprint: diff layer bytes and buffered bytes.
    pub fn size(&self) -> (u64, u64) {
        let mut diffs = 0u64;
        let mut buffered = 0u64;
        self.tree.for_each(|layer| match layer {
            Layer::Diff(diff) => diffs += diff.size(),
            Layer::Disk(disk) => buffered += disk.size(),
        });
        (diffs, buffered)
    }
}

/// Cheap handle for reads through a specific state root, walking the
/// layer chain from that root down to the disk layer.
pub struct Reader {
    layer: Layer,
}

impl Reader {
    /// Root hash this reader was opened for.
    pub fn root(&self) -> Hash {
        self.layer.root()
    }

    /// State id of the underlying layer.
    pub fn state_id(&self) -> u64 {
        self.layer.state_id()
    }

    /// Retrieve a trie node with its hash and resolution info.
    pub fn node(&self, owner: Hash, path: &[u8]) -> PathDbResult<(Vec<u8>, Hash, NodeLocation)> {
        self.layer.node(&owner, path)
    }

    /// Retrieve a flat account entry; an empty blob means absent.
    pub fn account(&self, hash: Hash) -> PathDbResult<Vec<u8>> {
        self.layer.account(&hash)
    }

    /// Retrieve a flat storage entry; an empty blob means absent.
    pub fn storage(&self, account: Hash, slot: Hash) -> PathDbResult<Vec<u8>> {
        self.layer.storage(&account, &slot)
    }
}
