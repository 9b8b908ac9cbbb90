//! Shutdown journal: checkpointing the layer tree across restarts.
//!
//! Layout, in order: format version, the persistent trie root (guards
//! against a journal belonging to a different database), the disk
//! layer record (root, id, buffered nodes and states) and the diff
//! layers of the journaled chain, parent-first.
//!
//! The journal lives either under a metadata key in the key-value
//! store or as an external file written atomically (temp file, fsync,
//! rename, directory fsync). It is consumed on load: a journal that
//! was read once, successfully or not, is deleted so a crash cannot
//! replay it against a moved state. Read-only opens leave it in
//! place.

use crate::buffer::Buffer;
use crate::codec::Cursor;
use crate::context::DbContext;
use crate::difflayer::DiffLayer;
use crate::disklayer::DiskLayer;
use crate::error::{PathDbError, PathDbResult};
use crate::layertree::LayerTree;
use crate::nodes::NodeSet;
use crate::states::{StateSet, StateSetWithOrigin};
use crate::types::Hash;
use crate::Layer;
use pathdb_storage::{schema, ColumnFamily, KeyValueStore};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Current journal format version.
pub(crate) const JOURNAL_VERSION: u64 = 1;

const JOURNAL_FILE: &str = "state.journal";
const JOURNAL_TMP_FILE: &str = "state.journal.tmp";

/// Hash of the persistent account trie root node, the identity of the
/// on-disk state.
pub(crate) fn persistent_root(store: &dyn KeyValueStore) -> PathDbResult<Hash> {
    let blob = store
        .get(ColumnFamily::AccountTrie, &[])?
        .unwrap_or_default();
    Ok(Hash::of_node(&blob))
}

fn journal_path(ctx: &DbContext) -> Option<PathBuf> {
    ctx.config
        .journal_directory
        .as_ref()
        .map(|dir| dir.join(JOURNAL_FILE))
}

/// Remove any persisted journal, in both possible locations.
pub(crate) fn delete(ctx: &DbContext) -> PathDbResult<()> {
    ctx.store
        .delete(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY)?;
    if let Some(path) = journal_path(ctx) {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(pathdb_storage::StorageError::Io(err).into()),
        }
    }
    Ok(())
}

/// Serialize the layer chain ending at `root` and persist it.
pub(crate) fn store(ctx: &DbContext, tree: &LayerTree, root: Hash) -> PathDbResult<()> {
    let disk = tree.bottom();
    if disk.is_stale() {
        return Err(PathDbError::Stale);
    }
    let chain = tree.descend(root).ok_or(PathDbError::UnknownRoot(root))?;

    let mut buf = Vec::new();
    buf.extend_from_slice(&JOURNAL_VERSION.to_be_bytes());
    buf.extend_from_slice(persistent_root(ctx.store.as_ref())?.as_bytes());

    // Disk layer record.
    buf.extend_from_slice(disk.root().as_bytes());
    buf.extend_from_slice(&disk.state_id().to_be_bytes());
    let (nodes, states) = disk.buffer_contents();
    nodes.encode_into(&mut buf);
    states.encode_into(&mut buf);

    // Diff layers, parent-first.
    let diffs: Vec<Arc<DiffLayer>> = chain
        .iter()
        .rev()
        .filter_map(|layer| match layer {
            Layer::Diff(diff) => Some(Arc::clone(diff)),
            Layer::Disk(_) => None,
        })
        .collect();
    buf.extend_from_slice(&(diffs.len() as u32).to_be_bytes());
    for diff in &diffs {
        buf.extend_from_slice(diff.root().as_bytes());
        buf.extend_from_slice(&diff.block().to_be_bytes());
        diff.nodes().encode_into(&mut buf);
        diff.states().encode_into(&mut buf);
    }

    // Replace whatever journal was there before.
    delete(ctx)?;
    match journal_path(ctx) {
        Some(path) => write_file_atomic(&path, &buf)?,
        None => ctx
            .store
            .put(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY, &buf)?,
    }
    info!(layers = diffs.len() + 1, bytes = buf.len(), "Persisted state journal");
    Ok(())
}

/// Load the journal and rehydrate the layer tree. The journal is
/// deleted before parsing so failures cannot replay.
pub(crate) fn load(ctx: &Arc<DbContext>) -> PathDbResult<LayerTree> {
    let blob = match journal_path(ctx) {
        Some(path) => match std::fs::read(&path) {
            Ok(blob) => Some(blob),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(pathdb_storage::StorageError::Io(err).into()),
        },
        None => ctx
            .store
            .get(ColumnFamily::Metadata, schema::TRIE_JOURNAL_KEY)?,
    };
    let blob = blob.ok_or(PathDbError::MissingJournal)?;
    if !ctx.config.read_only {
        delete(ctx)?;
    }

    let mut cursor = Cursor::new(&blob);
    let version = cursor.read_u64()?;
    if version != JOURNAL_VERSION {
        return Err(PathDbError::UnexpectedVersion(version));
    }
    let journaled = Hash(cursor.read_array::<32>()?);
    let stored = persistent_root(ctx.store.as_ref())?;
    if journaled != stored {
        return Err(PathDbError::UnmatchedJournal { journaled, stored });
    }
    // Disk layer record. The buffer layer count is re-derived from the
    // distance between the journaled id and the persisted state id.
    let root = Hash(cursor.read_array::<32>()?);
    let id = cursor.read_u64()?;
    let persisted = schema::read_persistent_state_id(ctx.store.as_ref())?;
    if persisted > id {
        return Err(PathDbError::Decode(format!(
            "state id regression: persisted {persisted}, journaled {id}"
        )));
    }
    let nodes = NodeSet::decode_from(&mut cursor)?;
    let states = StateSet::decode_from(&mut cursor)?;
    let buffer = Arc::new(Buffer::new(
        ctx.config.write_buffer_size,
        Some(nodes),
        Some(states),
        id - persisted,
    ));
    let disk = DiskLayer::new(root, id, Arc::clone(ctx), None, None, buffer, None);
    let tree = LayerTree::new(disk);

    // Diff layers were journaled parent-first.
    let count = cursor.read_u32()? as usize;
    let mut parent = Layer::Disk(tree.bottom());
    for _ in 0..count {
        let root = Hash(cursor.read_array::<32>()?);
        let block = cursor.read_u64()?;
        let nodes = NodeSet::decode_from(&mut cursor)?;
        let states = StateSetWithOrigin::decode_from(&mut cursor)?;
        let diff = DiffLayer::new(
            parent.clone(),
            root,
            parent.state_id() + 1,
            block,
            nodes,
            states,
        );
        tree.add_loaded(Arc::clone(&diff));
        parent = Layer::Diff(diff);
    }
    if !cursor.is_exhausted() {
        return Err(PathDbError::Decode("trailing bytes in journal".into()));
    }
    debug!(layers = count + 1, "Loaded state journal");
    Ok(tree)
}

/// Write the blob to the path atomically: temp file, fsync, rename,
/// directory fsync.
fn write_file_atomic(path: &std::path::Path, blob: &[u8]) -> PathDbResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PathDbError::Decode("journal path has no parent".into()))?;
    std::fs::create_dir_all(dir).map_err(pathdb_storage::StorageError::Io)?;
    let tmp = dir.join(JOURNAL_TMP_FILE);
    let mut file = File::create(&tmp).map_err(pathdb_storage::StorageError::Io)?;
    file.write_all(blob).map_err(pathdb_storage::StorageError::Io)?;
    file.sync_all().map_err(pathdb_storage::StorageError::Io)?;
    std::fs::rename(&tmp, path).map_err(pathdb_storage::StorageError::Io)?;
    File::open(dir)
        .and_then(|dir| dir.sync_all())
        .map_err(pathdb_storage::StorageError::Io)?;
    Ok(())
}
