//! Key namespaces and metadata accessors.
//!
//! All persisted state lives in a handful of column families. Trie node
//! keys are path-addressed: the account trie is keyed by the node path
//! alone, a storage trie by the owning account hash followed by the
//! path. Flat snapshot entries are keyed by the account hash, with
//! storage slots appending the slot hash.

use crate::{KeyValueStore, StorageResult, WriteBatch};

/// Column families for organizing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    /// Account trie nodes indexed by path.
    AccountTrie,
    /// Storage trie nodes indexed by owner hash and path.
    StorageTrie,
    /// Flat account entries indexed by account hash.
    AccountSnapshot,
    /// Flat storage entries indexed by account hash and slot hash.
    StorageSnapshot,
    /// State root to state id lookups.
    StateIds,
    /// Progress markers, sync flags and the shutdown journal.
    Metadata,
    /// Default column family (required by RocksDB).
    Default,
}

impl ColumnFamily {
    /// Get the string name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::AccountTrie => "account_trie",
            ColumnFamily::StorageTrie => "storage_trie",
            ColumnFamily::AccountSnapshot => "account_snapshot",
            ColumnFamily::StorageSnapshot => "storage_snapshot",
            ColumnFamily::StateIds => "state_ids",
            ColumnFamily::Metadata => "metadata",
            ColumnFamily::Default => "default",
        }
    }

    /// Get all column families.
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::AccountTrie,
            ColumnFamily::StorageTrie,
            ColumnFamily::AccountSnapshot,
            ColumnFamily::StorageSnapshot,
            ColumnFamily::StateIds,
            ColumnFamily::Metadata,
            ColumnFamily::Default,
        ]
    }
}

/// Metadata key holding the id of the newest transition folded into
/// the persistent state.
pub const PERSISTENT_STATE_ID_KEY: &[u8] = b"persistent_state_id";

/// Metadata key holding the root of the persisted flat snapshot.
pub const SNAPSHOT_ROOT_KEY: &[u8] = b"snapshot_root";

/// Metadata key holding the shutdown journal blob.
pub const TRIE_JOURNAL_KEY: &[u8] = b"trie_journal";

/// Metadata key flagging an in-progress external state sync.
pub const STATE_SYNC_RUNNING_KEY: &[u8] = b"state_sync_running";

/// Build the key of a storage trie node.
pub fn storage_trie_key(owner: &[u8; 32], path: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + path.len());
    key.extend_from_slice(owner);
    key.extend_from_slice(path);
    key
}

/// Build the key of a flat storage entry.
pub fn storage_snapshot_key(account: &[u8; 32], slot: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(account);
    key.extend_from_slice(slot);
    key
}

/// Read the persisted state id, zero if unset.
pub fn read_persistent_state_id(store: &dyn KeyValueStore) -> StorageResult<u64> {
    match store.get(ColumnFamily::Metadata, PERSISTENT_STATE_ID_KEY)? {
        Some(bytes) if bytes.len() == 8 => {
            Ok(u64::from_be_bytes(bytes[..8].try_into().expect("len checked")))
        }
        _ => Ok(0),
    }
}

/// Queue a persisted state id update in the batch.
pub fn write_persistent_state_id(batch: &mut WriteBatch, id: u64) {
    batch.put(
        ColumnFamily::Metadata,
        PERSISTENT_STATE_ID_KEY,
        id.to_be_bytes().to_vec(),
    );
}

/// Read the persisted snapshot root.
pub fn read_snapshot_root(store: &dyn KeyValueStore) -> StorageResult<Option<[u8; 32]>> {
    match store.get(ColumnFamily::Metadata, SNAPSHOT_ROOT_KEY)? {
        Some(bytes) if bytes.len() == 32 => {
            let mut root = [0u8; 32];
            root.copy_from_slice(&bytes);
            Ok(Some(root))
        }
        _ => Ok(None),
    }
}

/// Queue a snapshot root update in the batch.
pub fn write_snapshot_root(batch: &mut WriteBatch, root: &[u8; 32]) {
    batch.put(ColumnFamily::Metadata, SNAPSHOT_ROOT_KEY, root.to_vec());
}

/// Read the state id mapped to the given root.
pub fn read_state_id(store: &dyn KeyValueStore, root: &[u8; 32]) -> StorageResult<Option<u64>> {
    match store.get(ColumnFamily::StateIds, root)? {
        Some(bytes) if bytes.len() == 8 => Ok(Some(u64::from_be_bytes(
            bytes[..8].try_into().expect("len checked"),
        ))),
        _ => Ok(None),
    }
}

/// Store a root to state id lookup.
pub fn write_state_id(store: &dyn KeyValueStore, root: &[u8; 32], id: u64) -> StorageResult<()> {
    store.put(ColumnFamily::StateIds, root, &id.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn test_metadata_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(read_persistent_state_id(&store).unwrap(), 0);

        let mut batch = WriteBatch::new();
        write_persistent_state_id(&mut batch, 42);
        write_snapshot_root(&mut batch, &[7u8; 32]);
        store.write_batch(batch).unwrap();

        assert_eq!(read_persistent_state_id(&store).unwrap(), 42);
        assert_eq!(read_snapshot_root(&store).unwrap(), Some([7u8; 32]));
    }

    #[test]
    fn test_state_id_lookup() {
        let store = MemoryStore::new();
        let root = [3u8; 32];
        assert_eq!(read_state_id(&store, &root).unwrap(), None);

        write_state_id(&store, &root, 9).unwrap();
        assert_eq!(read_state_id(&store, &root).unwrap(), Some(9));
    }

    #[test]
    fn test_composite_keys() {
        let owner = [1u8; 32];
        let key = storage_trie_key(&owner, &[0x0a, 0x0b]);
        assert_eq!(key.len(), 34);
        assert_eq!(&key[..32], &owner);
        assert_eq!(&key[32..], &[0x0a, 0x0b]);

        let slot = [2u8; 32];
        let key = storage_snapshot_key(&owner, &slot);
        assert_eq!(key.len(), 64);
        assert_eq!(&key[32..], &slot);
    }
}
