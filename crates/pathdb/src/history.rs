//! State history: reverse diffs enabling bounded rollback.
//!
//! Every transition committed into the disk layer appends one history
//! entry recording the prior value of each account and storage slot it
//! touched. Applying entries in reverse order from the current disk
//! layer rolls the state back. Entries are addressed by their state id
//! (dense, starting at 1) and the oldest can be pruned on demand to
//! bound storage.

use crate::codec::{put_bytes, Cursor};
use crate::error::{PathDbError, PathDbResult};
use crate::states::StateSetWithOrigin;
use crate::types::{Address, Hash};
use pathdb_storage::{ColumnFamily, Freezer, KeyValueStore, WriteBatch};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Initial history version: storage slots keyed by the slot key hash.
pub const HISTORY_V0: u8 = 0;

/// Raw-key history version: storage slots keyed by the raw slot key.
pub const HISTORY_V1: u8 = 1;

/// Decoded metadata prefix of a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMeta {
    pub version: u8,
    /// State root before the transition.
    pub parent: Hash,
    /// State root after the transition.
    pub root: Hash,
}

const META_SIZE: usize = 1 + 32 + 32;

impl HistoryMeta {
    fn decode(blob: &[u8]) -> PathDbResult<Self> {
        let mut cursor = Cursor::new(blob);
        let version = cursor.read_u8()?;
        if version != HISTORY_V0 && version != HISTORY_V1 {
            return Err(PathDbError::UnexpectedVersion(version as u64));
        }
        let parent = Hash(cursor.read_array::<32>()?);
        let root = Hash(cursor.read_array::<32>()?);
        Ok(Self {
            version,
            parent,
            root,
        })
    }
}

/// One reverse diff: the prior values of every account and storage
/// slot touched by a single transition.
///
/// Accounts and slots are kept in sorted maps so the encoded form is
/// canonical; decoding enforces the ordering to detect corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: u8,
    /// State root before the transition.
    pub parent: Hash,
    /// State root after the transition.
    pub root: Hash,
    /// Prior account blobs keyed by address; empty means absent.
    pub accounts: BTreeMap<Address, Vec<u8>>,
    /// Prior storage values keyed by address and slot identifier: the
    /// slot key hash in version 0, the raw slot key in version 1.
    pub storages: BTreeMap<Address, BTreeMap<Hash, Vec<u8>>>,
}

impl HistoryEntry {
    /// Build the reverse diff of a transition from its origin values.
    pub fn from_states(root: Hash, parent: Hash, states: &StateSetWithOrigin) -> Self {
        let accounts: BTreeMap<_, _> = states
            .account_origin
            .iter()
            .map(|(addr, blob)| (*addr, blob.clone()))
            .collect();
        let storages: BTreeMap<_, _> = states
            .storage_origin
            .iter()
            .map(|(addr, slots)| {
                (
                    *addr,
                    slots
                        .iter()
                        .map(|(slot, blob)| (*slot, blob.clone()))
                        .collect::<BTreeMap<_, _>>(),
                )
            })
            .collect();
        Self {
            version: if states.raw_storage_key {
                HISTORY_V1
            } else {
                HISTORY_V0
            },
            parent,
            root,
            accounts,
            storages,
        }
    }

    /// Whether storage origins are keyed by the raw slot key.
    pub fn raw_storage_key(&self) -> bool {
        self.version == HISTORY_V1
    }

    /// The reverse state set keyed by account hash and slot key hash,
    /// ready to apply against flat state.
    pub fn state_set(&self) -> (HashMap<Hash, Vec<u8>>, HashMap<Hash, HashMap<Hash, Vec<u8>>>) {
        let mut accounts = HashMap::with_capacity(self.accounts.len());
        let mut storages: HashMap<Hash, HashMap<Hash, Vec<u8>>> = HashMap::new();
        for (address, blob) in &self.accounts {
            let hash = address.hash();
            accounts.insert(hash, blob.clone());

            if let Some(slots) = self.storages.get(address) {
                let subset = slots
                    .iter()
                    .map(|(slot, value)| {
                        let key = if self.raw_storage_key() {
                            Hash::keccak256(slot.as_bytes())
                        } else {
                            *slot
                        };
                        (key, value.clone())
                    })
                    .collect();
                storages.insert(hash, subset);
            }
        }
        (accounts, storages)
    }

    /// Encode into a single freezer blob.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE + 64 * self.accounts.len());
        buf.push(self.version);
        buf.extend_from_slice(self.parent.as_bytes());
        buf.extend_from_slice(self.root.as_bytes());

        buf.extend_from_slice(&(self.accounts.len() as u32).to_be_bytes());
        for (address, blob) in &self.accounts {
            buf.extend_from_slice(address.as_bytes());
            put_bytes(&mut buf, blob);
        }
        buf.extend_from_slice(&(self.storages.len() as u32).to_be_bytes());
        for (address, slots) in &self.storages {
            buf.extend_from_slice(address.as_bytes());
            buf.extend_from_slice(&(slots.len() as u32).to_be_bytes());
            for (slot, blob) in slots {
                buf.extend_from_slice(slot.as_bytes());
                put_bytes(&mut buf, blob);
            }
        }
        buf
    }

    /// Decode a freezer blob, enforcing key ordering and bounds.
    pub fn decode(blob: &[u8]) -> PathDbResult<Self> {
        let meta = HistoryMeta::decode(&blob[..blob.len().min(META_SIZE)])?;
        let mut cursor = Cursor::new(blob);
        cursor.read_u8()?;
        cursor.read_array::<32>()?;
        cursor.read_array::<32>()?;

        let account_count = cursor.read_u32()? as usize;
        let mut accounts = BTreeMap::new();
        let mut last_address: Option<Address> = None;
        for _ in 0..account_count {
            let address = Address(cursor.read_array::<20>()?);
            if let Some(last) = last_address {
                if last >= address {
                    return Err(PathDbError::Decode(
                        "history accounts are not in order".into(),
                    ));
                }
            }
            last_address = Some(address);
            accounts.insert(address, cursor.read_bytes()?);
        }
        let storage_count = cursor.read_u32()? as usize;
        let mut storages = BTreeMap::new();
        let mut last_address: Option<Address> = None;
        for _ in 0..storage_count {
            let address = Address(cursor.read_array::<20>()?);
            if let Some(last) = last_address {
                if last >= address {
                    return Err(PathDbError::Decode(
                        "history storage accounts are not in order".into(),
                    ));
                }
            }
            last_address = Some(address);
            if !accounts.contains_key(&address) {
                return Err(PathDbError::Decode(
                    "history storage without account entry".into(),
                ));
            }
            let slot_count = cursor.read_u32()? as usize;
            let mut slots = BTreeMap::new();
            let mut last_slot: Option<Hash> = None;
            for _ in 0..slot_count {
                let slot = Hash(cursor.read_array::<32>()?);
                if let Some(last) = last_slot {
                    if last >= slot {
                        return Err(PathDbError::Decode(
                            "history storage slots are not in order".into(),
                        ));
                    }
                }
                last_slot = Some(slot);
                slots.insert(slot, cursor.read_bytes()?);
            }
            storages.insert(address, slots);
        }
        if !cursor.is_exhausted() {
            return Err(PathDbError::Decode("trailing bytes in history entry".into()));
        }
        Ok(Self {
            version: meta.version,
            parent: meta.parent,
            root: meta.root,
            accounts,
            storages,
        })
    }
}

/// The append-only, tail-truncatable sequence of history entries,
/// backed by the freezer plus the key/value store holding the
/// `root -> id` lookups that must stay aligned with it.
pub struct HistoryStore {
    freezer: Freezer,
    store: Arc<dyn KeyValueStore>,
}

impl HistoryStore {
    /// Open the history table in the given directory.
    pub fn open<P: AsRef<Path>>(dir: P, store: Arc<dyn KeyValueStore>) -> PathDbResult<Self> {
        let freezer = Freezer::open(dir)?;
        Ok(Self { freezer, store })
    }

    /// Id of the newest entry, zero when empty.
    pub fn head(&self) -> u64 {
        self.freezer.head()
    }

    /// Number of entries pruned from the tail; the oldest live entry
    /// has id `tail() + 1`.
    pub fn tail(&self) -> u64 {
        self.freezer.tail()
    }

    /// Whether no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    /// Append the entry under the given state id.
    pub fn append(&self, entry: &HistoryEntry, id: u64) -> PathDbResult<()> {
        self.freezer.append(id, &entry.encode())?;
        Ok(())
    }

    /// Read and decode the entry with the given state id.
    pub fn read(&self, id: u64) -> PathDbResult<HistoryEntry> {
        HistoryEntry::decode(&self.freezer.read(id)?)
    }

    /// Read only the metadata prefix of the entry with the given id.
    pub fn read_meta(&self, id: u64) -> PathDbResult<HistoryMeta> {
        HistoryMeta::decode(&self.freezer.read(id)?)
    }

    /// Remove entries above `new_head`, deleting their `root -> id`
    /// lookups. Returns the number of entries removed.
    pub fn truncate_from_head(&self, new_head: u64) -> PathDbResult<u64> {
        let head = self.freezer.head();
        let mut batch = WriteBatch::new();
        for id in new_head + 1..=head {
            let meta = self.read_meta(id)?;
            batch.delete(ColumnFamily::StateIds, meta.root.as_bytes().to_vec());
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        let removed = self.freezer.truncate_from_head(new_head)?;
        if removed > 0 {
            debug!(new_head, removed, "Truncated state history from head");
        }
        Ok(removed)
    }

    /// Remove entries at or below `new_tail`, deleting their
    /// `root -> id` lookups. Returns the number of entries removed.
    pub fn truncate_from_tail(&self, new_tail: u64) -> PathDbResult<u64> {
        let tail = self.freezer.tail();
        let mut batch = WriteBatch::new();
        for id in tail + 1..=new_tail {
            let meta = self.read_meta(id)?;
            batch.delete(ColumnFamily::StateIds, meta.root.as_bytes().to_vec());
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        let removed = self.freezer.truncate_from_tail(new_tail)?;
        if removed > 0 {
            debug!(new_tail, removed, "Truncated state history from tail");
        }
        Ok(removed)
    }

    /// Wipe all entries.
    pub fn reset(&self) -> PathDbResult<()> {
        self.freezer.reset()?;
        Ok(())
    }

    /// Flush the underlying table durably to disk.
    pub fn sync(&self) -> PathDbResult<()> {
        self.freezer.sync()?;
        Ok(())
    }

    /// Run the check over the metadata of `count` entries starting at
    /// `start`, stopping early when the check fails.
    pub fn check_consistency(
        &self,
        start: u64,
        count: u64,
        mut check: impl FnMut(&HistoryMeta) -> bool,
    ) -> PathDbResult<bool> {
        for id in start..start + count {
            let meta = self.read_meta(id)?;
            if !check(&meta) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::StateSet;
    use pathdb_storage::{schema, MemoryStore};
    use tempfile::TempDir;

    fn sample_entry(seed: u8, raw: bool) -> HistoryEntry {
        let mut accounts = BTreeMap::new();
        accounts.insert(Address([seed; 20]), vec![seed; 5]);
        accounts.insert(Address([seed + 1; 20]), Vec::new());
        let mut slots = BTreeMap::new();
        slots.insert(Hash([1u8; 32]), b"prev".to_vec());
        slots.insert(Hash([2u8; 32]), Vec::new());
        let mut storages = BTreeMap::new();
        storages.insert(Address([seed; 20]), slots);
        HistoryEntry {
            version: if raw { HISTORY_V1 } else { HISTORY_V0 },
            parent: Hash([seed; 32]),
            root: Hash([seed + 1; 32]),
            accounts,
            storages,
        }
    }

    #[test]
    fn test_entry_codec_roundtrip() {
        for raw in [false, true] {
            let entry = sample_entry(3, raw);
            let decoded = HistoryEntry::decode(&entry.encode()).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_entry_decode_rejects_bad_version() {
        let mut blob = sample_entry(3, false).encode();
        blob[0] = 9;
        assert!(matches!(
            HistoryEntry::decode(&blob),
            Err(PathDbError::UnexpectedVersion(9))
        ));
    }

    #[test]
    fn test_entry_decode_rejects_trailing_bytes() {
        let mut blob = sample_entry(3, false).encode();
        blob.push(0);
        assert!(HistoryEntry::decode(&blob).is_err());
    }

    #[test]
    fn test_state_set_hashes_keys() {
        let entry = sample_entry(3, true);
        let (accounts, storages) = entry.state_set();

        let addr = Address([3u8; 20]);
        assert_eq!(accounts.get(&addr.hash()).unwrap(), &vec![3u8; 5]);

        // Raw slot keys are hashed on conversion.
        let slots = storages.get(&addr.hash()).unwrap();
        assert_eq!(
            slots.get(&Hash::keccak256(Hash([1u8; 32]).as_bytes())).unwrap(),
            b"prev"
        );
    }

    #[test]
    fn test_from_states_version_tracks_raw_flag() {
        let states = StateSetWithOrigin::new(
            StateSet::empty(),
            HashMap::new(),
            HashMap::new(),
            true,
        );
        let entry = HistoryEntry::from_states(Hash([1u8; 32]), Hash([0u8; 32]), &states);
        assert_eq!(entry.version, HISTORY_V1);
        assert!(entry.raw_storage_key());
    }

    #[test]
    fn test_store_truncations_drop_lookups() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let history = HistoryStore::open(tmp.path(), store.clone()).unwrap();

        for id in 1..=4u64 {
            let entry = sample_entry(id as u8 * 10, false);
            schema::write_state_id(store.as_ref(), entry.root.as_bytes(), id).unwrap();
            history.append(&entry, id).unwrap();
        }
        assert_eq!(history.head(), 4);

        // Head truncation removes the newest lookups.
        history.truncate_from_head(3).unwrap();
        let dropped = sample_entry(40, false).root;
        assert_eq!(
            schema::read_state_id(store.as_ref(), dropped.as_bytes()).unwrap(),
            None
        );

        // Tail truncation removes the oldest lookups.
        history.truncate_from_tail(1).unwrap();
        let dropped = sample_entry(10, false).root;
        assert_eq!(
            schema::read_state_id(store.as_ref(), dropped.as_bytes()).unwrap(),
            None
        );
        let kept = sample_entry(20, false).root;
        assert_eq!(
            schema::read_state_id(store.as_ref(), kept.as_bytes()).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_check_consistency() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let history = HistoryStore::open(tmp.path(), store).unwrap();

        for id in 1..=3u64 {
            history.append(&sample_entry(id as u8, false), id).unwrap();
        }
        let all_versioned = history
            .check_consistency(1, 3, |meta| meta.version == HISTORY_V0)
            .unwrap();
        assert!(all_versioned);

        let chained = history
            .check_consistency(1, 3, |meta| meta.parent == Hash([9u8; 32]))
            .unwrap();
        assert!(!chained);
    }
}
