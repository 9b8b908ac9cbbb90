//! In-memory key-value store used by tests and tooling.

use crate::batch::OperationKind;
use crate::{ColumnFamily, KeyValueStore, StorageResult, WriteBatch};
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Keyspace = BTreeMap<Vec<u8>, Vec<u8>>;

/// A [`KeyValueStore`] backed by per-column `BTreeMap`s.
///
/// Writes applied through [`KeyValueStore::write_batch`] are atomic with
/// respect to readers, matching the durability contract of the RocksDB
/// backend minus the persistence.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<BTreeMap<ColumnFamily, Keyspace>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys in the given column family.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.columns.read().get(&cf).map_or(0, |c| c.len())
    }

    /// Check whether the given column family holds no keys.
    pub fn is_empty(&self, cf: ColumnFamily) -> bool {
        self.len(cf) == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .columns
            .read()
            .get(&cf)
            .and_then(|c| c.get(key).cloned()))
    }

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.columns
            .write()
            .entry(cf)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()> {
        if let Some(column) = self.columns.write().get_mut(&cf) {
            column.remove(key);
        }
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut columns = self.columns.write();
        for op in batch.operations {
            let column = columns.entry(op.cf).or_default();
            match op.kind {
                OperationKind::Put { value } => {
                    column.insert(op.key, value);
                }
                OperationKind::Delete => {
                    column.remove(&op.key);
                }
            }
        }
        Ok(())
    }

    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let snapshot: Vec<_> = self
            .columns
            .read()
            .get(&cf)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }
}
