//! Write batch for atomic operations.

use crate::ColumnFamily;

/// Kind of batch operation.
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// Put a key-value pair.
    Put { value: Vec<u8> },
    /// Delete a key.
    Delete,
}

/// A single batch operation.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    /// Target column family.
    pub cf: ColumnFamily,
    /// Key to operate on.
    pub key: Vec<u8>,
    /// Kind of operation.
    pub kind: OperationKind,
}

/// A batch of write operations to be executed atomically.
#[derive(Debug, Default)]
pub struct WriteBatch {
    /// Collected operations.
    pub(crate) operations: Vec<BatchOperation>,
    /// Approximate payload bytes queued in the batch.
    value_size: usize,
}

impl WriteBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            operations: Vec::with_capacity(capacity),
            value_size: 0,
        }
    }

    /// Add a put operation to the batch.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        self.value_size += key.len() + value.len();
        self.operations.push(BatchOperation {
            cf,
            key,
            kind: OperationKind::Put { value },
        });
    }

    /// Add a delete operation to the batch.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) {
        let key = key.into();
        self.value_size += key.len();
        self.operations.push(BatchOperation {
            cf,
            key,
            kind: OperationKind::Delete,
        });
    }

    /// Get the number of operations in the batch.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Approximate size of the queued payload in bytes.
    pub fn value_size(&self) -> usize {
        self.value_size
    }

    /// Clear all operations from the batch.
    pub fn clear(&mut self) {
        self.operations.clear();
        self.value_size = 0;
    }

    /// Merge another batch into this one.
    pub fn merge(&mut self, other: WriteBatch) {
        self.value_size += other.value_size;
        self.operations.extend(other.operations);
    }
}
