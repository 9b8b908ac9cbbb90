//! Byte-budgeted clean caches.
//!
//! Read-through caches sitting between the buffers and the persistent
//! store. Both readers and the background flusher insert; the design
//! guarantees two writers never produce distinct values for the same
//! key, because any in-flight value is still discoverable in the
//! frozen buffer.

use crate::types::Hash;
use lru::LruCache;
use parking_lot::Mutex;

struct Inner {
    map: LruCache<Vec<u8>, Vec<u8>>,
    bytes: usize,
}

/// An LRU cache bounded by the total byte size of its entries rather
/// than their count. Empty values are valid entries (tombstones).
pub struct CleanCache {
    limit: usize,
    inner: Mutex<Inner>,
}

impl CleanCache {
    /// Create a cache with the given byte budget.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                bytes: 0,
            }),
        }
    }

    /// Look up a value, promoting the entry on hit.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.lock().map.get(key).cloned()
    }

    /// Insert a value, evicting least-recently-used entries until the
    /// byte budget is respected.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut inner = self.inner.lock();
        let entry_size = key.len() + value.len();
        if let Some(old) = inner.map.push(key, value) {
            inner.bytes -= old.0.len() + old.1.len();
        }
        inner.bytes += entry_size;
        while inner.bytes > self.limit {
            match inner.map.pop_lru() {
                Some((k, v)) => inner.bytes -= k.len() + v.len(),
                None => break,
            }
        }
    }

    /// Drop the entry for the given key.
    pub fn remove(&self, key: &[u8]) {
        let mut inner = self.inner.lock();
        if let Some(value) = inner.map.pop(key) {
            inner.bytes -= key.len() + value.len();
        }
    }

    /// Drop all entries.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.bytes = 0;
    }

    /// Current byte footprint of the cached entries.
    pub fn size(&self) -> usize {
        self.inner.lock().bytes
    }
}

/// Cache key of a trie node: the bare path for the account trie, the
/// owner hash followed by the path for a storage trie.
pub fn node_cache_key(owner: &Hash, path: &[u8]) -> Vec<u8> {
    if owner.is_zero() {
        path.to_vec()
    } else {
        let mut key = Vec::with_capacity(32 + path.len());
        key.extend_from_slice(owner.as_bytes());
        key.extend_from_slice(path);
        key
    }
}

/// Cache key of a flat storage entry.
pub fn state_cache_key(account: &Hash, slot: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(account.as_bytes());
    key.extend_from_slice(slot.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_remove() {
        let cache = CleanCache::new(1024);
        assert_eq!(cache.get(b"k"), None);

        cache.set(b"k".to_vec(), b"v".to_vec());
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));

        // Empty values are tombstones, not misses.
        cache.set(b"t".to_vec(), Vec::new());
        assert_eq!(cache.get(b"t"), Some(Vec::new()));

        cache.remove(b"k");
        assert_eq!(cache.get(b"k"), None);
    }

    #[test]
    fn test_byte_budget_eviction() {
        let cache = CleanCache::new(20);
        cache.set(b"a".to_vec(), vec![0u8; 9]);
        cache.set(b"b".to_vec(), vec![0u8; 9]);
        assert_eq!(cache.size(), 20);

        // Inserting a third entry evicts the least recently used.
        cache.set(b"c".to_vec(), vec![0u8; 9]);
        assert_eq!(cache.get(b"a"), None);
        assert!(cache.get(b"b").is_some());
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn test_replace_adjusts_size() {
        let cache = CleanCache::new(100);
        cache.set(b"k".to_vec(), vec![0u8; 10]);
        cache.set(b"k".to_vec(), vec![0u8; 4]);
        assert_eq!(cache.size(), 5);
    }
}
