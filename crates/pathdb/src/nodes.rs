//! Trie node mutation sets.

use crate::codec::{put_bytes, Cursor};
use crate::error::PathDbResult;
use crate::types::Hash;
use std::collections::HashMap;

/// A single encoded trie node carried by a mutation set. A zero-length
/// blob encodes deletion of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Encoded node payload.
    pub blob: Vec<u8>,
    /// Keccak-256 of the payload, the empty trie root for deletions.
    pub hash: Hash,
}

impl Node {
    /// Wrap a node blob, computing its hash.
    pub fn new(blob: Vec<u8>) -> Self {
        let hash = Hash::of_node(&blob);
        Self { blob, hash }
    }

    /// A deletion marker.
    pub fn deleted() -> Self {
        Self::new(Vec::new())
    }

    /// Whether this entry deletes the node.
    pub fn is_deleted(&self) -> bool {
        self.blob.is_empty()
    }
}

/// The trie mutations of one or more transitions, keyed by owner hash
/// (zero for the account trie) and node path.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    sets: HashMap<Hash, HashMap<Vec<u8>, Node>>,
    size: u64,
}

impl NodeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a prepared owner-to-path mapping.
    pub fn from_map(sets: HashMap<Hash, HashMap<Vec<u8>, Node>>) -> Self {
        let mut size = 0u64;
        for subset in sets.values() {
            for (path, node) in subset {
                size += (path.len() + node.blob.len()) as u64;
            }
        }
        Self { sets, size }
    }

    /// Look up a node by owner and path.
    pub fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.sets.get(owner)?.get(path)
    }

    /// Insert a node, replacing any existing entry.
    pub fn insert(&mut self, owner: Hash, path: Vec<u8>, node: Node) {
        let subset = self.sets.entry(owner).or_default();
        match subset.insert(path.clone(), node) {
            Some(old) => {
                let new_len = subset.get(&path).map_or(0, |n| n.blob.len());
                self.size = self.size + new_len as u64 - old.blob.len() as u64;
            }
            None => {
                let new_len = subset.get(&path).map_or(0, |n| n.blob.len());
                self.size += (path.len() + new_len) as u64;
            }
        }
    }

    /// Fold a newer set into this one; entries of the newer set win.
    pub fn merge(&mut self, other: NodeSet) {
        for (owner, subset) in other.sets {
            for (path, node) in subset {
                self.insert(owner, path, node);
            }
        }
    }

    /// Iterate all subsets.
    pub fn iter(&self) -> impl Iterator<Item = (&Hash, &HashMap<Vec<u8>, Node>)> {
        self.sets.iter()
    }

    /// Total number of node entries.
    pub fn len(&self) -> usize {
        self.sets.values().map(|s| s.len()).sum()
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Approximate memory footprint: path plus blob bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.sets.clear();
        self.size = 0;
    }

    /// Append the encoded set to the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.sets.len() as u32).to_be_bytes());
        for (owner, subset) in &self.sets {
            buf.extend_from_slice(owner.as_bytes());
            buf.extend_from_slice(&(subset.len() as u32).to_be_bytes());
            for (path, node) in subset {
                put_bytes(buf, path);
                put_bytes(buf, &node.blob);
            }
        }
    }

    /// Decode a set previously written by [`Self::encode_into`].
    pub fn decode_from(cursor: &mut Cursor<'_>) -> PathDbResult<Self> {
        let owner_count = cursor.read_u32()? as usize;
        let mut sets = HashMap::with_capacity(owner_count);
        for _ in 0..owner_count {
            let owner = Hash(cursor.read_array::<32>()?);
            let entry_count = cursor.read_u32()? as usize;
            let mut subset = HashMap::with_capacity(entry_count);
            for _ in 0..entry_count {
                let path = cursor.read_bytes()?;
                let blob = cursor.read_bytes()?;
                subset.insert(path, Node::new(blob));
            }
            sets.insert(owner, subset);
        }
        Ok(Self::from_map(sets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_set(entries: &[(Hash, &[u8], &[u8])]) -> NodeSet {
        let mut set = NodeSet::new();
        for (owner, path, blob) in entries {
            set.insert(*owner, path.to_vec(), Node::new(blob.to_vec()));
        }
        set
    }

    #[test]
    fn test_merge_newer_wins() {
        let owner = Hash::ZERO;
        let mut base = node_set(&[(owner, b"ab", b"old"), (owner, b"cd", b"keep")]);
        let newer = node_set(&[(owner, b"ab", b"new"), (owner, b"ef", b"add")]);

        base.merge(newer);
        assert_eq!(base.node(&owner, b"ab").unwrap().blob, b"new");
        assert_eq!(base.node(&owner, b"cd").unwrap().blob, b"keep");
        assert_eq!(base.node(&owner, b"ef").unwrap().blob, b"add");
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn test_size_accounting() {
        let owner = Hash([1u8; 32]);
        let mut set = NodeSet::new();
        set.insert(owner, b"ab".to_vec(), Node::new(b"blob".to_vec()));
        assert_eq!(set.size(), 6);

        // Replacing adjusts by the blob delta only.
        set.insert(owner, b"ab".to_vec(), Node::new(b"longerblob".to_vec()));
        assert_eq!(set.size(), 12);

        set.insert(owner, b"ab".to_vec(), Node::deleted());
        assert_eq!(set.size(), 2);
    }

    #[test]
    fn test_codec_roundtrip() {
        let set = node_set(&[
            (Hash::ZERO, b"", b"rootnode"),
            (Hash::ZERO, b"ab", b""),
            (Hash([2u8; 32]), b"cd", b"stnode"),
        ]);

        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        let decoded = NodeSet::decode_from(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(decoded.len(), set.len());
        assert_eq!(decoded.size(), set.size());
        assert!(decoded.node(&Hash::ZERO, b"ab").unwrap().is_deleted());
        assert_eq!(
            decoded.node(&Hash([2u8; 32]), b"cd").unwrap().blob,
            b"stnode"
        );
    }
}
