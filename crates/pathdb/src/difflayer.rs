//! Immutable in-memory diff layers.

use crate::nodes::{Node, NodeSet};
use crate::states::StateSetWithOrigin;
use crate::types::Hash;
use crate::Layer;
use parking_lot::RwLock;
use std::sync::Arc;

const FILTER_BITS: usize = 2048;

/// A fixed-size bit-set over the account hashes touched by one diff
/// layer. A negative answer proves the account is absent from the
/// layer, letting readers skip the map lookups; collisions only cost
/// a wasted probe.
#[derive(Debug, Clone)]
pub struct AccountFilter {
    bits: [u64; FILTER_BITS / 64],
}

impl AccountFilter {
    fn new() -> Self {
        Self {
            bits: [0u64; FILTER_BITS / 64],
        }
    }

    fn index(hash: &Hash) -> usize {
        let bytes = hash.as_bytes();
        (u16::from_be_bytes([bytes[0], bytes[1]]) as usize) % FILTER_BITS
    }

    fn insert(&mut self, hash: &Hash) {
        let idx = Self::index(hash);
        self.bits[idx / 64] |= 1 << (idx % 64);
    }

    /// Whether the layer may hold state for the given account hash.
    pub fn may_contain(&self, hash: &Hash) -> bool {
        let idx = Self::index(hash);
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }
}

/// An immutable layer stacked on a parent, holding the trie nodes and
/// flat state written by one transition together with the prior values
/// needed to build its reverse diff.
pub struct DiffLayer {
    root: Hash,
    id: u64,
    block: u64,
    nodes: NodeSet,
    states: StateSetWithOrigin,
    filter: AccountFilter,
    /// Back-reference to the layer below; rewired when the layer below
    /// is flattened into a new disk layer.
    parent: RwLock<Layer>,
}

impl DiffLayer {
    /// Stack a new diff on the given parent.
    pub fn new(
        parent: Layer,
        root: Hash,
        id: u64,
        block: u64,
        nodes: NodeSet,
        states: StateSetWithOrigin,
    ) -> Arc<Self> {
        let mut filter = AccountFilter::new();
        for hash in states.state.accounts().keys() {
            filter.insert(hash);
        }
        for hash in states.state.storages().keys() {
            filter.insert(hash);
        }
        Arc::new(Self {
            root,
            id,
            block,
            nodes,
            states,
            filter,
            parent: RwLock::new(parent),
        })
    }

    /// Root hash this layer was made for.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// State id of the layer's transition.
    pub fn state_id(&self) -> u64 {
        self.id
    }

    /// Block number associated with the transition.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// The layer below.
    pub fn parent(&self) -> Layer {
        self.parent.read().clone()
    }

    /// Rewire the parent after the layer below was flattened.
    pub(crate) fn set_parent(&self, parent: Layer) {
        *self.parent.write() = parent;
    }

    /// Trie node mutations of this layer.
    pub fn nodes(&self) -> &NodeSet {
        &self.nodes
    }

    /// Flat state mutations of this layer, with origins.
    pub fn states(&self) -> &StateSetWithOrigin {
        &self.states
    }

    /// The account membership filter.
    pub fn filter(&self) -> &AccountFilter {
        &self.filter
    }

    /// Approximate memory footprint of the layer's sets.
    pub fn size(&self) -> u64 {
        self.nodes.size() + self.states.size()
    }

    /// Look up a node in this layer only.
    pub(crate) fn node(&self, owner: &Hash, path: &[u8]) -> Option<&Node> {
        self.nodes.node(owner, path)
    }

    /// Look up a flat account entry in this layer only.
    pub(crate) fn account(&self, hash: &Hash) -> Option<&[u8]> {
        if !self.filter.may_contain(hash) {
            return None;
        }
        self.states.state.account(hash)
    }

    /// Look up a flat storage entry in this layer only.
    pub(crate) fn storage(&self, account: &Hash, slot: &Hash) -> Option<&[u8]> {
        if !self.filter.may_contain(account) {
            return None;
        }
        self.states.state.storage(account, slot)
    }
}
