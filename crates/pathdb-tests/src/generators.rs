//! Deterministic generation of state transitions.
//!
//! The trie encoding is outside the database under test, so these
//! generators use a miniature scheme that is consistent between
//! forward updates and reverse replays: every account is one leaf
//! node of the account trie keyed by its address hash, every storage
//! slot one leaf of the owning account's storage trie, and each trie
//! root node carries the canonical serialization of its full content,
//! so the root hash is the hash of the root node blob.

use pathdb::{
    Account, Address, Hash, Node, NodeSet, StateSet, StateSetWithOrigin, EMPTY_CODE_HASH,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

/// Full flat image of one state version.
#[derive(Debug, Clone, Default)]
pub struct TrieState {
    /// Slim account blobs keyed by address hash.
    pub accounts: HashMap<Hash, Vec<u8>>,
    /// Storage values keyed by address hash and slot key hash.
    pub storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    /// Reverse mapping from address hash to address.
    pub addresses: HashMap<Hash, Address>,
    /// Reverse mapping from slot key hash to raw slot key.
    pub slot_keys: HashMap<Hash, Hash>,
}

/// One generated transition, ready to feed into the database and
/// replay in assertions.
#[derive(Debug, Clone)]
pub struct Transition {
    pub parent: Hash,
    pub root: Hash,
    pub block: u64,
    pub nodes: NodeSet,
    pub states: StateSetWithOrigin,
    /// The full state after the transition.
    pub post: TrieState,
}

/// Canonical blob of a trie's full content: sorted keys, each followed
/// by its length-prefixed value. The root hash of the miniature trie
/// is the hash of this blob; an empty trie serializes to the empty
/// blob, making its root the empty trie root.
pub fn trie_root_blob(map: &HashMap<Hash, Vec<u8>>) -> Vec<u8> {
    let sorted: BTreeMap<_, _> = map.iter().collect();
    let mut blob = Vec::new();
    for (key, value) in sorted {
        blob.extend_from_slice(key.as_bytes());
        blob.extend_from_slice(&(value.len() as u32).to_be_bytes());
        blob.extend_from_slice(value);
    }
    blob
}

/// Root hash of the miniature trie holding the given content.
pub fn trie_root(map: &HashMap<Hash, Vec<u8>>) -> Hash {
    Hash::of_node(&trie_root_blob(map))
}

fn random_hash(rng: &mut StdRng) -> Hash {
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    Hash(bytes)
}

fn random_address(rng: &mut StdRng) -> Address {
    let mut bytes = [0u8; 20];
    rng.fill(&mut bytes);
    Address(bytes)
}

fn random_account(rng: &mut StdRng, storage_root: Hash) -> Vec<u8> {
    let mut balance = [0u8; 32];
    rng.fill(&mut balance);
    Account {
        nonce: rng.gen(),
        balance,
        storage_root,
        code_hash: EMPTY_CODE_HASH,
    }
    .slim_encode()
}

/// Generate one random transition on top of the given parent state.
pub fn make_transition(
    rng: &mut StdRng,
    parent_root: Hash,
    parent: &TrieState,
    block: u64,
) -> Transition {
    let mut post = parent.clone();

    // Per-account planned slot changes: slot hash -> new value (empty
    // deletes the slot).
    let mut plans: HashMap<Hash, HashMap<Hash, Vec<u8>>> = HashMap::new();
    let mut deletions: Vec<Hash> = Vec::new();

    // Touch one or two existing accounts, occasionally deleting one.
    let existing: Vec<Hash> = parent.accounts.keys().copied().collect();
    for hash in existing.iter().take(2) {
        if rng.gen_ratio(1, 10) && deletions.is_empty() {
            deletions.push(*hash);
        } else {
            let mut slots = HashMap::new();
            for _ in 0..rng.gen_range(0..3usize) {
                let raw = random_hash(rng);
                let slot_hash = Hash::keccak256(raw.as_bytes());
                post.slot_keys.insert(slot_hash, raw);
                slots.insert(slot_hash, random_hash(rng).as_bytes().to_vec());
            }
            // Delete one existing slot now and then.
            if let Some(slot) = parent.storages.get(hash).and_then(|s| s.keys().next()) {
                if rng.gen_ratio(1, 4) {
                    slots.insert(*slot, Vec::new());
                }
            }
            plans.insert(*hash, slots);
        }
    }
    // Create two brand new accounts.
    for _ in 0..2 {
        let address = random_address(rng);
        let hash = address.hash();
        post.addresses.insert(hash, address);
        let mut slots = HashMap::new();
        for _ in 0..rng.gen_range(0..2usize) {
            let raw = random_hash(rng);
            let slot_hash = Hash::keccak256(raw.as_bytes());
            post.slot_keys.insert(slot_hash, raw);
            slots.insert(slot_hash, random_hash(rng).as_bytes().to_vec());
        }
        plans.insert(hash, slots);
    }

    let mut nodes = NodeSet::new();
    let mut flat_accounts: HashMap<Hash, Vec<u8>> = HashMap::new();
    let mut flat_storages: HashMap<Hash, HashMap<Hash, Vec<u8>>> = HashMap::new();
    let mut account_origin: HashMap<Address, Vec<u8>> = HashMap::new();
    let mut storage_origin: HashMap<Address, HashMap<Hash, Vec<u8>>> = HashMap::new();

    // Deleted accounts: drop the account and every storage slot.
    for hash in deletions {
        let address = post.addresses[&hash];
        account_origin.insert(address, parent.accounts[&hash].clone());
        flat_accounts.insert(hash, Vec::new());
        nodes.insert(Hash::ZERO, hash.as_bytes().to_vec(), Node::deleted());
        post.accounts.remove(&hash);

        if let Some(slots) = post.storages.remove(&hash) {
            let mut origins = HashMap::new();
            let mut flat = HashMap::new();
            for (slot_hash, prev) in slots {
                origins.insert(post.slot_keys[&slot_hash], prev);
                flat.insert(slot_hash, Vec::new());
                nodes.insert(hash, slot_hash.as_bytes().to_vec(), Node::deleted());
            }
            if !origins.is_empty() {
                storage_origin.insert(address, origins);
                flat_storages.insert(hash, flat);
                // The storage trie collapses to nothing.
                nodes.insert(hash, Vec::new(), Node::deleted());
            }
        }
    }
    // Created or modified accounts: apply planned slot changes, then
    // refresh the account blob around the new storage root.
    for (hash, slots) in plans {
        let address = post.addresses[&hash];
        account_origin.insert(
            address,
            parent.accounts.get(&hash).cloned().unwrap_or_default(),
        );

        if !slots.is_empty() {
            let mut origins = HashMap::new();
            let mut flat = HashMap::new();
            let account_slots = post.storages.entry(hash).or_default();
            for (slot_hash, value) in slots {
                let prev = account_slots.get(&slot_hash).cloned().unwrap_or_default();
                origins.insert(post.slot_keys[&slot_hash], prev);
                flat.insert(slot_hash, value.clone());
                nodes.insert(hash, slot_hash.as_bytes().to_vec(), Node::new(value.clone()));
                if value.is_empty() {
                    account_slots.remove(&slot_hash);
                } else {
                    account_slots.insert(slot_hash, value);
                }
            }
            storage_origin.insert(address, origins);
            flat_storages.insert(hash, flat);
        }
        let storage_root = trie_root(post.storages.get(&hash).unwrap_or(&HashMap::new()));
        if post.storages.get(&hash).is_some_and(|s| !s.is_empty()) {
            let blob = trie_root_blob(&post.storages[&hash]);
            nodes.insert(hash, Vec::new(), Node::new(blob));
        } else {
            post.storages.remove(&hash);
            // The last slot went away; the storage trie root follows.
            if parent.storages.get(&hash).is_some_and(|s| !s.is_empty()) {
                nodes.insert(hash, Vec::new(), Node::deleted());
            }
        }
        let blob = random_account(rng, storage_root);
        flat_accounts.insert(hash, blob.clone());
        nodes.insert(Hash::ZERO, hash.as_bytes().to_vec(), Node::new(blob.clone()));
        post.accounts.insert(hash, blob);
    }

    // Account trie root node.
    let root_blob = trie_root_blob(&post.accounts);
    let root = Hash::of_node(&root_blob);
    nodes.insert(Hash::ZERO, Vec::new(), Node::new(root_blob));

    let state = StateSet::new(flat_accounts, flat_storages);
    let states = StateSetWithOrigin::new(state, account_origin, storage_origin, true);
    Transition {
        parent: parent_root,
        root,
        block,
        nodes,
        states,
        post,
    }
}
