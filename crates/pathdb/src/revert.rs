//! Reverse-diff reconstruction through the trie opener.

use crate::account::Account;
use crate::error::{PathDbError, PathDbResult};
use crate::history::HistoryEntry;
use crate::nodes::NodeSet;
use crate::types::{Hash, EMPTY_ROOT};
use crate::TrieOpener;

/// Rebuild the trie mutations that undo the transition recorded by the
/// history entry.
///
/// Tries are opened at the post-transition root; replaying each
/// account's prior value (and its prior storage values) and committing
/// yields the node set of the pre-transition state. The storage root
/// produced for every account must match the root recorded in its
/// prior value, and the final account trie root must equal the
/// recorded parent root.
pub(crate) fn apply(opener: &dyn TrieOpener, entry: &HistoryEntry) -> PathDbResult<NodeSet> {
    let mut account_trie = opener.open_account_trie(entry.root)?;
    let mut nodes = NodeSet::new();

    for (address, prev) in &entry.accounts {
        let addr_hash = address.hash();
        let post_blob = account_trie.get(addr_hash.as_bytes())?.unwrap_or_default();
        let slots = entry.storages.get(address);

        if prev.is_empty() {
            // The account did not exist before the transition; all of
            // its prior storage values must be deletions and the
            // replayed storage trie must collapse to the empty root.
            if let Some(slots) = slots {
                let post_root = Account::storage_root_of(&post_blob)?;
                let mut storage_trie =
                    opener.open_storage_trie(entry.root, addr_hash, post_root)?;
                for (slot, value) in slots {
                    if !value.is_empty() {
                        return Err(PathDbError::Decode(
                            "storage value of a non-existent account".into(),
                        ));
                    }
                    storage_trie.delete(&slot_trie_key(entry, slot))?;
                }
                let (computed, subset) = storage_trie.commit()?;
                if computed != EMPTY_ROOT {
                    return Err(PathDbError::ReplayMismatch {
                        computed,
                        recorded: EMPTY_ROOT,
                    });
                }
                nodes.merge(subset);
            }
            if !post_blob.is_empty() {
                account_trie.delete(addr_hash.as_bytes())?;
            }
        } else {
            let prev_account = Account::slim_decode(prev)?;
            if let Some(slots) = slots {
                let post_root = Account::storage_root_of(&post_blob)?;
                let mut storage_trie =
                    opener.open_storage_trie(entry.root, addr_hash, post_root)?;
                for (slot, value) in slots {
                    let key = slot_trie_key(entry, slot);
                    if value.is_empty() {
                        storage_trie.delete(&key)?;
                    } else {
                        storage_trie.update(&key, value.clone())?;
                    }
                }
                let (computed, subset) = storage_trie.commit()?;
                if computed != prev_account.storage_root {
                    return Err(PathDbError::ReplayMismatch {
                        computed,
                        recorded: prev_account.storage_root,
                    });
                }
                nodes.merge(subset);
            }
            account_trie.update(addr_hash.as_bytes(), prev.clone())?;
        }
    }
    let (computed, subset) = account_trie.commit()?;
    if computed != entry.parent {
        return Err(PathDbError::ReplayMismatch {
            computed,
            recorded: entry.parent,
        });
    }
    nodes.merge(subset);
    Ok(nodes)
}

/// Storage trie key of a slot identifier: raw keys are hashed, hashed
/// identifiers pass through.
fn slot_trie_key(entry: &HistoryEntry, slot: &Hash) -> [u8; 32] {
    if entry.raw_storage_key() {
        *Hash::keccak256(slot.as_bytes()).as_bytes()
    } else {
        *slot.as_bytes()
    }
}
