//! Flat state mutation sets.

use crate::codec::{put_bytes, Cursor};
use crate::error::PathDbResult;
use crate::types::{Address, Hash};
use std::collections::HashMap;

/// Flat account and storage mutations of one or more transitions,
/// keyed by hashed account address and hashed storage key. Zero-length
/// values are tombstones: the entry is known to be absent.
#[derive(Debug, Clone, Default)]
pub struct StateSet {
    accounts: HashMap<Hash, Vec<u8>>,
    storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    size: u64,
}

impl StateSet {
    /// Create an empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap prepared account and storage mappings.
    pub fn new(
        accounts: HashMap<Hash, Vec<u8>>,
        storages: HashMap<Hash, HashMap<Hash, Vec<u8>>>,
    ) -> Self {
        let mut size = 0u64;
        for blob in accounts.values() {
            size += (32 + blob.len()) as u64;
        }
        for slots in storages.values() {
            for blob in slots.values() {
                size += (64 + blob.len()) as u64;
            }
        }
        Self {
            accounts,
            storages,
            size,
        }
    }

    /// Look up an account. `Some` with an empty blob means the account
    /// is known to be absent.
    pub fn account(&self, hash: &Hash) -> Option<&[u8]> {
        self.accounts.get(hash).map(|b| b.as_slice())
    }

    /// Look up a storage slot.
    pub fn storage(&self, account: &Hash, slot: &Hash) -> Option<&[u8]> {
        self.storages.get(account)?.get(slot).map(|b| b.as_slice())
    }

    /// Account mutations.
    pub fn accounts(&self) -> &HashMap<Hash, Vec<u8>> {
        &self.accounts
    }

    /// Storage mutations.
    pub fn storages(&self) -> &HashMap<Hash, HashMap<Hash, Vec<u8>>> {
        &self.storages
    }

    /// Insert an account mutation.
    pub fn insert_account(&mut self, hash: Hash, blob: Vec<u8>) {
        match self.accounts.insert(hash, blob) {
            Some(old) => {
                let new_len = self.accounts.get(&hash).map_or(0, |b| b.len());
                self.size = self.size + new_len as u64 - old.len() as u64;
            }
            None => {
                let new_len = self.accounts.get(&hash).map_or(0, |b| b.len());
                self.size += (32 + new_len) as u64;
            }
        }
    }

    /// Insert a storage mutation.
    pub fn insert_storage(&mut self, account: Hash, slot: Hash, blob: Vec<u8>) {
        let slots = self.storages.entry(account).or_default();
        match slots.insert(slot, blob) {
            Some(old) => {
                let new_len = slots.get(&slot).map_or(0, |b| b.len());
                self.size = self.size + new_len as u64 - old.len() as u64;
            }
            None => {
                let new_len = slots.get(&slot).map_or(0, |b| b.len());
                self.size += (64 + new_len) as u64;
            }
        }
    }

    /// Fold a newer set into this one; entries of the newer set win.
    pub fn merge(&mut self, other: StateSet) {
        for (hash, blob) in other.accounts {
            self.insert_account(hash, blob);
        }
        for (account, slots) in other.storages {
            for (slot, blob) in slots {
                self.insert_storage(account, slot, blob);
            }
        }
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storages.is_empty()
    }

    /// Approximate memory footprint: key plus value bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.accounts.clear();
        self.storages.clear();
        self.size = 0;
    }

    /// Append the encoded set to the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.accounts.len() as u32).to_be_bytes());
        for (hash, blob) in &self.accounts {
            buf.extend_from_slice(hash.as_bytes());
            put_bytes(buf, blob);
        }
        buf.extend_from_slice(&(self.storages.len() as u32).to_be_bytes());
        for (account, slots) in &self.storages {
            buf.extend_from_slice(account.as_bytes());
            buf.extend_from_slice(&(slots.len() as u32).to_be_bytes());
            for (slot, blob) in slots {
                buf.extend_from_slice(slot.as_bytes());
                put_bytes(buf, blob);
            }
        }
    }

    /// Decode a set previously written by [`Self::encode_into`].
    pub fn decode_from(cursor: &mut Cursor<'_>) -> PathDbResult<Self> {
        let account_count = cursor.read_u32()? as usize;
        let mut accounts = HashMap::with_capacity(account_count);
        for _ in 0..account_count {
            let hash = Hash(cursor.read_array::<32>()?);
            accounts.insert(hash, cursor.read_bytes()?);
        }
        let storage_count = cursor.read_u32()? as usize;
        let mut storages = HashMap::with_capacity(storage_count);
        for _ in 0..storage_count {
            let account = Hash(cursor.read_array::<32>()?);
            let slot_count = cursor.read_u32()? as usize;
            let mut slots = HashMap::with_capacity(slot_count);
            for _ in 0..slot_count {
                let slot = Hash(cursor.read_array::<32>()?);
                slots.insert(slot, cursor.read_bytes()?);
            }
            storages.insert(account, slots);
        }
        Ok(Self::new(accounts, storages))
    }
}

/// A state set augmented with the prior values of every mutated entry,
/// keyed by address rather than hash so raw storage keys can be kept.
/// Sufficient to compute the reverse diff of its transition.
#[derive(Debug, Clone, Default)]
pub struct StateSetWithOrigin {
    /// The forward mutations.
    pub state: StateSet,
    /// Prior account blobs keyed by address; empty means the account
    /// did not exist before the transition.
    pub account_origin: HashMap<Address, Vec<u8>>,
    /// Prior storage values keyed by address and slot identifier (raw
    /// key or key hash, depending on `raw_storage_key`).
    pub storage_origin: HashMap<Address, HashMap<Hash, Vec<u8>>>,
    /// Whether storage origins are keyed by the raw slot key.
    pub raw_storage_key: bool,
    size: u64,
}

impl StateSetWithOrigin {
    /// Combine forward mutations with their origin values.
    pub fn new(
        state: StateSet,
        account_origin: HashMap<Address, Vec<u8>>,
        storage_origin: HashMap<Address, HashMap<Hash, Vec<u8>>>,
        raw_storage_key: bool,
    ) -> Self {
        let mut size = state.size();
        for blob in account_origin.values() {
            size += (20 + blob.len()) as u64;
        }
        for slots in storage_origin.values() {
            for blob in slots.values() {
                size += (52 + blob.len()) as u64;
            }
        }
        Self {
            state,
            account_origin,
            storage_origin,
            raw_storage_key,
            size,
        }
    }

    /// Approximate memory footprint including origins.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append the encoded set to the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        self.state.encode_into(buf);
        buf.push(self.raw_storage_key as u8);
        buf.extend_from_slice(&(self.account_origin.len() as u32).to_be_bytes());
        for (address, blob) in &self.account_origin {
            buf.extend_from_slice(address.as_bytes());
            put_bytes(buf, blob);
        }
        buf.extend_from_slice(&(self.storage_origin.len() as u32).to_be_bytes());
        for (address, slots) in &self.storage_origin {
            buf.extend_from_slice(address.as_bytes());
            buf.extend_from_slice(&(slots.len() as u32).to_be_bytes());
            for (slot, blob) in slots {
                buf.extend_from_slice(slot.as_bytes());
                put_bytes(buf, blob);
            }
        }
    }

    /// Decode a set previously written by [`Self::encode_into`].
    pub fn decode_from(cursor: &mut Cursor<'_>) -> PathDbResult<Self> {
        let state = StateSet::decode_from(cursor)?;
        let raw_storage_key = cursor.read_u8()? != 0;
        let account_count = cursor.read_u32()? as usize;
        let mut account_origin = HashMap::with_capacity(account_count);
        for _ in 0..account_count {
            let address = Address(cursor.read_array::<20>()?);
            account_origin.insert(address, cursor.read_bytes()?);
        }
        let storage_count = cursor.read_u32()? as usize;
        let mut storage_origin = HashMap::with_capacity(storage_count);
        for _ in 0..storage_count {
            let address = Address(cursor.read_array::<20>()?);
            let slot_count = cursor.read_u32()? as usize;
            let mut slots = HashMap::with_capacity(slot_count);
            for _ in 0..slot_count {
                let slot = Hash(cursor.read_array::<32>()?);
                slots.insert(slot, cursor.read_bytes()?);
            }
            storage_origin.insert(address, slots);
        }
        Ok(Self::new(state, account_origin, storage_origin, raw_storage_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_is_distinct_from_absence() {
        let mut set = StateSet::empty();
        set.insert_account(Hash([1u8; 32]), Vec::new());

        assert_eq!(set.account(&Hash([1u8; 32])), Some(&[][..]));
        assert_eq!(set.account(&Hash([2u8; 32])), None);
    }

    #[test]
    fn test_merge_accounts_and_storage() {
        let mut base = StateSet::empty();
        base.insert_account(Hash([1u8; 32]), b"v1".to_vec());
        base.insert_storage(Hash([1u8; 32]), Hash([9u8; 32]), b"s1".to_vec());

        let mut newer = StateSet::empty();
        newer.insert_account(Hash([1u8; 32]), Vec::new());
        newer.insert_storage(Hash([1u8; 32]), Hash([9u8; 32]), b"s2".to_vec());
        newer.insert_storage(Hash([2u8; 32]), Hash([8u8; 32]), b"s3".to_vec());

        base.merge(newer);
        assert_eq!(base.account(&Hash([1u8; 32])), Some(&[][..]));
        assert_eq!(
            base.storage(&Hash([1u8; 32]), &Hash([9u8; 32])),
            Some(&b"s2"[..])
        );
        assert_eq!(
            base.storage(&Hash([2u8; 32]), &Hash([8u8; 32])),
            Some(&b"s3"[..])
        );
    }

    #[test]
    fn test_state_set_codec_roundtrip() {
        let mut set = StateSet::empty();
        set.insert_account(Hash([1u8; 32]), b"acct".to_vec());
        set.insert_account(Hash([2u8; 32]), Vec::new());
        set.insert_storage(Hash([1u8; 32]), Hash([9u8; 32]), b"slot".to_vec());

        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        let decoded = StateSet::decode_from(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(decoded.account(&Hash([1u8; 32])), Some(&b"acct"[..]));
        assert_eq!(decoded.account(&Hash([2u8; 32])), Some(&[][..]));
        assert_eq!(
            decoded.storage(&Hash([1u8; 32]), &Hash([9u8; 32])),
            Some(&b"slot"[..])
        );
        assert_eq!(decoded.size(), set.size());
    }

    #[test]
    fn test_state_set_with_origin_codec_roundtrip() {
        let mut state = StateSet::empty();
        state.insert_account(Hash([1u8; 32]), b"post".to_vec());

        let mut account_origin = HashMap::new();
        account_origin.insert(Address([7u8; 20]), b"prev".to_vec());
        let mut storage_origin = HashMap::new();
        let mut slots = HashMap::new();
        slots.insert(Hash([9u8; 32]), Vec::new());
        storage_origin.insert(Address([7u8; 20]), slots);

        let set = StateSetWithOrigin::new(state, account_origin, storage_origin, true);
        let mut buf = Vec::new();
        set.encode_into(&mut buf);
        let decoded = StateSetWithOrigin::decode_from(&mut Cursor::new(&buf)).unwrap();

        assert!(decoded.raw_storage_key);
        assert_eq!(
            decoded.account_origin.get(&Address([7u8; 20])).unwrap(),
            b"prev"
        );
        assert_eq!(
            decoded
                .storage_origin
                .get(&Address([7u8; 20]))
                .unwrap()
                .get(&Hash([9u8; 32]))
                .unwrap(),
            &Vec::<u8>::new()
        );
        assert_eq!(decoded.size(), set.size());
    }
}
