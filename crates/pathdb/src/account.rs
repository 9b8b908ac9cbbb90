//! Slim account encoding.
//!
//! Flat account entries use a trimmed representation: the storage root
//! and code hash are omitted when they equal their empty defaults.
//! The revert engine needs the storage root of prior accounts, so the
//! codec lives here rather than with the excluded trie encoding.

use crate::codec::{put_bytes, Cursor};
use crate::error::PathDbResult;
use crate::types::{Hash, EMPTY_CODE_HASH, EMPTY_ROOT};

/// Decoded account record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: [u8; 32],
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    /// An account with no nonce, balance, storage or code.
    pub fn empty() -> Self {
        Self {
            nonce: 0,
            balance: [0u8; 32],
            storage_root: EMPTY_ROOT,
            code_hash: EMPTY_CODE_HASH,
        }
    }

    /// Encode in the slim format: empty storage root and empty code
    /// hash are encoded as zero-length fields.
    pub fn slim_encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 32 + 2 * (4 + 32));
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.balance);
        if self.storage_root == EMPTY_ROOT {
            put_bytes(&mut buf, &[]);
        } else {
            put_bytes(&mut buf, self.storage_root.as_bytes());
        }
        if self.code_hash == EMPTY_CODE_HASH {
            put_bytes(&mut buf, &[]);
        } else {
            put_bytes(&mut buf, self.code_hash.as_bytes());
        }
        buf
    }

    /// Decode from the slim format.
    pub fn slim_decode(blob: &[u8]) -> PathDbResult<Self> {
        let mut cursor = Cursor::new(blob);
        let nonce = cursor.read_u64()?;
        let balance = cursor.read_array::<32>()?;
        let root_bytes = cursor.read_bytes()?;
        let code_bytes = cursor.read_bytes()?;

        let storage_root = match Hash::from_slice(&root_bytes) {
            Some(root) => root,
            None => EMPTY_ROOT,
        };
        let code_hash = match Hash::from_slice(&code_bytes) {
            Some(hash) => hash,
            None => EMPTY_CODE_HASH,
        };
        Ok(Self {
            nonce,
            balance,
            storage_root,
            code_hash,
        })
    }

    /// Storage root recorded in the given slim blob; the empty trie
    /// root for a zero-length blob (absent account).
    pub fn storage_root_of(blob: &[u8]) -> PathDbResult<Hash> {
        if blob.is_empty() {
            return Ok(EMPTY_ROOT);
        }
        Ok(Self::slim_decode(blob)?.storage_root)
    }
}
