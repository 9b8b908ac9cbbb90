//! Binary encoding helpers shared by the on-disk record formats.
//!
//! All multi-byte integers are big-endian; variable-length fields are
//! prefixed with a `u32` length.

use crate::error::{PathDbError, PathDbResult};

/// Append a `u32` length-prefixed byte string.
pub fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Cursor over an encoded record, with truncation checks on every read.
pub struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Whether the cursor consumed the whole record.
    pub fn is_exhausted(&self) -> bool {
        self.offset == self.buf.len()
    }

    fn take(&mut self, n: usize) -> PathDbResult<&'a [u8]> {
        if self.offset + n > self.buf.len() {
            return Err(PathDbError::Decode(format!(
                "record truncated: need {} bytes at offset {}, have {}",
                n,
                self.offset,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> PathDbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> PathDbResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len checked")))
    }

    pub fn read_u64(&mut self) -> PathDbResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("len checked")))
    }

    pub fn read_array<const N: usize>(&mut self) -> PathDbResult<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("len checked"))
    }

    /// Read a `u32` length-prefixed byte string.
    pub fn read_bytes(&mut self) -> PathDbResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
