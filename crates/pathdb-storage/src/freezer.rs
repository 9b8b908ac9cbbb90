//! Append-only store for state history entries.
//!
//! The freezer holds a single table of id-addressed blobs backed by
//! three files: a data file of concatenated blobs, an index file of
//! fixed-size `(offset, length)` records and a meta file carrying the
//! logical tail. Items are addressed by dense ids starting at 1; the
//! id of an item is implicit in its index position.
//!
//! Head truncation physically shortens the data and index files. Tail
//! truncation only advances the persisted tail marker; the dead bytes
//! are reclaimed when the table is reset.

use crate::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const INDEX_RECORD_SIZE: u64 = 16;

const DATA_FILE: &str = "state_history.data";
const INDEX_FILE: &str = "state_history.index";
const META_FILE: &str = "state_history.meta";
const META_TMP_FILE: &str = "state_history.meta.tmp";

struct Inner {
    data: File,
    index: File,
    /// Id of the newest item, zero when the table is empty.
    head: u64,
    /// Number of items logically deleted from the tail; the first live
    /// item has id `tail + 1`.
    tail: u64,
    data_len: u64,
}

/// Append-only single-table blob store.
pub struct Freezer {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Freezer {
    /// Open the freezer table in the given directory, creating it if
    /// absent and healing any partially written record left behind by
    /// a crash.
    pub fn open<P: AsRef<Path>>(dir: P) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(DATA_FILE))?;
        let mut index = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(INDEX_FILE))?;

        let tail = match std::fs::read(dir.join(META_FILE)) {
            Ok(bytes) if bytes.len() == 8 => {
                u64::from_be_bytes(bytes[..8].try_into().expect("len checked"))
            }
            _ => 0,
        };

        // Drop a torn index record, then walk back over records whose
        // data lies beyond the end of the data file.
        let data_len = data.seek(SeekFrom::End(0))?;
        let mut records = index.seek(SeekFrom::End(0))? / INDEX_RECORD_SIZE;
        while records > 0 {
            let (offset, len) = read_index_record(&mut index, records - 1)?;
            if offset + len <= data_len {
                break;
            }
            warn!(record = records, "Dropping incomplete freezer record");
            records -= 1;
        }
        index.set_len(records * INDEX_RECORD_SIZE)?;

        let mut head = records;
        let mut data_len = if head == 0 {
            0
        } else {
            let (offset, len) = read_index_record(&mut index, head - 1)?;
            offset + len
        };
        // A tail beyond the head can only come from manual tampering;
        // treat the table as empty from the tail onwards. The padded
        // index records are never read since ids up to the tail are
        // rejected.
        if tail > head {
            head = tail;
            data_len = 0;
            index.set_len(head * INDEX_RECORD_SIZE)?;
        }
        data.set_len(data_len)?;
        debug!(?dir, head, tail, "Opened freezer table");

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                data,
                index,
                head,
                tail,
                data_len,
            }),
        })
    }

    /// Id of the newest item, zero when empty.
    pub fn head(&self) -> u64 {
        self.inner.lock().head
    }

    /// Number of items deleted from the tail; the first live item has
    /// id `tail() + 1`.
    pub fn tail(&self) -> u64 {
        self.inner.lock().tail
    }

    /// Append a blob with the given id, which must be `head() + 1`.
    pub fn append(&self, id: u64, blob: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if id != inner.head + 1 {
            return Err(StorageError::StaleAppend {
                head: inner.head,
                appended: id,
            });
        }
        let offset = inner.data_len;
        inner.data.seek(SeekFrom::Start(offset))?;
        inner.data.write_all(blob)?;

        let mut record = [0u8; INDEX_RECORD_SIZE as usize];
        record[..8].copy_from_slice(&offset.to_be_bytes());
        record[8..].copy_from_slice(&(blob.len() as u64).to_be_bytes());
        let index_pos = inner.head * INDEX_RECORD_SIZE;
        inner.index.seek(SeekFrom::Start(index_pos))?;
        inner.index.write_all(&record)?;

        inner.head = id;
        inner.data_len = offset + blob.len() as u64;
        Ok(())
    }

    /// Read the blob stored under the given id.
    pub fn read(&self, id: u64) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        if id <= inner.tail || id > inner.head {
            return Err(StorageError::OutOfRange {
                tail: inner.tail,
                head: inner.head,
                requested: id,
            });
        }
        let (offset, len) = read_index_record(&mut inner.index, id - 1)?;
        let mut blob = vec![0u8; len as usize];
        inner.data.seek(SeekFrom::Start(offset))?;
        inner.data.read_exact(&mut blob)?;
        Ok(blob)
    }

    /// Drop all items with id greater than `new_head`, physically
    /// truncating the files. Returns the number of items removed.
    pub fn truncate_from_head(&self, new_head: u64) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        if new_head > inner.head || new_head < inner.tail {
            return Err(StorageError::OutOfRange {
                tail: inner.tail,
                head: inner.head,
                requested: new_head,
            });
        }
        if new_head == inner.head {
            return Ok(0);
        }
        let removed = inner.head - new_head;
        let data_len = if new_head == 0 {
            0
        } else {
            let (offset, len) = read_index_record(&mut inner.index, new_head - 1)?;
            offset + len
        };
        inner.index.set_len(new_head * INDEX_RECORD_SIZE)?;
        inner.data.set_len(data_len)?;
        inner.head = new_head;
        inner.data_len = data_len;
        debug!(new_head, removed, "Truncated freezer from head");
        Ok(removed)
    }

    /// Drop all items with id less than or equal to `new_tail` by
    /// advancing the persisted tail marker. Returns the number of
    /// items removed.
    pub fn truncate_from_tail(&self, new_tail: u64) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        if new_tail < inner.tail || new_tail > inner.head {
            return Err(StorageError::OutOfRange {
                tail: inner.tail,
                head: inner.head,
                requested: new_tail,
            });
        }
        if new_tail == inner.tail {
            return Ok(0);
        }
        let removed = new_tail - inner.tail;
        self.write_meta(new_tail)?;
        inner.tail = new_tail;
        debug!(new_tail, removed, "Truncated freezer from tail");
        Ok(removed)
    }

    /// Wipe the table back to the empty state.
    pub fn reset(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.data.set_len(0)?;
        inner.index.set_len(0)?;
        self.write_meta(0)?;
        inner.head = 0;
        inner.tail = 0;
        inner.data_len = 0;
        Ok(())
    }

    /// Flush data, index and directory metadata durably to disk.
    pub fn sync(&self) -> StorageResult<()> {
        let inner = self.inner.lock();
        inner.data.sync_data()?;
        inner.index.sync_data()?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Rewrite the meta file atomically: temp file, fsync, rename,
    /// directory fsync.
    fn write_meta(&self, tail: u64) -> StorageResult<()> {
        let tmp = self.dir.join(META_TMP_FILE);
        let mut file = File::create(&tmp)?;
        file.write_all(&tail.to_be_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, self.dir.join(META_FILE))?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

/// Read the `(offset, length)` index record at the given zero-based
/// position.
fn read_index_record(index: &mut File, pos: u64) -> StorageResult<(u64, u64)> {
    let mut record = [0u8; INDEX_RECORD_SIZE as usize];
    index.seek(SeekFrom::Start(pos * INDEX_RECORD_SIZE))?;
    index.read_exact(&mut record)?;
    let offset = u64::from_be_bytes(record[..8].try_into().expect("len checked"));
    let len = u64::from_be_bytes(record[8..].try_into().expect("len checked"));
    Ok((offset, len))
}
