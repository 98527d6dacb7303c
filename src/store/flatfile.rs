//! Log-structured flat-file key/value store
//!
//! ```text
//! ┌──────────┬─────────┬──────────────────────────────────────────┐
//! │  "CHDB"  │ version │ entries...                               │
//! │ 4 bytes  │ 1 byte  │ [u32 LE length][bincode LogEntry] ...    │
//! └──────────┴─────────┴──────────────────────────────────────────┘
//! ```
//!
//! Opening replays the log into an ordered index. Writes append one entry.
//! A torn final entry (a crash mid-append) is dropped and the file is cut
//! back to the last complete entry. When superseded entries outnumber live
//! ones the file is rewritten on close.
//!
//! A `FlatFile` does no locking of its own. Callers hold the store's
//! semaphore from `open` to `close`.

use super::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"CHDB";
const FORMAT_VERSION: u8 = 1;
const FILE_HEADER_LEN: u64 = 5;

/// Largest single log entry accepted when replaying
const MAX_ENTRY_SIZE: u32 = 1024 * 1024;

/// Superseded entries tolerated before compaction is considered
const COMPACT_FLOOR: usize = 64;

/// One appended log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum LogEntry {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Last id handed out by `allocate_id`
    Sequence(u32),
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    KeyExists,
}

/// An open store file
#[derive(Debug)]
pub struct FlatFile {
    path: PathBuf,
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    sequence: u32,
    /// Entries in the file that no longer describe live state
    dead: usize,
    sync_writes: bool,
}

impl FlatFile {
    /// Open (creating if needed) the store at `path`
    pub fn open(path: &Path, sync_writes: bool) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io("open", path, e))?;

        let len = file
            .metadata()
            .map_err(|e| StoreError::io("stat", path, e))?
            .len();

        if len == 0 {
            let mut header = Vec::with_capacity(FILE_HEADER_LEN as usize);
            header.extend_from_slice(MAGIC);
            header.push(FORMAT_VERSION);
            file.write_all(&header)
                .map_err(|e| StoreError::io("write", path, e))?;
            if sync_writes {
                file.sync_data().map_err(|e| StoreError::io("sync", path, e))?;
            }
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                index: BTreeMap::new(),
                sequence: 0,
                dead: 0,
                sync_writes,
            });
        }

        let mut bytes = Vec::with_capacity(len as usize);
        file.read_to_end(&mut bytes)
            .map_err(|e| StoreError::io("read", path, e))?;

        if bytes.len() < FILE_HEADER_LEN as usize || &bytes[..4] != MAGIC {
            return Err(StoreError::Corrupt(format!(
                "{}: not a chatd store file",
                path.display()
            )));
        }
        if bytes[4] != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "{}: unsupported format version {}",
                path.display(),
                bytes[4]
            )));
        }

        let mut store = Self {
            path: path.to_path_buf(),
            file,
            index: BTreeMap::new(),
            sequence: 0,
            dead: 0,
            sync_writes,
        };

        let good_len = store.replay(&bytes)?;
        if good_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - good_len,
                "dropping torn tail of store log"
            );
            store
                .file
                .set_len(good_len as u64)
                .map_err(|e| StoreError::io("truncate", path, e))?;
        }
        store
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| StoreError::io("seek", path, e))?;

        Ok(store)
    }

    /// Apply every complete entry; returns the length of the good prefix
    fn replay(&mut self, bytes: &[u8]) -> Result<usize, StoreError> {
        let mut pos = FILE_HEADER_LEN as usize;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
            if len > MAX_ENTRY_SIZE {
                return Err(StoreError::Corrupt(format!(
                    "{}: entry of {} bytes at offset {}",
                    self.path.display(),
                    len,
                    pos
                )));
            }
            let start = pos + 4;
            let end = start + len as usize;
            if end > bytes.len() {
                break;
            }
            let entry: LogEntry = match bincode::deserialize(&bytes[start..end]) {
                Ok(entry) => entry,
                // Only the last entry may be torn; anything earlier is damage
                Err(_) if end == bytes.len() => break,
                Err(e) => {
                    return Err(StoreError::Corrupt(format!(
                        "{}: bad entry at offset {}: {}",
                        self.path.display(),
                        pos,
                        e
                    )))
                }
            };
            self.apply(entry);
            pos = end;
        }
        Ok(pos)
    }

    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Put { key, value } => {
                if self.index.insert(key, value).is_some() {
                    self.dead += 1;
                }
            }
            LogEntry::Delete { key } => {
                // The delete entry itself and the put it cancels are both dead
                self.dead += if self.index.remove(&key).is_some() { 2 } else { 1 };
            }
            LogEntry::Sequence(seq) => {
                if self.sequence != 0 {
                    self.dead += 1;
                }
                self.sequence = self.sequence.max(seq);
            }
        }
    }

    fn append(&mut self, entry: &LogEntry) -> Result<(), StoreError> {
        let payload = bincode::serialize(entry)
            .map_err(|e| StoreError::Corrupt(format!("encode log entry: {}", e)))?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        self.file
            .write_all(&frame)
            .map_err(|e| StoreError::io("write", &self.path, e))?;
        if self.sync_writes {
            self.file
                .sync_data()
                .map_err(|e| StoreError::io("sync", &self.path, e))?;
        }
        Ok(())
    }

    /// Insert a new key; an existing key is left untouched
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Insert, StoreError> {
        if self.index.contains_key(key) {
            return Ok(Insert::KeyExists);
        }
        let entry = LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.append(&entry)?;
        self.apply(entry);
        Ok(Insert::Inserted)
    }

    /// Insert or overwrite
    pub fn replace(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let entry = LogEntry::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.append(&entry)?;
        self.apply(entry);
        Ok(())
    }

    pub fn fetch(&self, key: &[u8]) -> Option<&[u8]> {
        self.index.get(key).map(Vec::as_slice)
    }

    /// Remove a key; removing an absent key is not an error
    ///
    /// Returns whether the key was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        if !self.index.contains_key(key) {
            return Ok(false);
        }
        let entry = LogEntry::Delete { key: key.to_vec() };
        self.append(&entry)?;
        self.apply(entry);
        Ok(true)
    }

    /// Smallest key
    pub fn first(&self) -> Option<(&[u8], &[u8])> {
        self.index
            .iter()
            .next()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Key following `after` in key order
    pub fn next(&self, after: &[u8]) -> Option<(&[u8], &[u8])> {
        self.index
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Every record in key order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&[u8], &[u8])> {
        self.index.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Hand out the next id of this store and persist it
    ///
    /// `floor` is the largest id already present as a key, so a store whose
    /// sequence entry was lost never reissues a live id.
    pub fn allocate_id(&mut self, floor: u32) -> Result<u32, StoreError> {
        let next = self
            .sequence
            .max(floor)
            .checked_add(1)
            .ok_or_else(|| StoreError::Corrupt(format!("{}: id space exhausted", self.path.display())))?;
        let entry = LogEntry::Sequence(next);
        self.append(&entry)?;
        self.apply(entry);
        Ok(next)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    fn needs_compaction(&self) -> bool {
        self.dead > COMPACT_FLOOR && self.dead > self.index.len()
    }

    /// Rewrite the file with only live state
    pub fn compact(&mut self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("compact");
        {
            let file = File::create(&tmp).map_err(|e| StoreError::io("create", &tmp, e))?;
            let mut out = BufWriter::new(file);
            out.write_all(MAGIC)
                .and_then(|_| out.write_all(&[FORMAT_VERSION]))
                .map_err(|e| StoreError::io("write", &tmp, e))?;

            let mut write = |entry: &LogEntry| -> Result<(), StoreError> {
                let payload = bincode::serialize(entry)
                    .map_err(|e| StoreError::Corrupt(format!("encode log entry: {}", e)))?;
                out.write_all(&(payload.len() as u32).to_le_bytes())
                    .and_then(|_| out.write_all(&payload))
                    .map_err(|e| StoreError::io("write", &tmp, e))
            };

            for (key, value) in &self.index {
                write(&LogEntry::Put {
                    key: key.clone(),
                    value: value.clone(),
                })?;
            }
            if self.sequence != 0 {
                write(&LogEntry::Sequence(self.sequence))?;
            }
            drop(write);

            let file = out
                .into_inner()
                .map_err(|e| StoreError::io("flush", &tmp, e.into_error()))?;
            if self.sync_writes {
                file.sync_all().map_err(|e| StoreError::io("sync", &tmp, e))?;
            }
        }

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io("rename", &self.path, e))?;
        self.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io("open", &self.path, e))?;

        debug!(path = %self.path.display(), live = self.index.len(), dropped = self.dead, "compacted store");
        self.dead = 0;
        Ok(())
    }

    /// Finish with the store, compacting if worthwhile
    pub fn close(mut self) -> Result<(), StoreError> {
        if self.needs_compaction() {
            self.compact()?;
        }
        Ok(())
    }
}
