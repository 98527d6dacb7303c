//! Semaphore-guarded store for one record type
//!
//! Each call runs `acquire → open → operate → close → release`. The
//! semaphore is held by a guard inside [`Locked`], so it is released on every
//! exit path, including errors and panics. Callers that need several steps
//! in one critical section (check then insert) take a [`Locked`] directly.

use super::flatfile::{FlatFile, Insert};
use super::record::{encoded_name, id_key, key_id, Message, Record};
use super::{Lookup, StoreError};
use crate::server::sem::{NamedSemaphore, SemGuard};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Outcome of a create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created<R> {
    /// Stored under a freshly allocated id
    Inserted(R),
    /// The unique name is already taken; nothing was written
    Duplicate,
    /// The primary id is already taken; nothing was written
    DuplicateId,
}

/// A store file plus the semaphore that serializes access to it
#[derive(Debug)]
pub struct EntityStore<R> {
    path: PathBuf,
    sem: NamedSemaphore,
    sync_writes: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> EntityStore<R> {
    pub fn new(path: PathBuf, sem: NamedSemaphore, sync_writes: bool) -> Self {
        Self {
            path,
            sem,
            sync_writes,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn semaphore(&self) -> &NamedSemaphore {
        &self.sem
    }

    /// Enter the critical section and open the file
    pub fn lock(&self) -> Result<Locked<'_, R>, StoreError> {
        let guard = self.sem.lock()?;
        trace!(kind = R::KIND, "store locked");
        let file = FlatFile::open(&self.path, self.sync_writes)?;
        Ok(Locked {
            file,
            _guard: guard,
            _record: PhantomData,
        })
    }

    /// Run `op` inside one critical section, closing the file afterwards
    fn with<T>(&self, op: impl FnOnce(&mut Locked<'_, R>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut locked = self.lock()?;
        let out = op(&mut locked)?;
        locked.close()?;
        Ok(out)
    }

    /// Insert `record` under a new id unless its unique name is taken
    pub fn create(&self, record: R) -> Result<Created<R>, StoreError> {
        self.with(|l| l.create(record))
    }

    /// Linear scan comparing each record's unique name byte-for-byte
    pub fn find_by_name(&self, name: &str) -> Result<Lookup<R>, StoreError> {
        self.with(|l| l.find_by_name(name))
    }

    pub fn read(&self, id: u32) -> Result<Lookup<R>, StoreError> {
        self.with(|l| l.read(id))
    }

    /// Overwrite the record stored under `record.id()`
    ///
    /// No uniqueness check is made on the name.
    pub fn update(&self, record: &R) -> Result<(), StoreError> {
        self.with(|l| l.update(record))
    }

    /// Remove by id; returns whether a record was present
    pub fn delete(&self, id: u32) -> Result<bool, StoreError> {
        self.with(|l| l.delete(id))
    }

    /// Every record matching `filter`, in id order
    pub fn scan(&self, filter: impl FnMut(&R) -> bool) -> Result<Vec<R>, StoreError> {
        self.with(|l| l.scan(filter))
    }
}

impl EntityStore<Message> {
    /// Up to `count` messages of `channel_id`, newest first
    pub fn recent(&self, channel_id: u32, count: usize) -> Result<Vec<Message>, StoreError> {
        self.with(|l| {
            let mut out = Vec::with_capacity(count.min(64));
            for (_, value) in l.file().iter().rev() {
                if out.len() == count {
                    break;
                }
                let message = Message::decode(value)?;
                if message.channel_id == channel_id {
                    out.push(message);
                }
            }
            Ok(out)
        })
    }

    /// Remove every message posted to `channel_id`
    pub fn delete_channel(&self, channel_id: u32) -> Result<usize, StoreError> {
        self.with(|l| {
            let doomed: Vec<u32> = l
                .scan(|m: &Message| m.channel_id == channel_id)?
                .iter()
                .map(|m| m.id)
                .collect();
            for id in &doomed {
                l.delete(*id)?;
            }
            Ok(doomed.len())
        })
    }
}

/// An open store inside its critical section
///
/// The file is declared before the guard, so it is closed before the
/// semaphore is released when this drops.
pub struct Locked<'a, R> {
    file: FlatFile,
    _guard: SemGuard<'a>,
    _record: PhantomData<fn() -> R>,
}

impl<'a, R: Record> Locked<'a, R> {
    fn file(&self) -> &FlatFile {
        &self.file
    }

    fn file_mut(&mut self) -> &mut FlatFile {
        &mut self.file
    }

    pub fn find_by_name(&self, name: &str) -> Result<Lookup<R>, StoreError> {
        let file = self.file();
        let mut cursor = file.first();
        while let Some((key, value)) = cursor {
            match encoded_name(value) {
                Some(found) if found == name.as_bytes() => {
                    return R::decode(value).map(Lookup::Found);
                }
                Some(_) => {}
                None => {
                    return Err(StoreError::Corrupt(format!(
                        "{}: record {:?} has no name field",
                        R::KIND,
                        key_id(key)
                    )))
                }
            }
            cursor = file.next(key);
        }
        Ok(Lookup::NotFound)
    }

    pub fn read(&self, id: u32) -> Result<Lookup<R>, StoreError> {
        match self.file().fetch(&id_key(id)) {
            Some(value) => R::decode(value).map(Lookup::Found),
            None => Ok(Lookup::NotFound),
        }
    }

    /// Name check, id allocation and insert in one step
    pub fn create(&mut self, mut record: R) -> Result<Created<R>, StoreError> {
        if R::UNIQUE_NAME && self.find_by_name(record.name())?.is_found() {
            debug!(kind = R::KIND, name = record.name(), "duplicate name");
            return Ok(Created::Duplicate);
        }
        let floor = self
            .file()
            .iter()
            .next_back()
            .and_then(|(key, _)| key_id(key))
            .unwrap_or(0);
        let id = self.file_mut().allocate_id(floor)?;
        record.set_id(id);
        self.insert(record)
    }

    /// Insert under the record's own id
    pub fn insert(&mut self, record: R) -> Result<Created<R>, StoreError> {
        let value = record.encode()?;
        match self.file_mut().insert(&id_key(record.id()), &value)? {
            Insert::Inserted => {
                debug!(kind = R::KIND, id = record.id(), "record created");
                Ok(Created::Inserted(record))
            }
            Insert::KeyExists => {
                warn!(kind = R::KIND, id = record.id(), "primary id already in use");
                Ok(Created::DuplicateId)
            }
        }
    }

    pub fn update(&mut self, record: &R) -> Result<(), StoreError> {
        let value = record.encode()?;
        self.file_mut().replace(&id_key(record.id()), &value)?;
        trace!(kind = R::KIND, id = record.id(), "record updated");
        Ok(())
    }

    pub fn delete(&mut self, id: u32) -> Result<bool, StoreError> {
        let removed = self.file_mut().delete(&id_key(id))?;
        trace!(kind = R::KIND, id, removed, "record deleted");
        Ok(removed)
    }

    pub fn scan(&self, mut filter: impl FnMut(&R) -> bool) -> Result<Vec<R>, StoreError> {
        let mut out = Vec::new();
        for (_, value) in self.file().iter() {
            let record = R::decode(value)?;
            if filter(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Close the file (compacting if due), then release the semaphore
    pub fn close(self) -> Result<(), StoreError> {
        let Locked { file, _guard, .. } = self;
        file.close()
    }
}
