//! Semaphore-guarded flat-file stores
//!
//! Five stores live in the data directory, one file and one named semaphore
//! each. Every operation takes the store's semaphore, opens the file, does
//! its work, closes the file and releases the semaphore, so any number of
//! worker processes can share them.

pub mod entity;
pub mod flatfile;
pub mod record;
pub mod session;

pub use entity::{Created, EntityStore, Locked};
pub use record::{Auth, Channel, Message, Record, User};
pub use session::{AddrKey, Bind, SessionStore};

use crate::error::SysError;
use crate::server::sem::NamedSemaphore;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const USERS_FILE: &str = "users.db";
pub const CHANNELS_FILE: &str = "channels.db";
pub const MESSAGES_FILE: &str = "messages.db";
pub const AUTH_FILE: &str = "auth.db";
pub const SESSIONS_FILE: &str = "sessions.db";

/// Storage failures; the router answers these with a 500
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Sys(#[from] SysError),
}

impl StoreError {
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a keyed lookup that ran to completion
///
/// Paired with `Result<_, StoreError>` this gives the three outcomes
/// callers need to tell apart: found, not found, and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

/// Semaphore names for one server instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSemaphores {
    pub users: String,
    pub channels: String,
    pub messages: String,
    pub auth: String,
    pub sessions: String,
}

impl StoreSemaphores {
    pub fn for_instance(instance: &str) -> Self {
        Self {
            users: format!("/{}_u", instance),
            channels: format!("/{}_ch", instance),
            messages: format!("/{}_m", instance),
            auth: format!("/{}_au", instance),
            sessions: format!("/{}_ad", instance),
        }
    }

    fn all(&self) -> [&str; 5] {
        [
            &self.users,
            &self.channels,
            &self.messages,
            &self.auth,
            &self.sessions,
        ]
    }
}

/// Every store the router works against
#[derive(Debug)]
pub struct Stores {
    pub users: EntityStore<User>,
    pub channels: EntityStore<Channel>,
    pub messages: EntityStore<Message>,
    pub auth: EntityStore<Auth>,
    pub sessions: SessionStore,
}

impl Stores {
    /// Create fresh semaphores for `instance` and bind the stores under `data_dir`
    pub fn create(data_dir: &Path, instance: &str, sync_writes: bool) -> Result<Self, StoreError> {
        let names = StoreSemaphores::for_instance(instance);
        let stores = Self {
            users: EntityStore::new(
                data_dir.join(USERS_FILE),
                NamedSemaphore::create(&names.users, 1)?,
                sync_writes,
            ),
            channels: EntityStore::new(
                data_dir.join(CHANNELS_FILE),
                NamedSemaphore::create(&names.channels, 1)?,
                sync_writes,
            ),
            messages: EntityStore::new(
                data_dir.join(MESSAGES_FILE),
                NamedSemaphore::create(&names.messages, 1)?,
                sync_writes,
            ),
            auth: EntityStore::new(
                data_dir.join(AUTH_FILE),
                NamedSemaphore::create(&names.auth, 1)?,
                sync_writes,
            ),
            sessions: SessionStore::new(
                data_dir.join(SESSIONS_FILE),
                NamedSemaphore::create(&names.sessions, 1)?,
                sync_writes,
            ),
        };
        debug!(dir = %data_dir.display(), instance, "stores ready");
        Ok(stores)
    }

    /// Attach to the semaphores another process already created
    pub fn open(data_dir: &Path, instance: &str, sync_writes: bool) -> Result<Self, StoreError> {
        let names = StoreSemaphores::for_instance(instance);
        Ok(Self {
            users: EntityStore::new(
                data_dir.join(USERS_FILE),
                NamedSemaphore::open(&names.users)?,
                sync_writes,
            ),
            channels: EntityStore::new(
                data_dir.join(CHANNELS_FILE),
                NamedSemaphore::open(&names.channels)?,
                sync_writes,
            ),
            messages: EntityStore::new(
                data_dir.join(MESSAGES_FILE),
                NamedSemaphore::open(&names.messages)?,
                sync_writes,
            ),
            auth: EntityStore::new(
                data_dir.join(AUTH_FILE),
                NamedSemaphore::open(&names.auth)?,
                sync_writes,
            ),
            sessions: SessionStore::new(
                data_dir.join(SESSIONS_FILE),
                NamedSemaphore::open(&names.sessions)?,
                sync_writes,
            ),
        })
    }

    /// Remove the semaphore names; handles stay usable until dropped
    pub fn unlink(&self) {
        let sems = [
            self.users.semaphore(),
            self.channels.semaphore(),
            self.messages.semaphore(),
            self.auth.semaphore(),
            self.sessions.semaphore(),
        ];
        for sem in sems {
            if let Err(e) = sem.unlink() {
                warn!(semaphore = sem.name(), error = %e, "failed to unlink store semaphore");
            }
        }
    }

    /// Semaphore names in the order `create` makes them
    pub fn semaphore_names(instance: &str) -> Vec<String> {
        StoreSemaphores::for_instance(instance)
            .all()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestStores;
    use super::*;

    #[test]
    fn test_semaphore_names() {
        let names = StoreSemaphores::for_instance("chatd42");
        assert_eq!(names.users, "/chatd42_u");
        assert_eq!(names.channels, "/chatd42_ch");
        assert_eq!(names.messages, "/chatd42_m");
        assert_eq!(names.auth, "/chatd42_au");
        assert_eq!(names.sessions, "/chatd42_ad");
        assert_eq!(Stores::semaphore_names("x").len(), 5);
    }

    #[test]
    fn test_lookup_helpers() {
        let found: Lookup<u32> = Some(7).into();
        assert!(found.is_found());
        assert_eq!(found.clone().map(|v| v * 2), Lookup::Found(14));
        assert_eq!(found.found(), Some(7));
        let missing: Lookup<u32> = None.into();
        assert_eq!(missing.found(), None);
    }

    #[test]
    fn test_open_attaches_to_created_semaphores() {
        let t = TestStores::new();
        let other = Stores::open(t.dir.path(), &t.instance, false).unwrap();
        other
            .users
            .create(User::new("alice"))
            .unwrap();
        assert!(t.stores.users.find_by_name("alice").unwrap().is_found());
    }

    #[test]
    fn test_open_without_create_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Stores::open(dir.path(), "chatd_never_created_instance", false).unwrap_err();
        assert!(matches!(err, StoreError::Sys(_)));
    }
}
