//! Address-identity store
//!
//! Maps a client's socket address to the id of the user logged in over it.
//! Keys are the raw IPv4 octets followed by the port in network order; each
//! value repeats the key and appends the user id.

use super::flatfile::{FlatFile, Insert};
use super::{Lookup, StoreError};
use crate::server::sem::NamedSemaphore;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Key width: 4 address bytes + 2 port bytes
pub const ADDR_KEY_LEN: usize = 6;

const VALUE_LEN: usize = ADDR_KEY_LEN + 4;

/// Fixed-width binary form of a peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrKey([u8; ADDR_KEY_LEN]);

impl AddrKey {
    pub fn new(addr: SocketAddrV4) -> Self {
        let mut key = [0u8; ADDR_KEY_LEN];
        key[..4].copy_from_slice(&addr.ip().octets());
        key[4..].copy_from_slice(&addr.port().to_be_bytes());
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn addr(&self) -> SocketAddrV4 {
        let k = self.0;
        SocketAddrV4::new(
            Ipv4Addr::new(k[0], k[1], k[2], k[3]),
            u16::from_be_bytes([k[4], k[5]]),
        )
    }
}

impl From<SocketAddrV4> for AddrKey {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(addr)
    }
}

impl fmt::Display for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr().fmt(f)
    }
}

fn encode_pair(key: AddrKey, user_id: u32) -> [u8; VALUE_LEN] {
    let mut value = [0u8; VALUE_LEN];
    value[..ADDR_KEY_LEN].copy_from_slice(key.as_bytes());
    value[ADDR_KEY_LEN..].copy_from_slice(&user_id.to_le_bytes());
    value
}

fn decode_user(value: &[u8]) -> Result<u32, StoreError> {
    let raw: [u8; 4] = value
        .get(ADDR_KEY_LEN..VALUE_LEN)
        .and_then(|b| b.try_into().ok())
        .filter(|_| value.len() == VALUE_LEN)
        .ok_or_else(|| StoreError::Corrupt(format!("session value of {} bytes", value.len())))?;
    Ok(u32::from_le_bytes(raw))
}

/// How a login was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bind {
    /// A fresh pair was stored
    Inserted,
    /// Earlier pairs of this user were dropped first
    Replaced { evicted: usize },
    /// The address was bound to another identity, which was overwritten
    Overwrote { previous: u32 },
}

/// Semaphore-guarded address → user id store
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    sem: NamedSemaphore,
    sync_writes: bool,
}

impl SessionStore {
    pub fn new(path: PathBuf, sem: NamedSemaphore, sync_writes: bool) -> Self {
        Self {
            path,
            sem,
            sync_writes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn semaphore(&self) -> &NamedSemaphore {
        &self.sem
    }

    fn with<T>(&self, op: impl FnOnce(&mut FlatFile) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let _guard = self.sem.lock()?;
        let mut file = FlatFile::open(&self.path, self.sync_writes)?;
        let out = op(&mut file)?;
        file.close()?;
        Ok(out)
    }

    /// Record that `user_id` is logged in from `addr`
    ///
    /// A user that is not yet online gets a plain insert. A user already
    /// online elsewhere loses every earlier pair first: the last login wins
    /// and the old connection becomes anonymous.
    pub fn bind(&self, addr: SocketAddrV4, user_id: u32, already_online: bool) -> Result<Bind, StoreError> {
        let key = AddrKey::new(addr);
        let value = encode_pair(key, user_id);
        self.with(|file| {
            if already_online {
                let evicted = remove_user(file, user_id)?;
                file.replace(key.as_bytes(), &value)?;
                debug!(user_id, %key, evicted, "session rebound");
                return Ok(Bind::Replaced { evicted });
            }
            match file.insert(key.as_bytes(), &value)? {
                Insert::Inserted => {
                    debug!(user_id, %key, "session bound");
                    Ok(Bind::Inserted)
                }
                Insert::KeyExists => {
                    let previous = file
                        .fetch(key.as_bytes())
                        .map(decode_user)
                        .transpose()?
                        .unwrap_or(0);
                    warn!(user_id, previous, %key, "address already bound, replacing stale session");
                    file.replace(key.as_bytes(), &value)?;
                    Ok(Bind::Overwrote { previous })
                }
            }
        })
    }

    /// The user logged in from `addr`
    pub fn lookup(&self, addr: SocketAddrV4) -> Result<Lookup<u32>, StoreError> {
        let key = AddrKey::new(addr);
        self.with(|file| match file.fetch(key.as_bytes()) {
            Some(value) => decode_user(value).map(Lookup::Found),
            None => Ok(Lookup::NotFound),
        })
    }

    /// Forget `addr`; returns the user that was bound to it
    pub fn unbind(&self, addr: SocketAddrV4) -> Result<Option<u32>, StoreError> {
        let key = AddrKey::new(addr);
        self.with(|file| {
            let user = file.fetch(key.as_bytes()).map(decode_user).transpose()?;
            file.delete(key.as_bytes())?;
            Ok(user)
        })
    }

    /// Forget every address of `user_id`
    pub fn unbind_user(&self, user_id: u32) -> Result<usize, StoreError> {
        self.with(|file| remove_user(file, user_id))
    }

    /// Whether any address is still bound to `user_id`
    pub fn is_bound(&self, user_id: u32) -> Result<bool, StoreError> {
        self.with(|file| {
            for (_, value) in file.iter() {
                if decode_user(value)? == user_id {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Drop every pair; returns how many there were
    pub fn clear(&self) -> Result<usize, StoreError> {
        self.with(|file| {
            let keys: Vec<Vec<u8>> = file.iter().map(|(key, _)| key.to_vec()).collect();
            for key in &keys {
                file.delete(key)?;
            }
            Ok(keys.len())
        })
    }

    /// Every live pair, in key order
    pub fn pairs(&self) -> Result<Vec<(AddrKey, u32)>, StoreError> {
        self.with(|file| {
            file.iter()
                .map(|(key, value)| {
                    let key = AddrKey::from_bytes(key)
                        .ok_or_else(|| StoreError::Corrupt(format!("session key of {} bytes", key.len())))?;
                    Ok((key, decode_user(value)?))
                })
                .collect()
        })
    }
}

fn remove_user(file: &mut FlatFile, user_id: u32) -> Result<usize, StoreError> {
    let mut doomed = Vec::new();
    for (key, value) in file.iter() {
        if decode_user(value)? == user_id {
            doomed.push(key.to_vec());
        }
    }
    for key in &doomed {
        file.delete(key)?;
    }
    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::TestStores;

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    #[test]
    fn test_key_layout() {
        let key = AddrKey::new(addr(7, 0x1f90));
        assert_eq!(key.as_bytes(), &[10, 0, 0, 7, 0x1f, 0x90]);
        assert_eq!(key.addr(), addr(7, 0x1f90));
        assert_eq!(key.to_string(), "10.0.0.7:8080");
        assert_eq!(encode_pair(key, 3)[ADDR_KEY_LEN..], 3u32.to_le_bytes());
    }

    #[test]
    fn test_lookup_unknown_address() {
        let t = TestStores::new();
        assert_eq!(t.stores.sessions.lookup(addr(1, 1000)).unwrap(), Lookup::NotFound);
        assert_eq!(t.stores.sessions.unbind(addr(1, 1000)).unwrap(), None);
    }

    #[test]
    fn test_bind_then_lookup_and_unbind() {
        let t = TestStores::new();
        let s = &t.stores.sessions;
        assert_eq!(s.bind(addr(1, 1000), 4, false).unwrap(), Bind::Inserted);
        assert_eq!(s.lookup(addr(1, 1000)).unwrap(), Lookup::Found(4));
        assert_eq!(s.lookup(addr(1, 1001)).unwrap(), Lookup::NotFound);
        assert_eq!(s.unbind(addr(1, 1000)).unwrap(), Some(4));
        assert_eq!(s.lookup(addr(1, 1000)).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn test_relogin_evicts_old_address() {
        let t = TestStores::new();
        let s = &t.stores.sessions;
        s.bind(addr(1, 1000), 4, false).unwrap();
        s.bind(addr(2, 2000), 5, false).unwrap();
        assert_eq!(
            s.bind(addr(3, 3000), 4, true).unwrap(),
            Bind::Replaced { evicted: 1 }
        );
        assert_eq!(s.lookup(addr(1, 1000)).unwrap(), Lookup::NotFound);
        assert_eq!(s.lookup(addr(3, 3000)).unwrap(), Lookup::Found(4));
        assert_eq!(s.lookup(addr(2, 2000)).unwrap(), Lookup::Found(5));
    }

    #[test]
    fn test_stale_address_is_overwritten() {
        let t = TestStores::new();
        let s = &t.stores.sessions;
        s.bind(addr(1, 1000), 4, false).unwrap();
        assert_eq!(
            s.bind(addr(1, 1000), 9, false).unwrap(),
            Bind::Overwrote { previous: 4 }
        );
        assert_eq!(s.lookup(addr(1, 1000)).unwrap(), Lookup::Found(9));
    }

    #[test]
    fn test_unbind_user_removes_all_pairs() {
        let t = TestStores::new();
        let s = &t.stores.sessions;
        s.bind(addr(1, 1000), 4, false).unwrap();
        s.bind(addr(1, 1001), 4, false).unwrap();
        s.bind(addr(1, 1002), 6, false).unwrap();
        assert_eq!(s.unbind_user(4).unwrap(), 2);
        let pairs = s.pairs().unwrap();
        assert_eq!(pairs, vec![(AddrKey::new(addr(1, 1002)), 6)]);
    }

    #[test]
    fn test_is_bound_and_clear() {
        let t = TestStores::new();
        let s = &t.stores.sessions;
        assert!(!s.is_bound(4).unwrap());
        s.bind(addr(1, 1000), 4, false).unwrap();
        s.bind(addr(1, 1001), 6, false).unwrap();
        assert!(s.is_bound(4).unwrap());
        assert_eq!(s.clear().unwrap(), 2);
        assert!(!s.is_bound(4).unwrap());
        assert!(s.pairs().unwrap().is_empty());
        assert_eq!(s.clear().unwrap(), 0);
    }
}
