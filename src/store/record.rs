//! Record types and their byte layout
//!
//! Every record is stored as:
//!
//! ```text
//! id (u32 LE) ‖ strings, each NUL-terminated ‖ scalars (LE) ‖ list blocks
//! ```
//!
//! Only `Channel` has list blocks. The first string always holds the
//! record's unique name where it has one, so a name scan can compare it
//! without decoding the whole value.

use super::StoreError;

/// Longest display name, login token or channel name
pub const MAX_NAME_LEN: usize = 20;

/// Store key for a primary id
///
/// Big-endian so the store's key order is numeric order.
pub fn id_key(id: u32) -> [u8; 4] {
    id.to_be_bytes()
}

/// Primary id of a store key
pub fn key_id(key: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = key.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A value that lives in an [`EntityStore`](super::EntityStore)
pub trait Record: Clone + Sized {
    /// Name used in logs
    const KIND: &'static str;

    /// Whether the first string field is unique across the store
    const UNIQUE_NAME: bool;

    fn id(&self) -> u32;

    fn set_id(&mut self, id: u32);

    /// The unique secondary key, for records that have one
    fn name(&self) -> &str;

    fn encode(&self) -> Result<Vec<u8>, StoreError>;

    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;
}

/// The first string field of an encoded record, without decoding the rest
pub fn encoded_name(bytes: &[u8]) -> Option<&[u8]> {
    let rest = bytes.get(4..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..end])
}

// =============================================================================
// Encoding helpers
// =============================================================================

struct Writer {
    buf: Vec<u8>,
    kind: &'static str,
}

impl Writer {
    fn new(kind: &'static str, id: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&id.to_le_bytes());
        Self { buf, kind }
    }

    fn string(&mut self, s: &str) -> Result<(), StoreError> {
        if s.as_bytes().contains(&0) {
            return Err(StoreError::Corrupt(format!(
                "{}: text field contains NUL",
                self.kind
            )));
        }
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Reader<'a> {
    fn new(kind: &'static str, bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            kind,
        }
    }

    fn corrupt(&self, what: &str) -> StoreError {
        StoreError::Corrupt(format!("{}: {} at byte {}", self.kind, what, self.pos))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| self.corrupt("value too short"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, StoreError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, StoreError> {
        let rest = &self.bytes[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.corrupt("unterminated string"))?;
        let text = std::str::from_utf8(&rest[..end])
            .map_err(|_| self.corrupt("invalid UTF-8"))?
            .to_string();
        self.pos += end + 1;
        Ok(text)
    }

    /// A block of `size` bytes holding NUL-terminated names
    fn names(&mut self, size: u32) -> Result<Vec<String>, StoreError> {
        let block = self.take(size as usize)?;
        if block.is_empty() {
            return Ok(Vec::new());
        }
        if block.last() != Some(&0) {
            return Err(self.corrupt("unterminated list block"));
        }
        block[..block.len() - 1]
            .split(|&b| b == 0)
            .map(|raw| {
                std::str::from_utf8(raw)
                    .map(str::to_string)
                    .map_err(|_| self.corrupt("invalid UTF-8 in list"))
            })
            .collect()
    }

    fn finish(self) -> Result<(), StoreError> {
        if self.pos != self.bytes.len() {
            return Err(self.corrupt("trailing bytes"));
        }
        Ok(())
    }
}

/// Concatenate names into one NUL-terminated block
fn name_block(kind: &'static str, names: &[String]) -> Result<Vec<u8>, StoreError> {
    let mut block = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
    for name in names {
        if name.is_empty() || name.as_bytes().contains(&0) {
            return Err(StoreError::Corrupt(format!(
                "{}: list entry is empty or contains NUL",
                kind
            )));
        }
        block.extend_from_slice(name.as_bytes());
        block.push(0);
    }
    Ok(block)
}

// =============================================================================
// User
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub display_name: String,
    /// 0 for a normal user, anything else is a global admin
    pub privilege_level: i32,
    pub online_status: i32,
}

impl User {
    pub fn new(display_name: &str) -> Self {
        Self {
            id: 0,
            display_name: display_name.to_string(),
            privilege_level: 0,
            online_status: 0,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.privilege_level != 0
    }

    pub fn is_online(&self) -> bool {
        self.online_status != 0
    }
}

impl Record for User {
    const KIND: &'static str = "user";
    const UNIQUE_NAME: bool = true;

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.display_name
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut w = Writer::new(Self::KIND, self.id);
        w.string(&self.display_name)?;
        w.i32(self.privilege_level);
        w.i32(self.online_status);
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(Self::KIND, bytes);
        let user = User {
            id: r.u32()?,
            display_name: r.string()?,
            privilege_level: r.i32()?,
            online_status: r.i32()?,
        };
        r.finish()?;
        Ok(user)
    }
}

// =============================================================================
// Auth
// =============================================================================

/// Login credentials; shares its id with the owning [`User`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub user_id: u32,
    pub login_token: String,
    /// Argon2id PHC string
    pub password_hash: String,
}

impl Record for Auth {
    const KIND: &'static str = "auth";
    const UNIQUE_NAME: bool = true;

    fn id(&self) -> u32 {
        self.user_id
    }

    fn set_id(&mut self, id: u32) {
        self.user_id = id;
    }

    fn name(&self) -> &str {
        &self.login_token
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut w = Writer::new(Self::KIND, self.user_id);
        w.string(&self.login_token)?;
        w.string(&self.password_hash)?;
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(Self::KIND, bytes);
        let auth = Auth {
            user_id: r.u32()?,
            login_token: r.string()?,
            password_hash: r.string()?,
        };
        r.finish()?;
        Ok(auth)
    }
}

// =============================================================================
// Channel
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: u32,
    pub channel_name: String,
    /// Display name of the user who created the channel
    pub creator: String,
    /// 0 public, 1 private
    pub publicity: i32,
    pub users: Vec<String>,
    pub administrators: Vec<String>,
    pub banned_users: Vec<String>,
}

impl Channel {
    /// A new channel whose creator is its first member and administrator
    pub fn new(channel_name: &str, creator: &str, publicity: i32) -> Self {
        Self {
            id: 0,
            channel_name: channel_name.to_string(),
            creator: creator.to_string(),
            publicity,
            users: vec![creator.to_string()],
            administrators: vec![creator.to_string()],
            banned_users: Vec::new(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.publicity != 0
    }

    pub fn is_member(&self, name: &str) -> bool {
        self.users.iter().any(|u| u == name)
    }

    pub fn is_admin(&self, name: &str) -> bool {
        self.administrators.iter().any(|u| u == name)
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.banned_users.iter().any(|u| u == name)
    }

    /// Whether `name` appears as creator or in any list
    pub fn mentions(&self, name: &str) -> bool {
        self.creator == name || self.is_member(name) || self.is_admin(name) || self.is_banned(name)
    }

    /// Replace every occurrence of `old` with `new`
    pub fn rename_member(&mut self, old: &str, new: &str) {
        if self.creator == old {
            self.creator = new.to_string();
        }
        for list in [&mut self.users, &mut self.administrators, &mut self.banned_users] {
            for entry in list.iter_mut().filter(|entry| *entry == old) {
                *entry = new.to_string();
            }
        }
    }

    /// Drop `name` from every list
    ///
    /// A forgotten creator is left blank: no display name is empty, so a
    /// later user can never claim the creator's rights.
    pub fn forget_member(&mut self, name: &str) {
        if self.creator == name {
            self.creator.clear();
        }
        for list in [&mut self.users, &mut self.administrators, &mut self.banned_users] {
            list.retain(|entry| entry != name);
        }
    }
}

impl Record for Channel {
    const KIND: &'static str = "channel";
    const UNIQUE_NAME: bool = true;

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.channel_name
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let users = name_block(Self::KIND, &self.users)?;
        let admins = name_block(Self::KIND, &self.administrators)?;
        let banned = name_block(Self::KIND, &self.banned_users)?;

        let mut w = Writer::new(Self::KIND, self.id);
        w.string(&self.channel_name)?;
        w.string(&self.creator)?;
        w.i32(self.publicity);
        w.u32(users.len() as u32);
        w.u32(admins.len() as u32);
        w.u32(banned.len() as u32);
        w.raw(&users);
        w.raw(&admins);
        w.raw(&banned);
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(Self::KIND, bytes);
        let id = r.u32()?;
        let channel_name = r.string()?;
        let creator = r.string()?;
        let publicity = r.i32()?;
        let users_size = r.u32()?;
        let admins_size = r.u32()?;
        let banned_size = r.u32()?;
        let channel = Channel {
            id,
            channel_name,
            creator,
            publicity,
            users: r.names(users_size)?,
            administrators: r.names(admins_size)?,
            banned_users: r.names(banned_size)?,
        };
        r.finish()?;
        Ok(channel)
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u32,
    pub user_id: u32,
    pub channel_id: u32,
    pub message_content: String,
    /// Seconds since the epoch as sent by the client; always > 0
    pub timestamp: i32,
}

impl Record for Message {
    const KIND: &'static str = "message";
    const UNIQUE_NAME: bool = false;

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    fn name(&self) -> &str {
        &self.message_content
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut w = Writer::new(Self::KIND, self.id);
        w.string(&self.message_content)?;
        w.u32(self.user_id);
        w.u32(self.channel_id);
        w.i32(self.timestamp);
        Ok(w.finish())
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut r = Reader::new(Self::KIND, bytes);
        let id = r.u32()?;
        let message_content = r.string()?;
        let message = Message {
            id,
            message_content,
            user_id: r.u32()?,
            channel_id: r.u32()?,
            timestamp: r.i32()?,
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<R: Record + PartialEq + std::fmt::Debug>(record: R) {
        let bytes = record.encode().unwrap();
        assert_eq!(R::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_user_layout() {
        let user = User {
            id: 7,
            display_name: "alice".into(),
            privilege_level: 1,
            online_status: 0,
        };
        let bytes = user.encode().unwrap();
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..10], b"alice\0");
        assert_eq!(&bytes[10..14], &1i32.to_le_bytes());
        assert_eq!(&bytes[14..], &0i32.to_le_bytes());
        round_trip(user);
    }

    #[test]
    fn test_auth_round_trip() {
        round_trip(Auth {
            user_id: 3,
            login_token: "tok1".into(),
            password_hash: "$argon2id$v=19$m=256,t=2,p=1$c2FsdA$aGFzaA".into(),
        });
    }

    #[test]
    fn test_channel_round_trip_with_lists() {
        let mut channel = Channel::new("general", "alice", 1);
        channel.id = 12;
        channel.users.push("bob".into());
        channel.users.push("zoë".into());
        channel.administrators.push("bob".into());
        channel.banned_users.push("mallory".into());
        round_trip(channel);
    }

    #[test]
    fn test_channel_empty_lists() {
        let channel = Channel {
            id: 1,
            channel_name: "empty".into(),
            creator: "ghost".into(),
            publicity: 0,
            users: vec![],
            administrators: vec![],
            banned_users: vec![],
        };
        round_trip(channel);
    }

    #[test]
    fn test_new_channel_creator_is_member_and_admin() {
        let channel = Channel::new("gen", "alice", 0);
        assert!(channel.is_member("alice"));
        assert!(channel.is_admin("alice"));
        assert!(!channel.is_banned("alice"));
        assert!(!channel.is_private());
    }

    #[test]
    fn test_channel_rename_and_forget_member() {
        let mut channel = Channel::new("gen", "alice", 0);
        channel.users.push("bob".into());
        channel.banned_users.push("carol".into());
        assert!(channel.mentions("carol"));
        assert!(!channel.mentions("dave"));

        channel.rename_member("alice", "alicia");
        assert_eq!(channel.creator, "alicia");
        assert_eq!(channel.users, vec!["alicia", "bob"]);
        assert_eq!(channel.administrators, vec!["alicia"]);

        channel.forget_member("alicia");
        channel.forget_member("carol");
        assert_eq!(channel.creator, "");
        assert_eq!(channel.users, vec!["bob"]);
        assert!(channel.administrators.is_empty());
        assert!(channel.banned_users.is_empty());
        assert!(!channel.mentions("alicia"));
    }

    #[test]
    fn test_message_round_trip() {
        round_trip(Message {
            id: 99,
            user_id: 4,
            channel_id: 2,
            message_content: "hello, world".into(),
            timestamp: 0x6500_0000,
        });
    }

    #[test]
    fn test_encoded_name_is_first_string() {
        let user = User::new("carol");
        assert_eq!(encoded_name(&user.encode().unwrap()), Some(&b"carol"[..]));
        let channel = Channel::new("ops", "dave", 0);
        assert_eq!(encoded_name(&channel.encode().unwrap()), Some(&b"ops"[..]));
        assert_eq!(encoded_name(b"\x01\x00"), None);
    }

    #[test]
    fn test_nul_in_field_is_rejected() {
        let user = User::new("bad\0name");
        assert!(matches!(user.encode(), Err(StoreError::Corrupt(_))));
        let mut channel = Channel::new("ok", "alice", 0);
        channel.users.push(String::new());
        assert!(matches!(channel.encode(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_decode_rejects_damage() {
        let bytes = User::new("alice").encode().unwrap();
        assert!(User::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(User::decode(&longer).is_err());
        assert!(User::decode(b"\x01\x00\x00\x00noterm").is_err());
    }

    #[test]
    fn test_id_key_orders_numerically() {
        assert!(id_key(2) < id_key(10));
        assert!(id_key(255) < id_key(256));
        assert_eq!(key_id(&id_key(4242)), Some(4242));
        assert_eq!(key_id(b"abc"), None);
    }
}
