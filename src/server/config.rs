//! Server configuration
//!
//! Settings are layered, later layers winning:
//! 1. built-in defaults
//! 2. an rc file of `KEY=VALUE` lines (`export ` prefix and quotes allowed)
//! 3. the same keys in the process environment
//! 4. command-line flags (applied by the binary)
//!
//! Recognised keys:
//! - CHATD_IP, CHATD_PORT
//! - CHATD_WORKERS, CHATD_MAX_CONNECTIONS
//! - CHATD_DATA_DIR, CHATD_INSTANCE
//! - CHATD_MAX_BODY, CHATD_READ_TIMEOUT_MS, CHATD_SHUTDOWN_TIMEOUT_MS
//! - CHATD_SYNC_WRITES, CHATD_HASH_COST

use crate::server::protocol::{DEFAULT_BODY_LIMIT, MAX_BODY_SIZE};
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of worker processes
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Default number of client slots in the listener's poll set
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

pub const DEFAULT_PORT: u16 = 9090;

/// Argon2 memory cost in KiB (the OWASP minimum for Argon2id)
pub const DEFAULT_HASH_COST: u32 = 19 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{0}")]
    Rejected(String),

    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Complete server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub ip: Ipv4Addr,
    /// 0 binds an ephemeral port
    pub port: u16,
    /// Trace-level logging
    pub trace: bool,
    pub pool_size: usize,
    pub max_connections: usize,
    pub data_dir: PathBuf,
    /// Prefix of the named semaphores; unique per running server
    pub instance: String,
    /// Ceiling on incoming dispatch bodies
    pub max_body_size: usize,
    /// How long a worker waits for a frame on a handed-off connection
    pub read_timeout: Duration,
    /// How often blocked semaphore waits recheck the shutdown flag
    pub worker_wait: Duration,
    /// Grace period for workers after SIGTERM
    pub shutdown_timeout: Duration,
    pub sync_writes: bool,
    pub hash_cost: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::LOCALHOST,
            port: DEFAULT_PORT,
            trace: false,
            pool_size: DEFAULT_POOL_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            data_dir: Self::default_data_dir(),
            instance: format!("chatd{}", std::process::id()),
            max_body_size: DEFAULT_BODY_LIMIT,
            read_timeout: Duration::from_secs(5),
            worker_wait: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(5),
            sync_writes: true,
            hash_cost: DEFAULT_HASH_COST,
        }
    }
}

impl ServerConfig {
    /// `$XDG_DATA_HOME/chatd`, falling back to `./chatd-data`
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("chatd"))
            .unwrap_or_else(|| PathBuf::from("chatd-data"))
    }

    /// Get the path to the default rc file
    pub fn rc_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatd")
            .join("chatdrc")
    }

    /// Defaults, then `rc` (if given or present at the default path), then the environment
    pub fn load(rc: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        match rc {
            Some(path) => config.apply_file(path)?,
            None => {
                let path = Self::rc_path();
                if path.exists() {
                    config.apply_file(&path)?;
                }
            }
        }
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.apply_rc(&content)
    }

    /// Apply every `KEY=VALUE` line of rc-file content
    pub fn apply_rc(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                self.set(&key, &unquote(&value))?;
            }
        }
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    /// Set one key; unknown keys are ignored
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "CHATD_IP" => self.ip = value.parse().map_err(|_| invalid())?,
            "CHATD_PORT" => self.port = value.parse().map_err(|_| invalid())?,
            "CHATD_WORKERS" => self.pool_size = value.parse().map_err(|_| invalid())?,
            "CHATD_MAX_CONNECTIONS" => self.max_connections = value.parse().map_err(|_| invalid())?,
            "CHATD_DATA_DIR" => self.data_dir = PathBuf::from(value),
            "CHATD_INSTANCE" => {
                if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(invalid());
                }
                self.instance = value.to_string();
            }
            "CHATD_MAX_BODY" => self.max_body_size = value.parse().map_err(|_| invalid())?,
            "CHATD_READ_TIMEOUT_MS" => {
                self.read_timeout = Duration::from_millis(value.parse().map_err(|_| invalid())?)
            }
            "CHATD_SHUTDOWN_TIMEOUT_MS" => {
                self.shutdown_timeout = Duration::from_millis(value.parse().map_err(|_| invalid())?)
            }
            "CHATD_SYNC_WRITES" => self.sync_writes = parse_bool(value).ok_or_else(invalid)?,
            "CHATD_HASH_COST" => self.hash_cost = value.parse().map_err(|_| invalid())?,
            _ => {}
        }
        Ok(())
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Rejected("worker pool size must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Rejected("max connections must be at least 1".into()));
        }
        if self.max_body_size > MAX_BODY_SIZE {
            return Err(ConfigError::Rejected(format!(
                "max body size {} exceeds the 16-bit size field ({})",
                self.max_body_size, MAX_BODY_SIZE
            )));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Rejected("read timeout must be nonzero".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

/// Every key `apply_env` looks at
pub const KEYS: [&str; 11] = [
    "CHATD_IP",
    "CHATD_PORT",
    "CHATD_WORKERS",
    "CHATD_MAX_CONNECTIONS",
    "CHATD_DATA_DIR",
    "CHATD_INSTANCE",
    "CHATD_MAX_BODY",
    "CHATD_READ_TIMEOUT_MS",
    "CHATD_SHUTDOWN_TIMEOUT_MS",
    "CHATD_SYNC_WRITES",
    "CHATD_HASH_COST",
];

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let value = line[eq_pos + 1..].trim().to_string();

    if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }

    Some((key, value))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    if s.len() >= 2 && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\''))) {
        return s[1..s.len() - 1].to_string();
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.port, 9090);
        assert_eq!(config.ip, Ipv4Addr::LOCALHOST);
        assert!(config.instance.starts_with("chatd"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_rc() {
        let content = r#"
# listener
CHATD_IP="0.0.0.0"
export CHATD_PORT=7000
CHATD_WORKERS='3'
CHATD_SYNC_WRITES=off
CHATD_READ_TIMEOUT_MS=1500
SOMETHING_ELSE=ignored
"#;
        let mut config = ServerConfig::default();
        config.apply_rc(content).unwrap();
        assert_eq!(config.ip, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.port, 7000);
        assert_eq!(config.pool_size, 3);
        assert!(!config.sync_writes);
        assert_eq!(config.read_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_value_names_key() {
        let mut config = ServerConfig::default();
        let err = config.set("CHATD_PORT", "seventy").unwrap_err();
        assert_eq!(err.to_string(), "invalid value for CHATD_PORT: \"seventy\"");
        assert!(config.set("CHATD_INSTANCE", "has/slash").is_err());
        assert!(config.set("CHATD_SYNC_WRITES", "maybe").is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = ServerConfig::default();
        config.pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_body_size = 70_000;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_file_missing() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_file(Path::new("/nonexistent/chatdrc"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
