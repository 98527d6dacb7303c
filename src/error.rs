//! Structured error types for chatd
//!
//! Every failing system call is captured as a [`SysError`]: the call name,
//! the errno and the source location of the call site. Callers inspect the
//! record immediately and either handle it or propagate it.

use nix::errno::Errno;
use std::fmt;
use std::panic::Location;

use crate::server::config::ConfigError;
use crate::server::protocol::ProtocolError;
use crate::store::StoreError;

/// Source location information for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    /// File the failing call lives in
    pub file: &'static str,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

impl SourceLocation {
    /// Location of the caller of the function this is invoked from
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for SourceLocation {
    fn from(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A failed system call
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{call} failed: {errno} (at {location})")]
pub struct SysError {
    /// Name of the failing call (e.g. "poll", "sem_wait")
    pub call: &'static str,
    /// The errno reported by the call
    pub errno: Errno,
    /// Where the call was made
    pub location: SourceLocation,
}

impl SysError {
    /// Record a failure of `call` with the given errno at the caller's location
    #[track_caller]
    pub fn new(call: &'static str, errno: Errno) -> Self {
        Self {
            call,
            errno,
            location: SourceLocation::caller(),
        }
    }

    /// Record a failure of `call` using the current thread's errno
    #[track_caller]
    pub fn last(call: &'static str) -> Self {
        Self::new(call, Errno::last())
    }

    /// Record a failure of `call` from an `io::Error`
    #[track_caller]
    pub fn from_io(call: &'static str, err: &std::io::Error) -> Self {
        let errno = err
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        Self::new(call, errno)
    }

    /// Whether the call was interrupted by a signal
    pub fn is_interrupted(&self) -> bool {
        self.errno == Errno::EINTR
    }
}

/// Top-level error for chatd operations
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Sys(#[from] SysError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether this error only reports an interrupted blocking call
    pub fn is_interrupted(&self) -> bool {
        match self {
            ChatError::Sys(e) => e.is_interrupted(),
            ChatError::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_error_records_location() {
        let line = line!() + 1;
        let err = SysError::new("poll", Errno::EBADF);
        assert_eq!(err.call, "poll");
        assert_eq!(err.errno, Errno::EBADF);
        assert_eq!(err.location.line, line);
        assert!(err.location.file.ends_with("error.rs"));
    }

    #[test]
    fn test_sys_error_display() {
        let err = SysError::new("sem_wait", Errno::EINVAL);
        let text = err.to_string();
        assert!(text.starts_with("sem_wait failed:"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    fn test_interrupted() {
        assert!(SysError::new("poll", Errno::EINTR).is_interrupted());
        assert!(!SysError::new("poll", Errno::EAGAIN).is_interrupted());

        let err: ChatError = SysError::new("sem_wait", Errno::EINTR).into();
        assert!(err.is_interrupted());

        let err: ChatError = std::io::Error::from(std::io::ErrorKind::Interrupted).into();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_from_io_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(libc::EPIPE);
        let err = SysError::from_io("send", &io);
        assert_eq!(err.errno, Errno::EPIPE);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "synthetic");
        let err = SysError::from_io("send", &io);
        assert_eq!(err.errno, Errno::EIO);
    }
}
