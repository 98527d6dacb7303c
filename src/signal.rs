//! Shutdown signalling
//!
//! SIGINT and SIGTERM flip a shared flag and write one byte to a wake
//! socket. Both actions are async-signal-safe; the handler never blocks.
//! The listener polls the read end of the wake socket so a signal that
//! lands just before `poll()` is never lost.

use signal_hook::consts::{SIGINT, SIGTERM};
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signals that request a graceful shutdown
pub const SHUTDOWN_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

/// Shared "keep running" state, checked at the top of every loop
#[derive(Clone, Debug)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if shutdown was requested
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown from ordinary (non-handler) code
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Register SIGINT/SIGTERM to set this flag
    pub fn register(&self) -> io::Result<()> {
        for sig in SHUTDOWN_SIGNALS {
            signal_hook::flag::register(sig, Arc::clone(&self.requested))?;
        }
        Ok(())
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Read end of the self-pipe written by the signal handlers
pub struct SignalWake {
    reader: UnixStream,
}

impl SignalWake {
    /// Create the wake socket and register it for the shutdown signals
    pub fn register() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        for sig in SHUTDOWN_SIGNALS {
            signal_hook::low_level::pipe::register(sig, writer.try_clone()?)?;
        }
        Ok(Self { reader })
    }

    /// Discard any pending wake bytes
    pub fn drain(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.reader.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl AsFd for SignalWake {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}
