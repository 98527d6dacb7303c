//! Listener ↔ worker IPC
//!
//! Three channels connect the listener to its workers:
//! - `HandoffSocket`: a SOCK_SEQPACKET socketpair. The listener sends one
//!   connection fd per message via SCM_RIGHTS, with the listener's own fd
//!   number as the 4-byte payload so the worker can echo it back.
//! - `ControlPipe`: workers write that echoed fd number once they are done,
//!   which re-enables the connection in the listener's poll set.
//! - `Mailbox`: the domain-read / domain-write semaphore pair making the
//!   handoff socket a single-slot mailbox shared by every worker.

use crate::error::SysError;
use crate::server::sem::{Acquire, NamedSemaphore};
use crate::signal::ShutdownFlag;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};
use os_pipe::{PipeReader, PipeWriter};
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// Size of one fd number on the pipe and in handoff payloads
const FD_WORD: usize = std::mem::size_of::<i32>();

// =============================================================================
// Handoff socket (SCM_RIGHTS)
// =============================================================================

/// One end of the listener/worker handoff socketpair
#[derive(Debug)]
pub struct HandoffSocket {
    fd: OwnedFd,
}

/// A connection received from the listener
#[derive(Debug)]
pub struct Handoff {
    /// The worker's own copy of the connection
    pub fd: OwnedFd,
    /// The fd number in the listener, echoed back on the control pipe
    pub origin: RawFd,
}

impl HandoffSocket {
    /// Create the connected pair: (listener end, worker end)
    pub fn pair() -> Result<(HandoffSocket, HandoffSocket), SysError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| SysError::new("socketpair", e))?;
        Ok((HandoffSocket { fd: a }, HandoffSocket { fd: b }))
    }

    /// Pass `fd` to whichever worker reads next
    pub fn send_fd(&self, fd: RawFd) -> Result<(), SysError> {
        let payload = fd.to_ne_bytes();
        let iov = [IoSlice::new(&payload)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];

        loop {
            match sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
                Ok(_) => {
                    trace!(fd, "handed off connection");
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SysError::new("sendmsg", e)),
            }
        }
    }

    /// Receive one passed fd and the listener's fd number for it
    pub fn recv_fd(&self) -> Result<Handoff, SysError> {
        let mut payload = [0u8; FD_WORD];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

        let (received, bytes) = loop {
            let mut iov = [IoSliceMut::new(&mut payload)];
            match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut received = Vec::new();
                    let cmsgs = msg.cmsgs().map_err(|e| SysError::new("recvmsg", e))?;
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            received.extend(fds);
                        }
                    }
                    break (received, msg.bytes);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(SysError::new("recvmsg", e)),
            }
        };

        // Take ownership of everything first so nothing leaks on error
        let mut owned: Vec<OwnedFd> = received
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();

        if bytes == 0 && owned.is_empty() {
            // Peer end closed: the listener is gone
            return Err(SysError::new("recvmsg", Errno::ECONNRESET));
        }
        if bytes != FD_WORD || owned.len() != 1 {
            return Err(SysError::new("recvmsg", Errno::EBADMSG));
        }

        let fd = owned.remove(0);
        let origin = i32::from_ne_bytes(payload);
        trace!(origin, local = fd.as_raw_fd(), "received connection");
        Ok(Handoff { fd, origin })
    }
}

impl AsFd for HandoffSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

// =============================================================================
// Control pipe
// =============================================================================

/// Read end, owned by the listener
#[derive(Debug)]
pub struct ControlReader {
    reader: PipeReader,
}

/// Write end, shared by all workers
#[derive(Debug)]
pub struct ControlWriter {
    writer: PipeWriter,
}

/// Create the worker → listener control pipe
pub fn control_pipe() -> Result<(ControlReader, ControlWriter), SysError> {
    let (reader, writer) = os_pipe::pipe().map_err(|e| SysError::from_io("pipe", &e))?;
    Ok((ControlReader { reader }, ControlWriter { writer }))
}

impl ControlReader {
    /// Read one finished fd number
    pub fn read_fd(&mut self) -> Result<RawFd, SysError> {
        let mut word = [0u8; FD_WORD];
        loop {
            match self.reader.read_exact(&mut word) {
                Ok(()) => return Ok(i32::from_ne_bytes(word)),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SysError::from_io("read", &e)),
            }
        }
    }
}

impl AsFd for ControlReader {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

impl ControlWriter {
    /// Report that the connection known to the listener as `fd` is free.
    ///
    /// `guard` serializes writers; a 4-byte write is atomic on a pipe, but
    /// the pipe-write semaphore is still held for the whole write.
    pub fn write_fd(&mut self, guard: &NamedSemaphore, fd: RawFd) -> Result<(), SysError> {
        let _held = guard.lock()?;
        loop {
            match self.writer.write_all(&fd.to_ne_bytes()) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SysError::from_io("write", &e)),
            }
        }
    }
}

// =============================================================================
// Mailbox semaphore pair
// =============================================================================

/// Single-slot mailbox guarding the handoff socket
///
/// `write` starts at 1 and is taken by the listener before each send; `read`
/// starts at 0 and is posted after each send. A worker takes `read`, receives
/// the fd and then posts `write`. At most one handoff is ever in flight.
#[derive(Debug)]
pub struct Mailbox {
    read: NamedSemaphore,
    write: NamedSemaphore,
}

impl Mailbox {
    pub fn new(read: NamedSemaphore, write: NamedSemaphore) -> Self {
        Self { read, write }
    }

    /// Listener side: hand `fd` to exactly one waiting worker
    ///
    /// Waits for the mailbox to be free, rechecking `shutdown` every
    /// `recheck`. Returns `Ok(false)` if shutdown was requested first.
    pub fn deliver(
        &self,
        socket: &HandoffSocket,
        fd: RawFd,
        shutdown: &ShutdownFlag,
        recheck: Duration,
    ) -> Result<bool, SysError> {
        loop {
            match self.write.wait_timeout(recheck)? {
                Acquire::Acquired => break,
                Acquire::Interrupted | Acquire::TimedOut => {
                    if shutdown.is_requested() {
                        return Ok(false);
                    }
                }
            }
        }
        if let Err(e) = socket.send_fd(fd) {
            // Nothing was sent; give the slot back so the next attempt can run
            self.write.post()?;
            return Err(e);
        }
        self.read.post()?;
        Ok(true)
    }

    /// Worker side: wait up to `timeout` for a handoff
    ///
    /// `Ok(None)` means nothing arrived (timeout or signal); the caller
    /// rechecks its shutdown flag and calls again.
    pub fn collect(&self, socket: &HandoffSocket, timeout: Duration) -> Result<Option<Handoff>, SysError> {
        match self.read.wait_timeout(timeout)? {
            Acquire::Acquired => {}
            Acquire::Interrupted | Acquire::TimedOut => return Ok(None),
        }
        let received = socket.recv_fd();
        // Free the mailbox whether or not the receive worked
        self.write.post()?;
        received.map(Some)
    }

    pub fn unlink(&self) -> Result<(), SysError> {
        self.read.unlink()?;
        self.write.unlink()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs::File;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn sem_name(tag: &str) -> String {
        format!("/chatd_ipc_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_passed_fd_refers_to_same_socket() {
        let (listener_end, worker_end) = HandoffSocket::pair().unwrap();
        let (mut ours, theirs) = UnixStream::pair().unwrap();

        listener_end.send_fd(theirs.as_raw_fd()).unwrap();
        let handoff = worker_end.recv_fd().unwrap();
        assert_eq!(handoff.origin, theirs.as_raw_fd());
        assert_ne!(handoff.fd.as_raw_fd(), theirs.as_raw_fd());

        // Writing through the received copy reaches our end of the pair
        let mut passed = UnixStream::from(handoff.fd);
        passed.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        ours.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_recv_after_peer_closed() {
        let (listener_end, worker_end) = HandoffSocket::pair().unwrap();
        drop(listener_end);
        let err = worker_end.recv_fd().unwrap_err();
        assert_eq!(err.errno, Errno::ECONNRESET);
    }

    #[test]
    fn test_control_pipe_round_trip() {
        let guard = NamedSemaphore::create(&sem_name("pw"), 1).unwrap();
        let (mut reader, mut writer) = control_pipe().unwrap();
        writer.write_fd(&guard, 17).unwrap();
        writer.write_fd(&guard, -3).unwrap();
        assert_eq!(reader.read_fd().unwrap(), 17);
        assert_eq!(reader.read_fd().unwrap(), -3);
        assert_eq!(guard.value().unwrap(), 1);
        guard.unlink().unwrap();
    }

    #[test]
    fn test_deliver_gives_up_on_shutdown() {
        let mailbox = Mailbox::new(
            NamedSemaphore::create(&sem_name("dr_busy"), 0).unwrap(),
            // No free slot: a previous handoff was never collected
            NamedSemaphore::create(&sem_name("dw_busy"), 0).unwrap(),
        );
        let (listener_end, _worker_end) = HandoffSocket::pair().unwrap();
        let shutdown = ShutdownFlag::new();
        shutdown.request();
        let sent = mailbox
            .deliver(&listener_end, 0, &shutdown, Duration::from_millis(10))
            .unwrap();
        assert!(!sent);
        mailbox.unlink().unwrap();
    }

    #[test]
    fn test_collect_times_out_without_delivery() {
        let mailbox = Mailbox::new(
            NamedSemaphore::create(&sem_name("dr_idle"), 0).unwrap(),
            NamedSemaphore::create(&sem_name("dw_idle"), 1).unwrap(),
        );
        let (_listener_end, worker_end) = HandoffSocket::pair().unwrap();
        let got = mailbox.collect(&worker_end, Duration::from_millis(20)).unwrap();
        assert!(got.is_none());
        mailbox.unlink().unwrap();
    }

    #[test]
    fn test_mailbox_single_holder_and_exactly_once_delivery() {
        const WORKERS: usize = 4;
        const JOBS: usize = 40;

        let mailbox = Arc::new(Mailbox::new(
            NamedSemaphore::create(&sem_name("dr"), 0).unwrap(),
            NamedSemaphore::create(&sem_name("dw"), 1).unwrap(),
        ));
        let (listener_end, worker_end) = HandoffSocket::pair().unwrap();
        let worker_end = Arc::new(worker_end);

        // Open a batch of distinct fds to pass around
        let files: Vec<File> = (0..JOBS).map(|_| File::open("/dev/null").unwrap()).collect();
        let expected: HashSet<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();

        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let remaining = Arc::new(AtomicUsize::new(JOBS));

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let mailbox = Arc::clone(&mailbox);
                let socket = Arc::clone(&worker_end);
                let holders = Arc::clone(&holders);
                let max_holders = Arc::clone(&max_holders);
                let delivered = Arc::clone(&delivered);
                let remaining = Arc::clone(&remaining);
                thread::spawn(move || {
                    while remaining.load(Ordering::SeqCst) > 0 {
                        // Same steps as Mailbox::collect, instrumented between
                        // acquiring `read` and releasing `write`
                        match mailbox.read.wait_timeout(Duration::from_millis(20)).unwrap() {
                            Acquire::Acquired => {}
                            _ => continue,
                        }
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_holders.fetch_max(now, Ordering::SeqCst);
                        let handoff = socket.recv_fd().unwrap();
                        holders.fetch_sub(1, Ordering::SeqCst);
                        mailbox.write.post().unwrap();

                        delivered.lock().unwrap().push(handoff.origin);
                        remaining.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let shutdown = ShutdownFlag::new();
        for file in &files {
            let sent = mailbox
                .deliver(&listener_end, file.as_raw_fd(), &shutdown, Duration::from_millis(50))
                .unwrap();
            assert!(sent);
        }
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), JOBS);
        let unique: HashSet<RawFd> = delivered.iter().copied().collect();
        assert_eq!(unique, expected);
        mailbox.unlink().unwrap();
    }
}
