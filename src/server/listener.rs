//! Listener process: accept loop and connection table
//!
//! The listener owns every accepted socket but never reads from one. When a
//! client slot turns readable the fd is handed to a worker and its poll slot
//! is negated, which makes `poll()` ignore it. The worker writes the fd
//! number back on the control pipe when done and the slot is flipped
//! positive again.
//!
//! A hangup seen by the listener ends the session bound to the slot's peer
//! before the fd is closed, so a later connection reusing the address starts
//! anonymous.

use crate::error::{ChatError, SysError};
use crate::router::Router;
use crate::server::ipc::{ControlReader, HandoffSocket, Mailbox};
use crate::signal::{ShutdownFlag, SignalWake};
use nix::errno::Errno;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Slot of the listening socket
pub const LISTEN_SLOT: usize = 0;
/// Slot of the control pipe read end
pub const CONTROL_SLOT: usize = 1;
/// Slot of the signal wake socket
pub const WAKE_SLOT: usize = 2;
/// First client slot
pub const FIRST_CLIENT_SLOT: usize = 3;

const READABLE: libc::c_short = libc::POLLIN;
const HANGUP: libc::c_short = libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// What a client slot is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Polled for activity
    Active(RawFd),
    /// With a worker; not polled
    InFlight(RawFd),
}

/// Poll set of the listener plus the peer address of each client slot
///
/// Slot encoding follows `struct pollfd`: fd 0 is an empty slot and a
/// negative fd is a connection currently held by a worker.
#[derive(Debug)]
pub struct ConnectionTable {
    fds: Vec<libc::pollfd>,
    peers: Vec<Option<SocketAddr>>,
    connections: usize,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(listen: RawFd, control: RawFd, wake: RawFd, max_connections: usize) -> Self {
        let mut fds = vec![
            libc::pollfd {
                fd: 0,
                events: 0,
                revents: 0,
            };
            FIRST_CLIENT_SLOT + max_connections
        ];
        fds[LISTEN_SLOT] = libc::pollfd {
            fd: listen,
            events: READABLE,
            revents: 0,
        };
        fds[CONTROL_SLOT] = libc::pollfd {
            fd: control,
            events: READABLE,
            revents: 0,
        };
        fds[WAKE_SLOT] = libc::pollfd {
            fd: wake,
            events: READABLE,
            revents: 0,
        };
        for slot in &mut fds[FIRST_CLIENT_SLOT..] {
            slot.events = READABLE;
        }

        Self {
            fds,
            peers: vec![None; max_connections],
            connections: 0,
            max_connections,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections
    }

    pub fn is_full(&self) -> bool {
        self.connections >= self.max_connections
    }

    /// Whether the listening socket is currently polled for accepts
    pub fn accepting(&self) -> bool {
        self.fds[LISTEN_SLOT].events & READABLE != 0
    }

    pub fn state(&self, slot: usize) -> SlotState {
        match self.fds[slot].fd {
            0 => SlotState::Empty,
            fd if fd < 0 => SlotState::InFlight(-fd),
            fd => SlotState::Active(fd),
        }
    }

    pub fn peer(&self, slot: usize) -> Option<SocketAddr> {
        self.peers.get(slot - FIRST_CLIENT_SLOT).copied().flatten()
    }

    /// Store a new connection in the first empty slot
    ///
    /// Returns the slot, or `None` if the table is full. Reaching capacity
    /// stops accept interest until a slot frees up.
    pub fn insert(&mut self, fd: RawFd, peer: SocketAddr) -> Option<usize> {
        let slot = (FIRST_CLIENT_SLOT..self.fds.len()).find(|&i| self.fds[i].fd == 0)?;
        self.fds[slot].fd = fd;
        self.fds[slot].revents = 0;
        self.peers[slot - FIRST_CLIENT_SLOT] = Some(peer);
        self.connections += 1;
        if self.is_full() {
            self.fds[LISTEN_SLOT].events = 0;
            debug!(connections = self.connections, "connection limit reached, pausing accepts");
        }
        Some(slot)
    }

    /// Mark a slot as held by a worker
    pub fn disable(&mut self, slot: usize) {
        let fd = self.fds[slot].fd;
        if fd > 0 {
            self.fds[slot].fd = -fd;
        }
    }

    /// A worker reported `fd` as done; re-enable its slot
    pub fn enable(&mut self, fd: RawFd) -> Option<usize> {
        if fd <= 0 {
            return None;
        }
        let slot = (FIRST_CLIENT_SLOT..self.fds.len()).find(|&i| self.fds[i].fd == -fd)?;
        self.fds[slot].fd = fd;
        self.fds[slot].revents = 0;
        Some(slot)
    }

    /// Clear a slot, returning the fd it held so the caller can close it
    pub fn remove(&mut self, slot: usize) -> Option<RawFd> {
        let fd = self.fds[slot].fd;
        if fd == 0 {
            return None;
        }
        self.fds[slot].fd = 0;
        self.fds[slot].revents = 0;
        self.peers[slot - FIRST_CLIENT_SLOT] = None;
        self.connections -= 1;
        if !self.is_full() {
            self.fds[LISTEN_SLOT].events = READABLE;
        }
        Some(fd.abs())
    }

    /// Wait for readiness on every active slot, forever
    ///
    /// Returns `Ok(false)` when interrupted by a signal.
    pub fn poll(&mut self) -> Result<bool, SysError> {
        for slot in &mut self.fds {
            slot.revents = 0;
        }
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                -1,
            )
        };
        if rc < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(false),
                errno => Err(SysError::new("poll", errno)),
            };
        }
        Ok(true)
    }

    pub fn revents(&self, slot: usize) -> libc::c_short {
        self.fds[slot].revents
    }

    /// Client slots that reported events in the last poll
    pub fn ready_clients(&self) -> Vec<usize> {
        (FIRST_CLIENT_SLOT..self.fds.len())
            .filter(|&i| self.fds[i].fd > 0 && self.fds[i].revents != 0)
            .collect()
    }

    /// Every client fd still held, active or in flight
    pub fn client_fds(&self) -> Vec<RawFd> {
        self.fds[FIRST_CLIENT_SLOT..]
            .iter()
            .filter(|p| p.fd != 0)
            .map(|p| p.fd.abs())
            .collect()
    }
}

/// The listener's side of the topology
pub struct Listener<'a> {
    socket: TcpListener,
    control: ControlReader,
    wake: SignalWake,
    handoff: HandoffSocket,
    mailbox: Mailbox,
    table: ConnectionTable,
    router: &'a Router,
    shutdown: ShutdownFlag,
    recheck: Duration,
}

impl<'a> Listener<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: TcpListener,
        control: ControlReader,
        wake: SignalWake,
        handoff: HandoffSocket,
        mailbox: Mailbox,
        router: &'a Router,
        max_connections: usize,
        shutdown: ShutdownFlag,
        recheck: Duration,
    ) -> Self {
        let table = ConnectionTable::new(
            socket.as_raw_fd(),
            control.as_fd().as_raw_fd(),
            wake.as_fd().as_raw_fd(),
            max_connections,
        );
        Self {
            socket,
            control,
            wake,
            handoff,
            mailbox,
            table,
            router,
            shutdown,
            recheck,
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Run until shutdown is requested or a fatal IPC error occurs
    pub fn run(&mut self) -> Result<(), ChatError> {
        info!(
            addr = %self.socket.local_addr()?,
            "listener ready"
        );

        while !self.shutdown.is_requested() {
            if !self.table.poll()? {
                trace!("poll interrupted");
                continue;
            }

            if self.table.revents(WAKE_SLOT) & READABLE != 0 {
                self.wake.drain();
                if self.shutdown.is_requested() {
                    break;
                }
            }

            if self.table.revents(CONTROL_SLOT) & READABLE != 0 {
                let fd = self.control.read_fd()?;
                match self.table.enable(fd) {
                    Some(slot) => trace!(fd, slot, "connection returned by worker"),
                    None => warn!(fd, "worker returned an fd the listener does not hold"),
                }
            } else if self.table.revents(CONTROL_SLOT) & HANGUP != 0 {
                // Every worker end is closed: no one will ever hand fds back
                return Err(SysError::new("read", Errno::EPIPE).into());
            }

            if self.table.revents(LISTEN_SLOT) & READABLE != 0 {
                self.accept()?;
            }

            for slot in self.table.ready_clients() {
                let revents = self.table.revents(slot);
                if revents & HANGUP != 0 {
                    self.end_session(slot);
                    self.close_slot(slot);
                } else if revents & READABLE != 0 {
                    self.hand_off(slot)?;
                }
            }
        }

        info!("listener stopping");
        Ok(())
    }

    fn accept(&mut self) -> Result<(), ChatError> {
        match self.socket.accept() {
            Ok((stream, peer)) => {
                let fd = stream.into_raw_fd();
                match self.table.insert(fd, peer) {
                    Some(slot) => {
                        debug!(%peer, fd, slot, connections = self.table.connections(), "accepted connection");
                    }
                    None => {
                        warn!(%peer, "connection table full, dropping connection");
                        unsafe {
                            libc::close(fd);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => match e.raw_os_error().map(Errno::from_raw) {
                Some(Errno::EINTR) | Some(Errno::EAGAIN) | Some(Errno::ECONNABORTED) => {
                    trace!(error = %e, "transient accept failure");
                    Ok(())
                }
                _ => Err(SysError::from_io("accept", &e).into()),
            },
        }
    }

    fn hand_off(&mut self, slot: usize) -> Result<(), ChatError> {
        let SlotState::Active(fd) = self.table.state(slot) else {
            return Ok(());
        };
        if !self
            .mailbox
            .deliver(&self.handoff, fd, &self.shutdown, self.recheck)?
        {
            return Ok(());
        }
        self.table.disable(slot);
        trace!(fd, slot, "connection in flight");
        Ok(())
    }

    /// Forget the user logged in over the slot's peer
    fn end_session(&self, slot: usize) {
        let Some(SocketAddr::V4(peer)) = self.table.peer(slot) else {
            return;
        };
        match self.router.disconnect(peer) {
            Ok(Some(user_id)) => info!(%peer, user_id, "connection dropped, session ended"),
            Ok(None) => {}
            Err(e) => error!(%peer, error = %e, "cannot end session of dropped connection"),
        }
    }

    fn close_slot(&mut self, slot: usize) {
        let peer = self.table.peer(slot);
        if let Some(fd) = self.table.remove(slot) {
            unsafe {
                libc::close(fd);
            }
            debug!(fd, slot, peer = ?peer, connections = self.table.connections(), "connection closed");
        }
    }

    /// Close every client connection still held
    ///
    /// Sessions are left alone: a worker killed during shutdown may still
    /// hold a store semaphore. The next start clears them.
    pub fn close_all(&mut self) {
        for slot in FIRST_CLIENT_SLOT..FIRST_CLIENT_SLOT + self.table.max_connections {
            self.close_slot(slot);
        }
    }
}

impl Drop for Listener<'_> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn table(max: usize) -> ConnectionTable {
        ConnectionTable::new(10, 11, 12, max)
    }

    #[test]
    fn test_new_table_layout() {
        let t = table(4);
        assert_eq!(t.connections(), 0);
        assert!(t.accepting());
        for slot in FIRST_CLIENT_SLOT..FIRST_CLIENT_SLOT + 4 {
            assert_eq!(t.state(slot), SlotState::Empty);
        }
    }

    #[test]
    fn test_insert_uses_first_empty_slot() {
        let mut t = table(4);
        assert_eq!(t.insert(20, peer(1000)), Some(FIRST_CLIENT_SLOT));
        assert_eq!(t.insert(21, peer(1001)), Some(FIRST_CLIENT_SLOT + 1));
        assert_eq!(t.remove(FIRST_CLIENT_SLOT), Some(20));
        assert_eq!(t.insert(22, peer(1002)), Some(FIRST_CLIENT_SLOT));
        assert_eq!(t.peer(FIRST_CLIENT_SLOT), Some(peer(1002)));
        assert_eq!(t.connections(), 2);
    }

    #[test]
    fn test_sign_flip_round_trip() {
        let mut t = table(2);
        let slot = t.insert(30, peer(2000)).unwrap();
        t.disable(slot);
        assert_eq!(t.state(slot), SlotState::InFlight(30));
        // Disabling twice keeps the marker
        t.disable(slot);
        assert_eq!(t.state(slot), SlotState::InFlight(30));

        assert_eq!(t.enable(30), Some(slot));
        assert_eq!(t.state(slot), SlotState::Active(30));
        // Nothing is in flight under that fd any more
        assert_eq!(t.enable(30), None);
        assert_eq!(t.enable(99), None);
        assert_eq!(t.enable(0), None);
    }

    #[test]
    fn test_capacity_pauses_and_resumes_accepts() {
        let mut t = table(2);
        t.insert(40, peer(1)).unwrap();
        assert!(t.accepting());
        let second = t.insert(41, peer(2)).unwrap();
        assert!(t.is_full());
        assert!(!t.accepting());
        assert_eq!(t.insert(42, peer(3)), None);

        assert_eq!(t.remove(second), Some(41));
        assert!(t.accepting());
        assert_eq!(t.connections(), 1);
    }

    #[test]
    fn test_remove_in_flight_returns_positive_fd() {
        let mut t = table(1);
        let slot = t.insert(50, peer(5)).unwrap();
        t.disable(slot);
        assert_eq!(t.remove(slot), Some(50));
        assert_eq!(t.remove(slot), None);
        assert_eq!(t.state(slot), SlotState::Empty);
        assert_eq!(t.peer(slot), None);
    }

    #[test]
    fn test_client_fds_and_ready_clients() {
        let mut t = table(3);
        let a = t.insert(60, peer(6)).unwrap();
        let b = t.insert(61, peer(7)).unwrap();
        t.disable(b);
        let mut fds = t.client_fds();
        fds.sort();
        assert_eq!(fds, vec![60, 61]);

        t.fds[a].revents = READABLE;
        t.fds[b].revents = READABLE;
        // In-flight slots never count as ready
        assert_eq!(t.ready_clients(), vec![a]);
    }

    #[test]
    fn test_poll_sees_readable_socket() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let (control_r, _control_w) = UnixStream::pair().unwrap();
        let (wake_r, _wake_w) = UnixStream::pair().unwrap();
        let listen = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();

        let mut t = ConnectionTable::new(
            listen.as_raw_fd(),
            control_r.as_raw_fd(),
            wake_r.as_raw_fd(),
            2,
        );
        let slot = t.insert(server.as_raw_fd(), peer(9)).unwrap();
        client.write_all(b"x").unwrap();

        assert!(t.poll().unwrap());
        assert_eq!(t.ready_clients(), vec![slot]);
        assert_ne!(t.revents(slot) & READABLE, 0);
    }
}
