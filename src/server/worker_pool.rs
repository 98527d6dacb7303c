//! Pre-forked worker processes
//!
//! ## Architecture
//! - Fork N workers at startup, before the accept loop runs
//! - Each worker blocks on the shared mailbox for a handed-off connection
//! - A worker serves exactly one dispatch per handoff, then returns the fd
//!   number to the listener over the control pipe
//! - Workers exit at the top of their loop once the shutdown flag is set

use crate::error::SysError;
use crate::router::{Response, Router};
use crate::server::ipc::{ControlWriter, HandoffSocket, Mailbox};
use crate::server::protocol::{read_dispatch, write_dispatch, ProtocolError};
use crate::server::sem::NamedSemaphore;
use crate::signal::ShutdownFlag;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpStream};
use std::os::fd::{OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// How often shutdown polls for exited workers
const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Worker process state, as seen by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Exited with the given status code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

/// A forked worker process
#[derive(Debug)]
pub struct Worker {
    pub pid: Pid,
    pub state: WorkerState,
    pub started_at: Instant,
}

/// Everything a worker process runs on
///
/// Built once in the listener before forking. Each child runs on its own
/// copy; the listener drops its copy once every worker is forked.
pub struct WorkerContext<'a> {
    pub handoff: HandoffSocket,
    pub mailbox: &'a Mailbox,
    pub control: ControlWriter,
    /// Serializes writes to the control pipe
    pub pipe_guard: &'a NamedSemaphore,
    pub router: &'a Router,
    pub shutdown: ShutdownFlag,
    pub read_timeout: Duration,
    pub worker_wait: Duration,
    pub max_body_size: usize,
}

/// How one handed-off connection went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    /// A response was written; the connection stays open
    Answered,
    /// The connection was shut down
    Closed,
}

impl WorkerContext<'_> {
    /// Worker main loop; returns the process exit status
    fn run(&mut self) -> i32 {
        info!("worker ready");
        while !self.shutdown.is_requested() {
            let handoff = match self.mailbox.collect(&self.handoff, self.worker_wait) {
                Ok(Some(handoff)) => handoff,
                Ok(None) => continue,
                Err(e) if e.is_interrupted() => continue,
                Err(e) => {
                    error!(error = %e, "handoff failed");
                    return 1;
                }
            };

            let origin = handoff.origin;
            let served = self.serve(handoff.fd);
            trace!(origin, ?served, "connection served");

            if let Err(e) = self.control.write_fd(self.pipe_guard, origin) {
                error!(error = %e, origin, "cannot return connection to listener");
                return 1;
            }
        }
        info!("worker stopping");
        0
    }

    /// Read one dispatch from `fd`, route it and write the response
    ///
    /// Consumes the worker's copy of the connection; the listener keeps its
    /// own. Every path that shuts the connection down also ends the session
    /// bound to its address.
    fn serve(&self, fd: OwnedFd) -> Served {
        let mut stream = TcpStream::from(fd);
        if let Err(e) = stream.set_read_timeout(Some(self.read_timeout)) {
            warn!(error = %e, "cannot set read timeout");
        }
        let peer = match stream.peer_addr() {
            Ok(SocketAddr::V4(peer)) => peer,
            Ok(other) => {
                warn!(peer = %other, "unsupported peer address family");
                return close(&stream);
            }
            Err(e) => {
                debug!(error = %e, "peer already gone");
                return close(&stream);
            }
        };

        let request = match read_dispatch(&mut stream, self.max_body_size) {
            Ok(request) => request,
            Err(ProtocolError::ConnectionClosed) => {
                self.disconnect(peer);
                return close(&stream);
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection after bad frame");
                self.disconnect(peer);
                return close(&stream);
            }
        };

        let response = match self.router.route(&request, peer) {
            Ok(response) => response,
            Err(e) => {
                error!(%peer, op = %request.op, object = %request.object, error = %e, "store failure");
                Response::internal().into_dispatch(&request)
            }
        };

        match write_dispatch(&mut stream, &response) {
            Ok(()) => Served::Answered,
            Err(e) => {
                warn!(%peer, error = %e, "cannot write response");
                self.disconnect(peer);
                close(&stream)
            }
        }
    }

    fn disconnect(&self, peer: SocketAddrV4) {
        match self.router.disconnect(peer) {
            Ok(Some(user_id)) => info!(%peer, user_id, "client disconnected"),
            Ok(None) => debug!(%peer, "client disconnected"),
            Err(e) => error!(%peer, error = %e, "cannot end session of closed connection"),
        }
    }
}

fn close(stream: &TcpStream) -> Served {
    // Shutting down the shared socket makes the listener see POLLHUP
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        trace!(error = %e, "shutdown on closed socket");
    }
    Served::Closed
}

/// Close descriptors the child inherited but only the listener uses
///
/// The owning handles stay in the child's copy of the listener's memory;
/// the child leaves through `process::exit`, so they are never dropped.
fn close_inherited(fds: &[RawFd]) {
    for &fd in fds {
        if let Err(e) = nix::unistd::close(fd) {
            trace!(fd, error = %e, "inherited fd already closed");
        }
    }
}

impl Worker {
    /// Fork one worker running `ctx`
    pub fn spawn(ctx: &mut WorkerContext<'_>, listener_only: &[RawFd]) -> Result<Self, SysError> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!(pid = child.as_raw(), "forked worker");
                Ok(Worker {
                    pid: child,
                    state: WorkerState::Running,
                    started_at: Instant::now(),
                })
            }
            Ok(ForkResult::Child) => {
                close_inherited(listener_only);
                let span = info_span!("worker", pid = std::process::id());
                let code = span.in_scope(|| ctx.run());
                std::process::exit(code);
            }
            Err(e) => Err(SysError::new("fork", e)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    /// Non-blocking status check
    fn poll_exit(&mut self) {
        if !self.is_running() {
            return;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => self.state = WorkerState::Exited(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => self.state = WorkerState::Signaled(sig),
            Ok(_) => {}
            Err(Errno::ECHILD) => self.state = WorkerState::Exited(-1),
            Err(Errno::EINTR) => {}
            Err(e) => warn!(pid = self.pid.as_raw(), error = %e, "waitpid failed"),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub running: usize,
    pub exited_clean: usize,
    pub failed: usize,
}

/// All workers of one server
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Fork `size` workers
    ///
    /// `listener_only` are descriptors each child closes right after the
    /// fork. On a fork failure the workers already started are stopped.
    pub fn spawn(
        size: usize,
        ctx: &mut WorkerContext<'_>,
        listener_only: &[RawFd],
        grace: Duration,
    ) -> Result<Self, SysError> {
        let mut pool = WorkerPool {
            workers: Vec::with_capacity(size),
        };
        for _ in 0..size {
            match Worker::spawn(ctx, listener_only) {
                Ok(worker) => pool.workers.push(worker),
                Err(e) => {
                    error!(error = %e, started = pool.workers.len(), "cannot fork worker");
                    pool.shutdown(grace);
                    return Err(e);
                }
            }
        }
        info!(workers = size, "worker pool started");
        Ok(pool)
    }

    /// Collect exit statuses of workers that have finished
    pub fn reap(&mut self) {
        for worker in &mut self.workers {
            let before = worker.state;
            worker.poll_exit();
            if before != worker.state {
                match worker.state {
                    WorkerState::Exited(0) => debug!(pid = worker.pid.as_raw(), "worker exited"),
                    WorkerState::Exited(code) => {
                        warn!(pid = worker.pid.as_raw(), code, "worker exited with failure")
                    }
                    WorkerState::Signaled(sig) => {
                        warn!(pid = worker.pid.as_raw(), signal = ?sig, "worker killed by signal")
                    }
                    WorkerState::Running => {}
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.workers.len(),
            ..PoolStats::default()
        };
        for worker in &self.workers {
            match worker.state {
                WorkerState::Running => stats.running += 1,
                WorkerState::Exited(0) => stats.exited_clean += 1,
                WorkerState::Exited(_) | WorkerState::Signaled(_) => stats.failed += 1,
            }
        }
        stats
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.workers.iter().map(|w| w.pid).collect()
    }

    /// SIGTERM every worker, wait up to `grace`, then SIGKILL stragglers
    pub fn shutdown(&mut self, grace: Duration) {
        for worker in self.workers.iter().filter(|w| w.is_running()) {
            if let Err(e) = signal::kill(worker.pid, Signal::SIGTERM) {
                debug!(pid = worker.pid.as_raw(), error = %e, "SIGTERM failed");
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.workers.iter().all(|w| !w.is_running()) || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(REAP_INTERVAL);
        }

        for worker in self.workers.iter_mut().filter(|w| w.is_running()) {
            warn!(pid = worker.pid.as_raw(), "worker did not stop in time, killing");
            let _ = signal::kill(worker.pid, Signal::SIGKILL);
            match waitpid(worker.pid, None) {
                Ok(WaitStatus::Signaled(_, sig, _)) => worker.state = WorkerState::Signaled(sig),
                Ok(WaitStatus::Exited(_, code)) => worker.state = WorkerState::Exited(code),
                _ => worker.state = WorkerState::Signaled(Signal::SIGKILL),
            }
        }

        let stats = self.stats();
        info!(
            total = stats.total,
            clean = stats.exited_clean,
            failed = stats.failed,
            "worker pool stopped"
        );
    }
}
