//! The chat server process topology
//!
//! One listener process owns the listening socket and every accepted
//! connection. A fixed pool of forked workers serves dispatches on
//! connections the listener hands over.
//!
//! ## Startup
//! 1. Register the shutdown signals (flag plus wake socket)
//! 2. Bind the TCP listener
//! 3. Create the control pipe, the handoff socketpair and the semaphores,
//!    and clear sessions left over from the previous run
//! 4. Fork the workers
//! 5. Run the listener loop until shutdown
//!
//! ## Shutdown
//! SIGTERM the workers, wait for them, SIGKILL stragglers, close every
//! client connection and unlink all semaphores.

pub mod client;
pub mod config;
pub mod ipc;
pub mod listener;
pub mod protocol;
pub mod sem;
pub mod worker_pool;

use crate::error::Result;
use crate::router::{Passwords, Router};
use crate::signal::{ShutdownFlag, SignalWake};
use crate::store::Stores;
use config::{ConfigError, ServerConfig};
use ipc::{control_pipe, HandoffSocket, Mailbox};
use listener::Listener;
use sem::NamedSemaphore;
use socket2::{Domain, Protocol, Socket, Type};
use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, AsRawFd};
use tracing::{error, info, warn};
use worker_pool::{WorkerContext, WorkerPool};

/// Pending-connection queue length of the listening socket
pub const LISTEN_BACKLOG: i32 = 128;

/// Names of the IPC semaphores of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcSemaphores {
    /// Serializes control pipe writes
    pub pipe_write: String,
    /// Posted once a handoff is waiting
    pub domain_read: String,
    /// Held while a handoff is in flight
    pub domain_write: String,
}

impl IpcSemaphores {
    pub fn for_instance(instance: &str) -> Self {
        Self {
            pipe_write: format!("/{}_pw", instance),
            domain_read: format!("/{}_dr", instance),
            domain_write: format!("/{}_dw", instance),
        }
    }
}

/// Bind the listening socket with address reuse
pub fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// A configured server, ready to run
pub struct ChatServer {
    config: ServerConfig,
    shutdown: ShutdownFlag,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Run the server until SIGINT/SIGTERM
    pub fn start(self) -> Result<()> {
        self.config.validate()?;
        self.shutdown.register()?;
        let wake = SignalWake::register()?;

        let socket = bind(SocketAddr::V4(self.config.listen_addr()))?;
        let local = socket.local_addr()?;
        info!("listening on {}", local);

        fs::create_dir_all(&self.config.data_dir)?;

        let instance = &self.config.instance;
        let names = IpcSemaphores::for_instance(instance);
        let pipe_guard = NamedSemaphore::create(&names.pipe_write, 1)?;
        let mailbox = Mailbox::new(
            NamedSemaphore::create(&names.domain_read, 0)?,
            NamedSemaphore::create(&names.domain_write, 1)?,
        );
        let stores = Stores::create(&self.config.data_dir, instance, self.config.sync_writes)?;
        let passwords = Passwords::new(self.config.hash_cost)
            .map_err(|e| ConfigError::Rejected(format!("invalid hash cost: {e}")))?;
        let router = Router::new(stores, passwords);
        match router.reset_sessions() {
            Ok(0) => {}
            Ok(stale) => info!(stale, "cleared sessions left by the previous run"),
            Err(e) => {
                unlink_all(&pipe_guard, &mailbox, &router);
                return Err(e.into());
            }
        }

        let (control_reader, control_writer) = control_pipe()?;
        let (listener_end, worker_end) = HandoffSocket::pair()?;

        info!(
            data_dir = %self.config.data_dir.display(),
            instance,
            workers = self.config.pool_size,
            "starting chatd"
        );

        let listener_only = [
            socket.as_raw_fd(),
            control_reader.as_fd().as_raw_fd(),
            listener_end.as_fd().as_raw_fd(),
            wake.as_fd().as_raw_fd(),
        ];
        let spawned = {
            let mut ctx = WorkerContext {
                handoff: worker_end,
                mailbox: &mailbox,
                control: control_writer,
                pipe_guard: &pipe_guard,
                router: &router,
                shutdown: self.shutdown.clone(),
                read_timeout: self.config.read_timeout,
                worker_wait: self.config.worker_wait,
                max_body_size: self.config.max_body_size,
            };
            WorkerPool::spawn(
                self.config.pool_size,
                &mut ctx,
                &listener_only,
                self.config.shutdown_timeout,
            )
            // The worker-only ends close here in the listener
        };
        let mut pool = match spawned {
            Ok(pool) => pool,
            Err(e) => {
                unlink_all(&pipe_guard, &mailbox, &router);
                return Err(e.into());
            }
        };

        let mut listener = Listener::new(
            socket,
            control_reader,
            wake,
            listener_end,
            mailbox,
            &router,
            self.config.max_connections,
            self.shutdown.clone(),
            self.config.worker_wait,
        );
        let outcome = listener.run();
        if let Err(e) = &outcome {
            error!(error = %e, "listener failed");
        }

        info!("shutting down");
        pool.shutdown(self.config.shutdown_timeout);
        listener.close_all();
        unlink_all(&pipe_guard, listener.mailbox(), &router);
        info!("chatd stopped");
        outcome
    }
}

fn unlink_all(pipe_guard: &NamedSemaphore, mailbox: &Mailbox, router: &Router) {
    if let Err(e) = mailbox.unlink() {
        warn!(error = %e, "failed to unlink mailbox semaphores");
    }
    if let Err(e) = pipe_guard.unlink() {
        warn!(semaphore = pipe_guard.name(), error = %e, "failed to unlink semaphore");
    }
    router.stores().unlink();
}
