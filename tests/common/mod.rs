// Shared harness for the end-to-end tests: runs a real chatd process

#![allow(dead_code)]

use chatd::server::client::{ChatClient, Reply};
use chatd::server::protocol::{ObjectType, OpType};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

static NEXT: AtomicUsize = AtomicUsize::new(0);

const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

/// A running chatd with its own data directory and semaphore names
pub struct Server {
    child: Option<Child>,
    pub addr: SocketAddr,
    pub instance: String,
    pub dir: TempDir,
}

impl Server {
    pub fn start() -> Self {
        Self::start_with(&[])
    }

    /// Start with extra `KEY=VALUE` environment settings
    pub fn start_with(env: &[(&str, &str)]) -> Self {
        Self::launch(TempDir::new().unwrap(), env)
    }

    /// Stop the server and start a new one on the same data directory
    pub fn restart(mut self) -> Self {
        let status = self.terminate();
        assert!(status.success(), "exit status {:?}", status);
        let dir = std::mem::replace(&mut self.dir, TempDir::new().unwrap());
        Self::launch(dir, &[])
    }

    fn launch(dir: TempDir, env: &[(&str, &str)]) -> Self {
        let rc = dir.path().join("chatdrc");
        std::fs::write(&rc, "# empty\n").unwrap();
        let instance = format!(
            "chatde{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        );

        let mut command = Command::new(env!("CARGO_BIN_EXE_chatd"));
        command
            .args(["-p", "0", "-w", "3"])
            .arg("-d")
            .arg(dir.path().join("data"))
            .arg("-c")
            .arg(&rc)
            .env("RUST_LOG", "chatd=info")
            .env("CHATD_INSTANCE", &instance)
            .env("CHATD_HASH_COST", "256")
            .env("CHATD_SYNC_WRITES", "0")
            .env("CHATD_READ_TIMEOUT_MS", "2000")
            .env("CHATD_SHUTDOWN_TIMEOUT_MS", "3000")
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in env {
            command.env(key, value);
        }
        let mut child = command.spawn().expect("spawn chatd");

        // Keep draining stdout so the server never blocks on a full pipe
        let stdout = child.stdout.take().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if let Some(rest) = line.split("listening on ").nth(1) {
                    let _ = tx.send(rest.trim().to_string());
                }
            }
        });

        let addr = match rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(addr) => addr.parse().unwrap(),
            Err(_) => {
                let _ = child.kill();
                panic!("chatd did not report its address");
            }
        };

        Self {
            child: Some(child),
            addr,
            instance,
            dir,
        }
    }

    pub fn connect(&self) -> Conn {
        let client = ChatClient::connect(self.addr).unwrap();
        client.set_timeout(Some(Duration::from_secs(10))).unwrap();
        Conn { client }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.as_ref().unwrap().id() as i32)
    }

    /// SIGTERM the server and wait for it to exit
    pub fn stop(mut self) -> ExitStatus {
        self.terminate()
    }

    fn terminate(&mut self) -> ExitStatus {
        let mut child = self.child.take().unwrap();
        kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
        wait_timeout(&mut child, Duration::from_secs(15)).expect("chatd did not stop")
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
            if wait_timeout(&mut child, Duration::from_secs(10)).is_none() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

/// One client connection
pub struct Conn {
    pub client: ChatClient,
}

impl Conn {
    pub fn send(&mut self, op: OpType, object: ObjectType, fields: &[&str]) -> Reply {
        self.client.request(op, object, fields).unwrap()
    }

    /// Create `name` with token `tok_<name>` and log in on this connection
    pub fn register(&mut self, name: &str) -> u32 {
        let token = format!("tok_{}", name);
        let created = self.send(OpType::Create, ObjectType::User, &[&token, name, "password1"]);
        assert_eq!(created.status, 201, "{:?}", created);
        let login = self.send(OpType::Create, ObjectType::Auth, &[&token, "password1"]);
        assert_eq!(login.status, 200, "{:?}", login);
        login.fields[0].parse().unwrap()
    }
}

/// Poll `check` until it holds or `timeout` passes
pub fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
}
