#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use chatd::server::config::ServerConfig;
use chatd::server::ChatServer;
use clap::Parser;
use std::io::IsTerminal;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Multi-process chat server
#[derive(Debug, Parser)]
#[command(name = "chatd", version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long)]
    ip: Option<Ipv4Addr>,

    /// Port to listen on; 0 picks a free port
    #[arg(short, long)]
    port: Option<u16>,

    /// Trace-level logging
    #[arg(short, long)]
    trace: bool,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Directory holding the store files
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// rc file of CHATD_* settings
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(ip) = self.ip {
            config.ip = ip;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.pool_size = workers;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        config.trace |= self.trace;
    }
}

fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("chatd=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatd=info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout)
        .try_init();
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    init_tracing(config.trace);

    ChatServer::new(config).start().context("server failed")
}

fn main() {
    if let Err(e) = run() {
        eprintln!("chatd: {:#}", e);
        process::exit(1);
    }
}
