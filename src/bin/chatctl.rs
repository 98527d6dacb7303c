//! chatctl: send one dispatch to a chatd server and print the reply
//!
//! ```text
//! chatctl create user tok1 alice secret1
//! chatctl --server 127.0.0.1:9090 read channel general
//! ```
//!
//! Each invocation is a new connection, so it is logged out again on exit.
//! Use `--session` to run several requests over one connection.

use anyhow::{anyhow, bail, Context, Result};
use chatd::server::client::{ChatClient, Reply};
use chatd::server::protocol::{ObjectType, OpType};
use clap::Parser;
use std::io::{self, BufRead};
use std::process;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "chatctl", version, about = "Send dispatches to a chatd server")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    server: String,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Read further requests from stdin, one per line, over the same connection
    #[arg(long)]
    session: bool,

    /// Operation: create, read, update, destroy, ping-user, ping-channel, or a number
    op: String,

    /// Object: user, channel, message, auth, or a number
    object: String,

    /// Request fields
    fields: Vec<String>,
}

fn parse_op(s: &str) -> Result<OpType> {
    if let Ok(code) = s.parse::<u8>() {
        return Ok(OpType::from_code(code));
    }
    OpType::from_name(s).ok_or_else(|| anyhow!("unknown operation '{}'", s))
}

fn parse_object(s: &str) -> Result<ObjectType> {
    if let Ok(code) = s.parse::<u8>() {
        return Ok(ObjectType::from_code(code));
    }
    ObjectType::from_name(s).ok_or_else(|| anyhow!("unknown object '{}'", s))
}

fn print_reply(reply: &Reply) {
    println!("{}", reply.status);
    for field in &reply.fields {
        println!("  {}", field);
    }
}

fn send(client: &mut ChatClient, op: &str, object: &str, fields: &[String]) -> Result<Reply> {
    let op = parse_op(op)?;
    let object = parse_object(object)?;
    let reply = client.request(op, object, fields).context("request failed")?;
    print_reply(&reply);
    Ok(reply)
}

fn run() -> Result<bool> {
    let args = Args::parse();
    let mut client = ChatClient::connect(args.server.as_str())
        .with_context(|| format!("cannot connect to {}", args.server))?;
    client.set_timeout(Some(Duration::from_secs(args.timeout)))?;

    let mut ok = send(&mut client, &args.op, &args.object, &args.fields)?.is_success();
    if !args.session {
        return Ok(ok);
    }

    for line in io::stdin().lock().lines() {
        let line = line?;
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        match words.as_slice() {
            [] => continue,
            [op, object, fields @ ..] => {
                ok &= send(&mut client, op, object, fields)?.is_success();
            }
            [_] => bail!("expected '<op> <object> [field]...', got '{}'", line),
        }
    }
    Ok(ok)
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(e) => {
            eprintln!("chatctl: {:#}", e);
            process::exit(1);
        }
    }
}
