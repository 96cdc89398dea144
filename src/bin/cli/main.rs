#![cfg(feature = "cli")]

use async_std::io::{ReadExt, WriteExt};
use async_std::net::TcpStream;
use clap::Parser;
use std::time::Duration;
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

/// Global CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Daemon TCP address
    #[arg(long, default_value = "127.0.0.1:10435")]
    host: String,

    /// Send over the message bus instead of TCP, e.g. tcp://127.0.0.1:10436
    #[arg(short, long)]
    bus: Option<String>,

    /// Bus name of the daemon
    #[arg(long, default_value = "mechd")]
    server: String,

    /// Send as an executive request (bus only)
    #[arg(short, long)]
    exec: bool,

    /// Seconds to wait for the reply
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,

    /// Verb and arguments, e.g. `move focus 12.5`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

/// Entry point
#[async_std::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let line = cli.command.join(" ");
    let wait = Duration::from_secs(cli.timeout);

    let reply = match &cli.bus {
        Some(endpoint) => async_std::future::timeout(wait, send_bus(&cli, endpoint, &line)).await,
        None => async_std::future::timeout(wait, send_tcp(&cli.host, &line)).await,
    };

    let reply = match reply {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("Error: no reply within {} s", cli.timeout);
            std::process::exit(1);
        }
    };

    println!("{}", reply);
    if reply.starts_with("ERROR") || reply.starts_with("FATAL") {
        std::process::exit(1);
    }
    Ok(())
}

/// One request line over TCP; the daemon closes the connection after replying
async fn send_tcp(host: &str, line: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(host).await?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(reply.trim_end().to_string())
}

/// One envelope over the bus, printed back in `TAG: body` form
async fn send_bus(
    cli: &Cli,
    endpoint: &str,
    line: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let me = format!("mechctl-{}", std::process::id());
    let kind = if cli.exec { "EXEC" } else { "REQ" };

    let mut socket = DealerSocket::new();
    socket.connect(endpoint).await?;
    socket
        .send(ZmqMessage::from(format!("{}>{} {} {}", me, cli.server, kind, line)))
        .await?;

    let reply = socket.recv().await?;
    let text = match reply.into_vec().pop() {
        Some(frame) => String::from_utf8(frame.to_vec())?,
        None => String::new(),
    };

    // `mechd>me TAG body`
    let mut parts = text.splitn(3, ' ');
    let _route = parts.next();
    let tag = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    Ok(format!("{}: {}", tag, body))
}
