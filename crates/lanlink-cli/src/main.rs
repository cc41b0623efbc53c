//! Lanlink CLI - reliable messaging and file transfer over UDP
//!
//! Starts one device and drives it from an interactive console:
//!
//! ```bash
//! # First device on the default bootstrap port
//! lanlink --name alice --port 5000
//!
//! # Second device finds the first through the bootstrap address
//! lanlink --name bob --port 5001
//! ```
//!
//! All protocol logic lives in `lanlink-core`; this binary only reads
//! commands, dispatches to the device, and prints results.

#![allow(clippy::doc_markdown)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use lanlink_core::config::DeviceConfig;
use lanlink_core::device::{Device, DeviceEvent};

/// Reliable messaging and file transfer over UDP on local networks.
#[derive(Debug, Parser)]
#[command(name = "lanlink", version)]
struct Cli {
    /// Name announced to peers (must be unique on the network)
    #[arg(long)]
    name: String,

    /// UDP port to listen on
    #[arg(long, default_value_t = lanlink_core::DEFAULT_PORT)]
    port: u16,

    /// Address heartbeats bootstrap to while no peers are known
    #[arg(long, default_value = "127.0.0.1:5000")]
    bootstrap: SocketAddr,

    /// Directory verified inbound files are saved into
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = DeviceConfig::new(cli.name, cli.port)
        .bootstrap(cli.bootstrap)
        .download_dir(cli.download_dir);

    let device = Device::bind(config)?;
    tracing::info!(
        "lanlink {} listening on {}",
        lanlink_core::VERSION,
        device.local_addr()?
    );
    device.start();

    tokio::spawn(print_events(device.clone()));

    println!("Type 'help' for the command list.");
    repl(&device).await?;

    device.stop();
    Ok(())
}

async fn repl(device: &Device) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("peers") => {
                let peers = device.list_active_peers().await;
                if peers.is_empty() {
                    println!("no active peers");
                }
                for peer in peers {
                    println!(
                        "{} @ {} (last heartbeat {:.1}s ago)",
                        peer.name,
                        peer.addr,
                        peer.age.as_secs_f64()
                    );
                }
            }
            Some("talk") => {
                let Some(target) = parts.next() else {
                    println!("usage: talk <peer> <message...>");
                    continue;
                };
                let text = parts.collect::<Vec<_>>().join(" ");
                match device.send_message(target, &text).await {
                    Ok(id) => println!("message {id} sent (awaiting acknowledgment)"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("sendfile") => {
                let (Some(target), Some(path)) = (parts.next(), parts.next()) else {
                    println!("usage: sendfile <peer> <path>");
                    continue;
                };
                match device.send_file(target, path).await {
                    Ok(id) => println!("transfer {id} offered to {target}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("save") => {
                let (Some(id), Some(path)) = (parts.next(), parts.next()) else {
                    println!("usage: save <transfer-id> <path>");
                    continue;
                };
                match device.save_received_transfer(id, path).await {
                    Ok(()) => println!("saved transfer {id} to {path}"),
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("help") => {
                println!("commands:");
                println!("  peers                     list active peers");
                println!("  talk <peer> <message...>  send a reliable text message");
                println!("  sendfile <peer> <path>    transfer a file");
                println!("  save <id> <path>          save a received transfer elsewhere");
                println!("  quit                      stop the device and exit");
            }
            Some("quit" | "exit") => break,
            Some(other) => println!("unknown command '{other}' (try 'help')"),
            None => {}
        }
    }

    Ok(())
}

async fn print_events(device: Device) {
    let mut events = device.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            DeviceEvent::PeerDiscovered { name, addr } => {
                println!("* peer '{name}' discovered at {addr}");
            }
            DeviceEvent::TalkReceived { from, text } => {
                println!("* message from {from}: {text}");
            }
            DeviceEvent::TransferOffered {
                id,
                filename,
                size,
                from,
            } => {
                println!("* incoming file '{filename}' ({size} bytes) from {from}, id {id}");
            }
            DeviceEvent::TransferComplete { id, path } => {
                println!("* transfer {id} verified and saved to {}", path.display());
            }
            DeviceEvent::TransferRejected { id } => {
                println!("* transfer {id} failed its integrity check");
            }
            DeviceEvent::OutboundFinished { id } => {
                println!("* file transfer {id} completed successfully");
            }
            DeviceEvent::OutboundFailed { id, reason } => {
                println!("* file transfer {id} failed: {reason}");
            }
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,lanlink=info,lanlink_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
