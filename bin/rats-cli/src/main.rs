//! Interactive rats node.
//!
//! Starts a mesh node from a config file and drives it from stdin:
//! connect to peers, broadcast and send messages, poke the DHT, and
//! push files around. This is a demo shell around the library, not part
//! of the mesh engine itself.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use rats::{
    DisconnectReason, InfoHash, MeshHandler, PeerHash, RatsClient, Transfer, TransferHandler,
    TransferOffer, Uuid,
};

/// Rats mesh demo node.
#[derive(Parser)]
#[command(name = "rats-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rats.json")]
    config: PathBuf,

    /// Listen port for a freshly generated configuration
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Prints mesh events as they happen.
struct Shell;

impl MeshHandler for Shell {
    fn on_connect(&self, peer: PeerHash) {
        println!("* connected: {peer}");
    }

    fn on_message(&self, peer: PeerHash, payload: &[u8]) {
        println!("* [{peer}] {} bytes", payload.len());
    }

    fn on_string(&self, peer: PeerHash, text: &str) {
        println!("* [{peer}] {text}");
    }

    fn on_disconnect(&self, peer: PeerHash, reason: DisconnectReason) {
        println!("* disconnected: {peer} ({reason})");
    }
}

/// Accepts every offer and narrates progress.
struct AcceptAll;

impl TransferHandler for AcceptAll {
    fn on_offer(&self, offer: &TransferOffer) -> bool {
        println!(
            "* incoming file {} ({} bytes) from {}",
            offer.filename, offer.total_bytes, offer.peer
        );
        true
    }

    fn on_complete(&self, transfer: &Transfer) {
        println!(
            "* transfer {} {}: {}",
            transfer.id, transfer.filename, transfer.status
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to set up logging");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = RatsClient::open(&cli.config, cli.port).context("loading configuration")?;
    client.set_mesh_handler(Arc::new(Shell));
    client.set_transfer_handler(Arc::new(AcceptAll));
    client.start().await.context("starting node")?;

    println!("rats node up");
    println!("  node id: {}", client.node_id().to_hex());
    println!("  peer hash: {}", client.local_hash().await?.to_hex());
    println!("  listening: {}", client.listen_addr().await?);
    println!("type 'help' for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_command(&client, line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        eprintln!("stdin error: {err}");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    client.stop().await;
    println!("bye");
    Ok(())
}

/// Executes one command line. Returns false to quit.
async fn handle_command(client: &RatsClient, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    let args: Vec<&str> = parts.collect();

    match command {
        "help" => {
            println!("commands:");
            println!("  connect <host> <port>        dial a peer");
            println!("  list                         connected peers");
            println!("  broadcast <text>             message every peer");
            println!("  send <peer> <text>           message one peer");
            println!("  dht_find <infohash-hex>      look up peers for a hash");
            println!("  dht_announce <hex> <port>    announce under a hash");
            println!("  file_send <peer> <path>      offer a file");
            println!("  transfer_list                transfer states");
            println!("  pause|resume|cancel <id>     control a transfer");
            println!("  quit                         shut down");
        }

        "connect" => match (args.first(), args.get(1).and_then(|p| p.parse::<u16>().ok())) {
            (Some(host), Some(port)) => match client.connect(host, port).await {
                Ok(peer) => println!("connected to {peer}"),
                Err(err) => eprintln!("connect failed: {err}"),
            },
            _ => eprintln!("usage: connect <host> <port>"),
        },

        "list" => {
            let peers = client.peers().await;
            if peers.is_empty() {
                println!("no peers");
            }
            for peer in peers {
                println!(
                    "{}  {}  {}  up {} B / down {} B",
                    peer.hash.to_hex(),
                    peer.remote_addr,
                    if peer.outbound { "outbound" } else { "inbound" },
                    peer.stats.bytes_sent,
                    peer.stats.bytes_received,
                );
            }
        }

        "broadcast" => {
            let text = args.join(" ");
            match client.broadcast_string(&text).await {
                Ok(count) => println!("delivered to {count} peer(s)"),
                Err(err) => eprintln!("broadcast failed: {err}"),
            }
        }

        "send" => match args.split_first() {
            Some((peer, rest)) if !rest.is_empty() => match parse_peer(peer) {
                Some(peer) => {
                    let text = rest.join(" ");
                    if let Err(err) = client.send_string(peer, &text).await {
                        eprintln!("send failed: {err}");
                    }
                }
                None => eprintln!("bad peer hash"),
            },
            _ => eprintln!("usage: send <peer> <text>"),
        },

        "dht_find" => match args.first().and_then(|h| InfoHash::from_hex(h).ok()) {
            Some(info_hash) => match client.find_peers(info_hash).await {
                Ok(peers) if peers.is_empty() => println!("no peers found"),
                Ok(peers) => {
                    for peer in peers {
                        println!("{peer}");
                    }
                }
                Err(err) => eprintln!("lookup failed: {err}"),
            },
            None => eprintln!("usage: dht_find <40-char hex>"),
        },

        "dht_announce" => {
            match (
                args.first().and_then(|h| InfoHash::from_hex(h).ok()),
                args.get(1).and_then(|p| p.parse::<u16>().ok()),
            ) {
                (Some(info_hash), Some(port)) => match client.announce(info_hash, port).await {
                    Ok(count) => println!("announce accepted by {count} node(s)"),
                    Err(err) => eprintln!("announce failed: {err}"),
                },
                _ => eprintln!("usage: dht_announce <40-char hex> <port>"),
            }
        }

        "file_send" => match (args.first().and_then(|p| parse_peer(p)), args.get(1)) {
            (Some(peer), Some(path)) => {
                match client.send_file(peer, PathBuf::from(path)).await {
                    Ok(id) => println!("transfer {id} started"),
                    Err(err) => eprintln!("file_send failed: {err}"),
                }
            }
            _ => eprintln!("usage: file_send <peer> <path>"),
        },

        "transfer_list" => {
            let transfers = client.transfers().await;
            if transfers.is_empty() {
                println!("no transfers");
            }
            for t in transfers {
                println!(
                    "{}  {}  {}  {:.0}%  {:.1} KiB/s",
                    t.id,
                    t.filename,
                    t.status,
                    t.progress() * 100.0,
                    t.byte_rate / 1024.0,
                );
            }
        }

        "pause" | "resume" | "cancel" => match args.first().and_then(|s| s.parse::<Uuid>().ok()) {
            Some(id) => {
                let result = match command {
                    "pause" => client.pause_transfer(id).await,
                    "resume" => client.resume_transfer(id).await,
                    _ => client.cancel_transfer(id).await,
                };
                if let Err(err) = result {
                    eprintln!("{command} failed: {err}");
                }
            }
            None => eprintln!("usage: {command} <transfer-id>"),
        },

        "quit" | "exit" => return false,

        other => eprintln!("unknown command: {other} (try 'help')"),
    }
    true
}

fn parse_peer(text: &str) -> Option<PeerHash> {
    PeerHash::from_hex(text).ok()
}
