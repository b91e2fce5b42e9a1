// Sluice: offer files to peers over TCP and receive them after approval.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sluice_core::events::OfferEvent;
use sluice_core::{Event, EventKind, PeerId};
use sluice_node::{
    config, downloads, keystore, logging, Config, Node, OutgoingFile, PeerAddr, TransferProtocol,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Peer-to-peer file offers with explicit accept/reject")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for offers and save accepted files.
    Listen {
        #[arg(long)]
        port: Option<u16>,
        /// Accept every offer without prompting.
        #[arg(long)]
        accept_all: bool,
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Offer one file to a listening peer.
    Send {
        /// host:port of the receiver.
        addr: String,
        path: PathBuf,
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Only offer the file if the receiver's hello names this peer id (hex).
        #[arg(long, value_parser = PeerId::from_str)]
        peer: Option<PeerId>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli, cfg))
}

async fn run(cli: Cli, mut cfg: Config) -> anyhow::Result<()> {
    let identity = cfg.identity_path();
    let keypair = keystore::load_or_create(&identity)
        .await
        .with_context(|| format!("loading identity from {}", identity.display()))?;
    let node = Node::new(Arc::new(keypair)).with_max_frame_len(cfg.max_frame_len);
    let protocol = TransferProtocol::new();

    match cli.command {
        Command::Listen {
            port,
            accept_all,
            download_dir,
        } => {
            cfg.listen_port = port.unwrap_or(cfg.listen_port);
            cfg.auto_accept |= accept_all;
            if download_dir.is_some() {
                cfg.download_dir = download_dir;
            }
            listen(node, protocol, &cfg).await
        }
        Command::Send {
            addr,
            path,
            chunk_size,
            peer,
        } => {
            let chunk_size = chunk_size.unwrap_or(cfg.chunk_size);
            send(node, protocol, &addr, peer, &path, chunk_size).await
        }
    }
}

async fn listen(node: Node, protocol: TransferProtocol, cfg: &Config) -> anyhow::Result<()> {
    let download_dir = cfg.download_dir().to_path_buf();
    tokio::fs::create_dir_all(&download_dir)
        .await
        .with_context(|| format!("creating {}", download_dir.display()))?;

    let (tx, mut events) = mpsc::unbounded_channel::<Event>();
    for kind in [
        EventKind::IncomingOffer,
        EventKind::IncomingComplete,
        EventKind::IncomingError,
    ] {
        let tx = tx.clone();
        protocol.subscribe(kind, move |e| {
            tx.send(e.clone())?;
            Ok(())
        });
    }
    protocol.subscribe(EventKind::IncomingProgress, |e| {
        if let Event::IncomingProgress(p) = e {
            tracing::debug!(
                id = %p.id,
                received = p.received_bytes,
                total = p.total_bytes,
                rate_mbps = p.rate_mbps,
                "progress"
            );
        }
        Ok(())
    });

    protocol.register_handler(&node);
    let addr = node
        .listen(([0, 0, 0, 0], cfg.listen_port).into())
        .await
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    println!("listening on {addr} as {}", node.peer_id());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                Event::IncomingOffer(offer) => {
                    let approved = cfg.auto_accept || prompt(&mut stdin, &offer).await?;
                    if approved {
                        protocol.accept(offer.id).await;
                    } else {
                        protocol.reject(offer.id).await;
                        protocol.remove(offer.id).await;
                    }
                }
                Event::IncomingComplete(done) => match downloads::store(&protocol, &download_dir, &done).await {
                    Some(path) => println!("received {} ({} bytes) -> {}", done.name, done.payload.len(), path.display()),
                    None => eprintln!("received {} but could not save it", done.name),
                },
                Event::IncomingError(failed) => {
                    eprintln!("transfer {} failed: {}", failed.id, failed.message);
                    protocol.remove(failed.id).await;
                }
                _ => {}
            },
            r = &mut shutdown => {
                r?;
                break;
            }
        }
    }
    Ok(())
}

async fn prompt(
    stdin: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    offer: &OfferEvent,
) -> anyhow::Result<bool> {
    print!(
        "{} offers {} ({} bytes, {}). Accept? [y/N] ",
        offer.from_peer, offer.name, offer.size, offer.mime_type
    );
    std::io::stdout().flush()?;
    let answer = stdin.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn send(
    node: Node,
    protocol: TransferProtocol,
    addr: &str,
    peer: Option<PeerId>,
    path: &Path,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let resolved = tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("resolving {addr}"))?
        .next()
        .with_context(|| format!("no address for {addr}"))?;
    let target = PeerAddr {
        addr: resolved,
        peer,
    };
    let file = OutgoingFile::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let report = protocol
        .send(&node, target, file, chunk_size, |sent, total| {
            eprint!("\r{sent}/{total} bytes");
        })
        .await?;
    if report.accepted {
        eprintln!();
        println!("sent {} bytes", report.bytes_sent);
    } else {
        println!("offer rejected by peer");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
