// ChunkPod node: chunk server, subnet discovery, and upload/download client.

mod client;
mod config;
mod discovery;
mod download;
mod registry;
mod server;
mod store;
mod transport;
mod upload;

use std::path::PathBuf;

use anyhow::Context;
use chunkpod_core::{FileId, Node};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::client::{Client, ClientSettings};
use crate::config::Config;
use crate::registry::PeerRegistry;
use crate::server::ServerState;
use crate::store::ChunkStore;

#[derive(Parser)]
#[command(name = "chunkpod", version)]
#[command(about = "Split files into chunks and scatter them across LAN peers")]
struct Cli {
    /// Config file (TOML). Without it the default search paths are tried.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Listening port of this node and of the peers it scans for.
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chunk server until interrupted.
    Serve {
        /// Scan the local subnet once at startup.
        #[arg(long)]
        discover: bool,
    },
    /// Scan the local subnet and list responding peers.
    Discover,
    /// Split a file and distribute its chunks.
    Upload {
        path: PathBuf,
        #[command(flatten)]
        peers: PeerArgs,
    },
    /// Collect a file's chunks from peers and rebuild it.
    Download {
        file_id: FileId,
        #[command(flatten)]
        peers: PeerArgs,
        /// Directory the rebuilt file is written to.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// List files with chunks in the local store.
    Stored,
}

#[derive(Args)]
struct PeerArgs {
    /// Known peer (a.b.c.d:port); repeatable.
    #[arg(long = "peer")]
    peers: Vec<Node>,
    /// Skip the subnet scan and use only configured peers.
    #[arg(long)]
    no_scan: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chunkpod=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        cfg.port = port;
    }

    match cli.command {
        Command::Serve { discover } => serve(cfg, discover).await,
        Command::Discover => {
            let client = build_client(&cfg, &[], true).await?;
            client.discover(cfg.scan_prefix_len, cfg.port).await?;
            for peer in client.registry().snapshot().await {
                println!("{peer}");
            }
            Ok(())
        }
        Command::Upload { path, peers } => {
            let client = build_client(&cfg, &peers.peers, !peers.no_scan).await?;
            if !peers.no_scan {
                client.discover(cfg.scan_prefix_len, cfg.port).await?;
            }
            let report = client.upload_file(&path).await?;
            for (order, receiver) in &report.receivers {
                info!(order, %receiver, "chunk placed");
            }
            info!(chunks = report.num_chunks, "upload delivered");
            println!("{}", report.file_id);
            Ok(())
        }
        Command::Download {
            file_id,
            peers,
            out,
        } => {
            if let Some(dir) = out {
                cfg.output_dir = dir;
            }
            let client = build_client(&cfg, &peers.peers, !peers.no_scan).await?;
            if !peers.no_scan {
                client.discover(cfg.scan_prefix_len, cfg.port).await?;
            }
            let report = client.download_file(file_id).await?;
            info!(
                file_id = %report.file_id,
                bytes = report.size,
                retried = ?report.retried,
                "file rebuilt"
            );
            println!("{}", report.path.display());
            Ok(())
        }
        Command::Stored => {
            let store = open_store(&cfg)?;
            for f in store.stored_files().await? {
                println!(
                    "{}  {}/{}  {}",
                    f.file_id, f.chunks_held, f.num_chunks, f.file_name
                );
            }
            Ok(())
        }
    }
}

/// Registry seeded with configured and command-line peers.
async fn seeded_registry(
    cfg: &Config,
    extra: &[Node],
    scanning: bool,
) -> anyhow::Result<PeerRegistry> {
    let registry = PeerRegistry::new(discovery::local_node(cfg.port, scanning)?);
    let added = registry
        .extend(cfg.peers.iter().chain(extra.iter()).copied())
        .await;
    if added > 0 {
        info!(peers = added, "seeded static peers");
    }
    Ok(registry)
}

async fn build_client(cfg: &Config, extra: &[Node], scanning: bool) -> anyhow::Result<Client> {
    Ok(Client::new(
        seeded_registry(cfg, extra, scanning).await?,
        ClientSettings::from_config(cfg),
    ))
}

fn open_store(cfg: &Config) -> anyhow::Result<ChunkStore> {
    ChunkStore::open(&cfg.db_path)
        .with_context(|| format!("opening chunk store {}", cfg.db_path.display()))
}

async fn serve(cfg: Config, discover: bool) -> anyhow::Result<()> {
    let store = open_store(&cfg)?;
    let registry = seeded_registry(&cfg, &[], discover).await?;
    let listener = server::bind(cfg.port)
        .await
        .with_context(|| format!("binding port {}", cfg.port))?;

    if discover {
        let client = Client::new(registry.clone(), ClientSettings::from_config(&cfg));
        let (prefix, port) = (cfg.scan_prefix_len, cfg.port);
        tokio::spawn(async move {
            if let Err(e) = client.discover(prefix, port).await {
                warn!(error = %e, "discovery failed");
            }
        });
    }

    let state = ServerState::new(cfg.port, registry, store);
    tokio::select! {
        res = server::run_server(listener, state, cfg.workers, cfg.idle_timeout()) => {
            res.context("server stopped")?;
        }
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
