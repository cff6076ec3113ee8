use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use seedshare::config::{Mode, PeerConfig};
use seedshare::peer::{run_upload, Downloader};
use seedshare::session::FileSession;
use seedshare::tracker::{run_tracker, Registry, TrackerClient};

#[derive(Parser)]
#[command(name = "seedshare", about = "Minimal tracker-based P2P file sharing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the central peer registry
    Tracker {
        #[arg(long, default_value_t = 6881)]
        port: u16,
    },
    /// Run a peer (seed or download) for one shared file
    Peer {
        /// "seed" if the complete file is present, "download" otherwise
        mode: String,
        #[arg(long)]
        file_id: String,
        #[arg(long)]
        path: PathBuf,
        /// Total file size in bytes
        #[arg(long)]
        size: u64,
        /// Local port the upload engine listens on
        #[arg(long)]
        port: u16,
        /// Tracker address, e.g. 127.0.0.1:6881
        #[arg(long)]
        tracker: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seedshare=info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Tracker { port } => run_tracker_process(port).await,
        Command::Peer {
            mode,
            file_id,
            path,
            size,
            port,
            tracker,
        } => {
            let mode = match mode.as_str() {
                "seed" => Mode::Seed,
                "download" => Mode::Download,
                other => bail!("invalid mode {other:?}, expected \"seed\" or \"download\""),
            };
            let config = PeerConfig::new(mode, file_id, path, size, port, tracker);
            run_peer_process(config).await
        }
    }
}

async fn run_tracker_process(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind tracker port {port}"))?;
    let registry = Registry::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let tracker = tokio::spawn(run_tracker(listener, registry, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = tracker.await;
    Ok(())
}

async fn run_peer_process(config: PeerConfig) -> Result<()> {
    if config.mode == Mode::Seed && !config.path.exists() {
        bail!(
            "seed mode requires the file to exist: {}",
            config.path.display()
        );
    }

    let session = FileSession::new(
        &config.file_id,
        &config.path,
        config.file_size,
        config.mode == Mode::Seed,
    );
    info!(
        file_id = session.file_id(),
        path = %session.path().display(),
        size = session.file_size(),
        pieces = session.piece_count(),
        mode = ?config.mode,
        "session opened"
    );

    let tracker = TrackerClient::new(config.tracker_addr);
    tracker
        .register(
            session.file_id(),
            config.listen_port,
            &session.bitfield().await,
        )
        .await
        .context("initial tracker registration failed")?;

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .with_context(|| format!("failed to bind listen port {}", config.listen_port))?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let upload = tokio::spawn(run_upload(
        listener,
        Arc::clone(&session),
        shutdown_tx.subscribe(),
    ));

    if config.mode == Mode::Download {
        let downloader = Downloader::new(Arc::clone(&session), tracker, config.clone());
        tokio::select! {
            result = downloader.run() => {
                result.context("download failed")?;
                // Re-register so other peers see the full bitmap.
                if let Err(e) = tracker
                    .register(session.file_id(), config.listen_port, &session.bitfield().await)
                    .await
                {
                    warn!("post-download re-register failed: {e:#}");
                }
                info!("download complete, now seeding");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = shutdown_tx.send(());
                let _ = upload.await;
                return Ok(());
            }
        }
    }

    tokio::signal::ctrl_c().await.context("signal wait failed")?;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    let _ = upload.await;
    Ok(())
}
