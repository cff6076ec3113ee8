mod client;

pub use client::TrackerClient;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::proto::{self, TrackerCommand};
use crate::wire::{Connection, WireError};

/// One peer known to the registry: where it listens and the bitmap it
/// last reported. Keyed by (ip, port) within a file id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub bitfield_hex: String,
}

/// In-memory peer directory: file id to the set of registered peers.
/// Entirely volatile; peers are never expired, and everything is lost on
/// restart.
#[derive(Default)]
pub struct Registry {
    peers: Mutex<HashMap<String, Vec<PeerRecord>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upserts the record for (ip, port) under `file_id`. Re-registering
    /// replaces the stored bitmap rather than duplicating the entry.
    pub async fn register(&self, file_id: &str, ip: IpAddr, port: u16, bitfield_hex: String) {
        let mut peers = self.peers.lock().await;
        let records = peers.entry(file_id.to_string()).or_default();
        match records.iter_mut().find(|r| r.ip == ip && r.port == port) {
            Some(record) => record.bitfield_hex = bitfield_hex,
            None => records.push(PeerRecord {
                ip,
                port,
                bitfield_hex,
            }),
        }
    }

    /// Snapshot of peer addresses for `file_id`, omitting every record at
    /// the requester's own address. Unknown file ids yield an empty list.
    pub async fn peers_for(&self, file_id: &str, requester: IpAddr) -> Vec<SocketAddr> {
        let peers = self.peers.lock().await;
        peers
            .get(file_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.ip != requester)
                    .map(|r| SocketAddr::new(r.ip, r.port))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn record_count(&self, file_id: &str) -> usize {
        self.peers
            .lock()
            .await
            .get(file_id)
            .map_or(0, |records| records.len())
    }

    /// Applies one tracker command and produces the single reply line.
    /// UPDATE is acknowledged but deliberately mutates nothing; peers
    /// refresh their full bitmap with their next REGISTER.
    pub async fn handle(&self, command: TrackerCommand, requester: IpAddr) -> String {
        match command {
            TrackerCommand::Register {
                file_id,
                port,
                bitfield_hex,
            } => {
                info!(%file_id, peer = %requester, port, bitfield = %bitfield_hex, "peer registered");
                self.register(&file_id, requester, port, bitfield_hex).await;
                proto::OK.to_string()
            }
            TrackerCommand::GetPeers { file_id } => {
                let peers = self.peers_for(&file_id, requester).await;
                debug!(%file_id, peer = %requester, count = peers.len(), "peer list served");
                proto::peers_line(&peers)
            }
            TrackerCommand::Update {
                file_id,
                piece_index,
            } => {
                debug!(%file_id, peer = %requester, piece_index, "update acknowledged");
                proto::OK.to_string()
            }
        }
    }
}

/// Accept loop for the tracker. Each connection gets its own task; a
/// handler failure never reaches the loop or any other connection.
pub async fn run_tracker(
    listener: TcpListener,
    registry: Arc<Registry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("tracker listener has no local addr")?;
    info!(%addr, "tracker listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("tracker shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("tracker accept failed: {e}");
                        continue;
                    }
                };
                debug!(peer = %peer_addr, "tracker connection accepted");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, peer_addr, registry).await {
                        debug!(peer = %peer_addr, "tracker connection ended: {e:#}");
                    }
                });
            }
        }
    }
}

/// One logical session: newline-terminated commands in, one reply line
/// per command out. Malformed commands get an ERROR reply and the
/// connection stays open; transport errors end the session.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
) -> Result<()> {
    let mut conn = Connection::new(stream);

    loop {
        let line = match conn.recv_line().await {
            Ok(line) => line,
            Err(WireError::Closed) => return Ok(()),
            Err(e) => return Err(e).context("tracker receive failed"),
        };
        if line.is_empty() {
            continue;
        }

        let reply = match TrackerCommand::parse(&line) {
            Ok(command) => registry.handle(command, peer_addr.ip()).await,
            Err(msg) => {
                warn!(peer = %peer_addr, %line, "rejected tracker command");
                proto::error_line(&msg)
            }
        };

        conn.send_line(&reply)
            .await
            .context("tracker reply failed")?;
    }
}
