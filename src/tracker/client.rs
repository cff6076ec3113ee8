use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tracing::debug;

use crate::bitfield::Bitfield;
use crate::proto::{self, TrackerCommand};
use crate::wire::Connection;
use crate::PieceIndex;

/// Client side of the registry protocol. Each call opens its own
/// connection, issues one command, and reads the single reply line.
#[derive(Debug, Clone, Copy)]
pub struct TrackerClient {
    addr: SocketAddr,
}

impl TrackerClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn round_trip(&self, command: TrackerCommand) -> Result<String> {
        let stream = TcpStream::connect(self.addr)
            .await
            .with_context(|| format!("failed to connect to tracker {}", self.addr))?;
        let mut conn = Connection::new(stream);

        conn.send_line(&command.to_string())
            .await
            .context("failed to send tracker command")?;
        conn.recv_line()
            .await
            .context("failed to receive tracker reply")
    }

    /// Announces this peer's listen port and current bitmap. The tracker
    /// upserts, so re-registering refreshes the stored bitmap.
    pub async fn register(&self, file_id: &str, listen_port: u16, bitfield: &Bitfield) -> Result<()> {
        let reply = self
            .round_trip(TrackerCommand::Register {
                file_id: file_id.to_string(),
                port: listen_port,
                bitfield_hex: bitfield.to_hex(),
            })
            .await?;
        if reply != proto::OK {
            bail!("tracker rejected REGISTER: {reply}");
        }
        debug!(%file_id, listen_port, "registered with tracker");
        Ok(())
    }

    /// Fetches the peers currently known for `file_id`. The tracker
    /// already excludes this peer's own address.
    pub async fn get_peers(&self, file_id: &str) -> Result<Vec<SocketAddr>> {
        let reply = self
            .round_trip(TrackerCommand::GetPeers {
                file_id: file_id.to_string(),
            })
            .await?;
        let peers = proto::parse_peers_line(&reply)
            .map_err(|msg| anyhow::anyhow!("bad GETPEERS reply: {msg}"))?;
        debug!(%file_id, count = peers.len(), "got peers from tracker");
        Ok(peers)
    }

    /// Notifies the tracker of a newly acquired piece. Accepted but
    /// side-effect-free on the tracker side.
    pub async fn update(&self, file_id: &str, piece_index: PieceIndex) -> Result<()> {
        let reply = self
            .round_trip(TrackerCommand::Update {
                file_id: file_id.to_string(),
                piece_index,
            })
            .await?;
        if reply != proto::OK {
            bail!("tracker rejected UPDATE: {reply}");
        }
        Ok(())
    }
}
