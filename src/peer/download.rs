use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::config::PeerConfig;
use crate::proto::{self, PeerCommand, PieceHeader};
use crate::session::FileSession;
use crate::tracker::TrackerClient;
use crate::wire::Connection;
use crate::PieceIndex;

/// Pulls missing pieces from discovered peers until the local bitmap is
/// entirely true. Peers are processed sequentially, one outstanding
/// request at a time per connection.
pub struct Downloader {
    session: Arc<FileSession>,
    tracker: TrackerClient,
    config: PeerConfig,
}

impl Downloader {
    pub fn new(session: Arc<FileSession>, tracker: TrackerClient, config: PeerConfig) -> Self {
        Self {
            session,
            tracker,
            config,
        }
    }

    /// Discovery loop: refresh our registration, fetch peers, try each
    /// one, sleep, repeat. Per-peer failures are logged and skipped; only
    /// completion ends the loop.
    pub async fn run(&self) -> Result<()> {
        let pb = ProgressBar::new(self.session.piece_count() as u64);
        pb.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} pieces  {msg}")
                .expect("progress template is valid")
                .progress_chars("##-"),
        );
        pb.set_position(self.session.bitfield().await.count_set() as u64);

        while !self.session.is_complete().await {
            // Re-registering refreshes the bitmap the tracker hands out.
            if let Err(e) = self
                .tracker
                .register(
                    self.session.file_id(),
                    self.config.listen_port,
                    &self.session.bitfield().await,
                )
                .await
            {
                warn!(tracker = %self.tracker.addr(), "re-register failed: {e:#}");
            }

            let peers = match self.tracker.get_peers(self.session.file_id()).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!("peer discovery failed: {e:#}");
                    Vec::new()
                }
            };

            if peers.is_empty() {
                debug!("no peers available, waiting");
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            for peer in peers {
                if self.session.is_complete().await {
                    break;
                }
                match self.download_from_peer(peer, &pb).await {
                    Ok(got) => debug!(%peer, pieces = got, "peer session finished"),
                    Err(e) => warn!(%peer, "peer session failed: {e:#}"),
                }
            }

            if !self.session.is_complete().await {
                tokio::time::sleep(self.config.retry_interval).await;
            }
        }

        pb.finish_with_message("complete");
        info!(
            file_id = self.session.file_id(),
            downloaded = self.session.stats.downloaded_bytes(),
            "download complete"
        );
        Ok(())
    }

    /// One per-peer session: handshake, bitfield exchange, then pull the
    /// needed pieces in ascending index order. Returns how many pieces
    /// this session acquired.
    pub async fn download_from_peer(&self, peer: SocketAddr, pb: &ProgressBar) -> Result<usize> {
        let stream = TcpStream::connect(peer)
            .await
            .with_context(|| format!("failed to connect to peer {peer}"))?;
        let mut conn = Connection::new(stream);

        conn.send_line(&PeerCommand::Handshake {
            file_id: self.session.file_id().to_string(),
        }
        .to_string())
        .await?;
        let reply = conn.recv_line().await.context("no handshake reply")?;
        if reply != proto::HANDSHAKE_OK {
            bail!("handshake refused: {reply}");
        }

        // The server sends its bitfield first, then expects ours. Its
        // length is known from the piece count; anything larger is a
        // protocol violation, not an allocation request.
        let line = conn.recv_line().await.context("no bitfield header")?;
        let remote = match PeerCommand::parse(&line) {
            Ok(PeerCommand::Bitfield { len }) => {
                let expected = (self.session.piece_count() as usize).div_ceil(8);
                if len > expected {
                    bail!("peer declared a {len}-byte bitfield, expected at most {expected}");
                }
                let bytes = conn.recv_exact(len).await.context("bitfield truncated")?;
                Bitfield::from_bytes(&bytes, self.session.piece_count())
            }
            _ => bail!("expected BITFIELD header, got: {line}"),
        };

        let local = self.session.bitfield().await;
        let bytes = local.to_bytes();
        conn.send_frame(&PeerCommand::Bitfield { len: bytes.len() }.to_string(), &bytes)
            .await?;

        let needed = local.missing_from(&remote);
        debug!(%peer, needed = needed.len(), "bitfields exchanged");

        let mut acquired = 0;
        for index in needed {
            // Another peer session may have filled this index meanwhile.
            if self.session.has_piece(index).await {
                continue;
            }

            let data = self.fetch_piece(&mut conn, index).await?;
            self.session
                .write_piece(index, &data)
                .await
                .with_context(|| format!("failed to store piece {index}"))?;
            // The write is durable before ownership flips.
            self.session.mark_piece(index).await;
            self.session.stats.add_downloaded(data.len() as u64);
            acquired += 1;
            pb.inc(1);
            debug!(%peer, index, len = data.len(), "piece downloaded");

            // Fire-and-forget; the remote only logs it.
            let _ = conn
                .send_line(&PeerCommand::Have { index }.to_string())
                .await;

            if self.session.is_complete().await {
                break;
            }
        }

        Ok(acquired)
    }

    /// One REQUEST/PIECE exchange. An ERROR reply, an index mismatch, a
    /// wrong declared length, or a short body all abort the per-peer
    /// session.
    async fn fetch_piece<S>(&self, conn: &mut Connection<S>, index: PieceIndex) -> Result<Vec<u8>>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        conn.send_line(&PeerCommand::Request { index }.to_string())
            .await?;

        let line = conn.recv_line().await.context("no PIECE reply")?;
        let header = PieceHeader::parse(&line)
            .map_err(|msg| anyhow::anyhow!("piece {index} refused: {msg}"))?;
        if header.index != index {
            bail!("piece index mismatch: asked {index}, got {}", header.index);
        }
        // The body length is fully determined by the index; a remote
        // declaring anything else is lying, and its size must be checked
        // before it drives an allocation.
        let expected = self.session.piece_len(index) as usize;
        if header.len != expected {
            bail!(
                "piece {index} declared {} bytes, expected {expected}",
                header.len
            );
        }

        let data = conn
            .recv_exact(header.len)
            .await
            .with_context(|| format!("piece {index} body truncated"))?;
        Ok(data)
    }
}
