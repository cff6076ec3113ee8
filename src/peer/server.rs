use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::proto::{self, PeerCommand, PieceHeader};
use crate::session::FileSession;
use crate::wire::{Connection, WireError};

/// Accept loop for the upload engine. Every inbound connection runs in
/// its own task so one misbehaving peer can neither block nor take down
/// the others.
pub async fn run_upload(
    listener: TcpListener,
    session: Arc<FileSession>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("upload listener has no local addr")?;
    info!(%addr, file_id = session.file_id(), "upload engine listening");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("upload engine shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("upload accept failed: {e}");
                        continue;
                    }
                };
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(Connection::new(stream), peer_addr, session).await {
                        debug!(peer = %peer_addr, "upload session ended: {e:#}");
                    }
                });
            }
        }
    }
}

/// Per-connection protocol session: handshake, bitfield exchange, then
/// the serve loop. Any violation or transport failure is terminal for
/// this connection only.
pub async fn serve_peer<S: AsyncRead + AsyncWrite + Unpin>(
    mut conn: Connection<S>,
    peer_addr: SocketAddr,
    session: Arc<FileSession>,
) -> Result<()> {
    // Handshake: the peer must name the file we are sharing.
    let line = conn.recv_line().await.context("handshake not received")?;
    match PeerCommand::parse(&line) {
        Ok(PeerCommand::Handshake { file_id }) if file_id == session.file_id() => {}
        Ok(PeerCommand::Handshake { file_id }) => {
            warn!(peer = %peer_addr, %file_id, "handshake for wrong file");
            conn.send_line(&proto::error_line("Wrong file_id")).await?;
            return Ok(());
        }
        _ => {
            warn!(peer = %peer_addr, %line, "invalid handshake");
            return Ok(());
        }
    }
    conn.send_line(proto::HANDSHAKE_OK).await?;

    // Bitfield exchange. The snapshot is taken under the bitmap lock and
    // the lock released before the bytes hit the wire.
    let bytes = session.bitfield().await.to_bytes();
    conn.send_frame(&PeerCommand::Bitfield { len: bytes.len() }.to_string(), &bytes)
        .await?;

    // The remote's bitfield is not needed for serving, but it must be
    // drained to keep the stream framed correctly. Its length is known
    // from the piece count, so a larger declared length is a protocol
    // violation, not an allocation request.
    let line = conn.recv_line().await.context("peer bitfield not received")?;
    match PeerCommand::parse(&line) {
        Ok(PeerCommand::Bitfield { len }) => {
            let expected = (session.piece_count() as usize).div_ceil(8);
            if len > expected {
                warn!(peer = %peer_addr, len, expected, "oversized bitfield declared, closing");
                return Ok(());
            }
            conn.recv_exact(len).await.context("peer bitfield truncated")?;
        }
        _ => {
            warn!(peer = %peer_addr, %line, "expected BITFIELD header");
            return Ok(());
        }
    }

    debug!(peer = %peer_addr, "peer session established, serving");

    loop {
        let line = match conn.recv_line().await {
            Ok(line) => line,
            Err(WireError::Closed) => {
                debug!(
                    peer = %peer_addr,
                    uploaded_total = session.stats.uploaded_bytes(),
                    "peer disconnected"
                );
                return Ok(());
            }
            Err(e) => return Err(e).context("serve loop receive failed"),
        };
        if line.is_empty() {
            continue;
        }

        match PeerCommand::parse(&line) {
            Ok(PeerCommand::Request { index }) => {
                if !session.has_piece(index).await {
                    conn.send_line(&proto::error_line("Piece not available")).await?;
                    continue;
                }
                let data = match session.read_piece(index).await {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(peer = %peer_addr, index, "piece read failed: {e}");
                        conn.send_line(&proto::error_line("Failed to read piece")).await?;
                        continue;
                    }
                };

                let header = PieceHeader {
                    index,
                    len: data.len(),
                };
                conn.send_frame(&header.to_string(), &data).await?;
                session.stats.add_uploaded(data.len() as u64);
                debug!(peer = %peer_addr, index, len = data.len(), "piece served");
            }
            Ok(PeerCommand::Have { index }) => {
                // Informational only; the remote's holdings are not tracked.
                debug!(peer = %peer_addr, index, "peer announced piece");
            }
            _ => {
                warn!(peer = %peer_addr, %line, "unexpected command, closing");
                return Ok(());
            }
        }
    }
}
