use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use indicatif::ProgressBar;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast;

use seedshare::config::{Mode, PeerConfig};
use seedshare::peer::{run_upload, Downloader};
use seedshare::session::FileSession;
use seedshare::tracker::{run_tracker, Registry, TrackerClient};
use seedshare::wire::Connection;

const FILE_SIZE: u64 = 150_000; // 3 pieces: 65536, 65536, 18432

/// Deterministic file content so every test can verify byte equality.
fn test_bytes() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Writes the full test file and opens a seed session for it.
fn seed_session(dir: &tempfile::TempDir, file_id: &str) -> Arc<FileSession> {
    let path = dir.path().join("seed.dat");
    std::fs::write(&path, test_bytes()).unwrap();
    FileSession::new(file_id, path, FILE_SIZE, true)
}

/// Spawns the upload engine for `session` on an ephemeral loopback port.
async fn spawn_upload(
    session: Arc<FileSession>,
    bind_ip: &str,
) -> (SocketAddr, broadcast::Sender<()>) {
    let listener = TcpListener::bind(format!("{bind_ip}:0")).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(run_upload(listener, session, shutdown_tx.subscribe()));
    (addr, shutdown_tx)
}

fn downloader_config(tracker_addr: SocketAddr) -> PeerConfig {
    PeerConfig::new(
        Mode::Download,
        "demo",
        "unused",
        FILE_SIZE,
        7100,
        tracker_addr,
    )
    .with_poll_interval(Duration::from_millis(50))
    .with_retry_interval(Duration::from_millis(50))
}

#[tokio::test]
async fn downloads_all_pieces_from_a_seed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seed = seed_session(&dir, "demo");
    let (seed_addr, _shutdown) = spawn_upload(seed, "127.0.0.1").await;

    let leech = FileSession::new("demo", dir.path().join("leech.dat"), FILE_SIZE, false);
    assert_eq!(leech.piece_count(), 3);
    assert_eq!(leech.piece_len(2), 18_432);

    // The tracker is not involved here; drive the per-peer session directly.
    let config = downloader_config("127.0.0.1:1".parse()?);
    let downloader = Downloader::new(Arc::clone(&leech), TrackerClient::new(config.tracker_addr), config);
    let got = downloader
        .download_from_peer(seed_addr, &ProgressBar::hidden())
        .await?;

    assert_eq!(got, 3);
    assert!(leech.is_complete().await);
    assert_eq!(leech.bitfield().await.to_hex(), "E0");
    assert_eq!(std::fs::read(dir.path().join("leech.dat"))?, test_bytes());
    Ok(())
}

#[tokio::test]
async fn unavailable_piece_is_refused_without_corrupting_the_stream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // A partial peer: it owns piece 0 only.
    let path = dir.path().join("partial.dat");
    let partial = FileSession::new("demo", &path, FILE_SIZE, false);
    partial.write_piece(0, &test_bytes()[..65_536]).await?;
    partial.mark_piece(0).await;
    let (addr, _shutdown) = spawn_upload(Arc::clone(&partial), "127.0.0.1").await;

    let mut conn = Connection::new(TcpStream::connect(addr).await?);
    conn.send_line("HANDSHAKE demo").await?;
    assert_eq!(conn.recv_line().await?, "HANDSHAKE_OK");

    // Bitfield exchange: server first, then ours (all-zero).
    assert_eq!(conn.recv_line().await?, "BITFIELD 1");
    assert_eq!(conn.recv_exact(1).await?, vec![0b1000_0000]);
    conn.send_frame("BITFIELD 1", &[0u8]).await?;

    // Piece 2 is not owned: a single ERROR line, no PIECE header.
    conn.send_line("REQUEST 2").await?;
    assert_eq!(conn.recv_line().await?, "ERROR Piece not available");

    // The serve loop is still framed correctly afterwards.
    conn.send_line("REQUEST 0").await?;
    assert_eq!(conn.recv_line().await?, "PIECE 0 65536");
    let body = conn.recv_exact(65_536).await?;
    assert_eq!(body, &test_bytes()[..65_536]);
    Ok(())
}

#[tokio::test]
async fn handshake_for_the_wrong_file_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seed = seed_session(&dir, "demo");
    let (addr, _shutdown) = spawn_upload(seed, "127.0.0.1").await;

    let mut conn = Connection::new(TcpStream::connect(addr).await?);
    conn.send_line("HANDSHAKE some-other-file").await?;
    assert_eq!(conn.recv_line().await?, "ERROR Wrong file_id");
    Ok(())
}

#[tokio::test]
async fn out_of_range_request_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seed = seed_session(&dir, "demo");
    let (addr, _shutdown) = spawn_upload(seed, "127.0.0.1").await;

    let mut conn = Connection::new(TcpStream::connect(addr).await?);
    conn.send_line("HANDSHAKE demo").await?;
    assert_eq!(conn.recv_line().await?, "HANDSHAKE_OK");
    assert_eq!(conn.recv_line().await?, "BITFIELD 1");
    conn.recv_exact(1).await?;
    conn.send_frame("BITFIELD 1", &[0u8]).await?;

    conn.send_line("REQUEST 99").await?;
    assert_eq!(conn.recv_line().await?, "ERROR Piece not available");
    Ok(())
}

#[tokio::test]
async fn concurrent_downloaders_get_identical_copies() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seed = seed_session(&dir, "demo");
    let (seed_addr, _shutdown) = spawn_upload(seed, "127.0.0.1").await;

    let mut handles = Vec::new();
    for i in 0..2 {
        let path = dir.path().join(format!("leech{i}.dat"));
        let leech = FileSession::new("demo", &path, FILE_SIZE, false);
        let config = downloader_config("127.0.0.1:1".parse()?);
        let downloader =
            Downloader::new(Arc::clone(&leech), TrackerClient::new(config.tracker_addr), config);
        handles.push(tokio::spawn(async move {
            downloader
                .download_from_peer(seed_addr, &ProgressBar::hidden())
                .await?;
            anyhow::Ok((leech, path))
        }));
    }

    for handle in handles {
        let (leech, path) = handle.await??;
        assert!(leech.is_complete().await);
        assert_eq!(std::fs::read(path)?, test_bytes());
    }
    Ok(())
}

/// A seed that completes the handshake and bitfield exchange correctly,
/// then answers the first REQUEST with an arbitrary reply line.
async fn spawn_lying_seed(piece_reply: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream);
        conn.recv_line().await.unwrap(); // HANDSHAKE
        conn.send_line("HANDSHAKE_OK").await.unwrap();
        conn.send_frame("BITFIELD 1", &[0b1110_0000]).await.unwrap();
        let header = conn.recv_line().await.unwrap(); // client's BITFIELD
        let len: usize = header.split_whitespace().nth(1).unwrap().parse().unwrap();
        conn.recv_exact(len).await.unwrap();
        conn.recv_line().await.unwrap(); // REQUEST
        conn.send_line(piece_reply).await.unwrap();
        // Keep the socket open long enough for the client to read the reply.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
    addr
}

fn leech_with_downloader(
    dir: &tempfile::TempDir,
) -> (Arc<FileSession>, Downloader) {
    let leech = FileSession::new("demo", dir.path().join("leech.dat"), FILE_SIZE, false);
    let config = downloader_config("127.0.0.1:1".parse().unwrap());
    let downloader = Downloader::new(
        Arc::clone(&leech),
        TrackerClient::new(config.tracker_addr),
        config,
    );
    (leech, downloader)
}

#[tokio::test]
async fn absurd_declared_piece_length_is_a_session_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // usize::MAX bytes: must fail before any allocation happens.
    let addr = spawn_lying_seed("PIECE 0 18446744073709551615").await;
    let (leech, downloader) = leech_with_downloader(&dir);

    let result = downloader
        .download_from_peer(addr, &ProgressBar::hidden())
        .await;
    assert!(result.is_err());
    assert!(!leech.has_piece(0).await);
    Ok(())
}

#[tokio::test]
async fn piece_length_not_matching_the_index_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // Piece 0 is 65536 bytes; a seed declaring anything else is lying.
    let addr = spawn_lying_seed("PIECE 0 12").await;
    let (leech, downloader) = leech_with_downloader(&dir);

    let result = downloader
        .download_from_peer(addr, &ProgressBar::hidden())
        .await;
    assert!(result.is_err());
    assert!(!leech.has_piece(0).await);
    Ok(())
}

#[tokio::test]
async fn oversized_bitfield_from_a_remote_peer_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream);
        conn.recv_line().await.unwrap(); // HANDSHAKE
        conn.send_line("HANDSHAKE_OK").await.unwrap();
        conn.send_line("BITFIELD 18446744073709551615").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let (leech, downloader) = leech_with_downloader(&dir);
    let result = downloader
        .download_from_peer(addr, &ProgressBar::hidden())
        .await;
    assert!(result.is_err());
    assert_eq!(leech.bitfield().await.count_set(), 0);
    Ok(())
}

#[tokio::test]
async fn oversized_bitfield_header_closes_the_upload_connection() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let seed = seed_session(&dir, "demo");
    let (addr, _shutdown) = spawn_upload(seed, "127.0.0.1").await;

    let mut conn = Connection::new(TcpStream::connect(addr).await?);
    conn.send_line("HANDSHAKE demo").await?;
    assert_eq!(conn.recv_line().await?, "HANDSHAKE_OK");
    assert_eq!(conn.recv_line().await?, "BITFIELD 1");
    conn.recv_exact(1).await?;

    // A 3-piece file needs a 1-byte bitfield; declaring usize::MAX must
    // close the connection instead of allocating.
    conn.send_line("BITFIELD 18446744073709551615").await?;
    assert!(conn.recv_line().await.is_err());
    Ok(())
}

#[tokio::test]
async fn full_loop_discovers_the_seed_through_the_tracker() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let tracker_listener = TcpListener::bind("127.0.0.1:0").await?;
    let tracker_addr = tracker_listener.local_addr()?;
    let (tracker_shutdown, _) = broadcast::channel(1);
    tokio::spawn(run_tracker(
        tracker_listener,
        Registry::new(),
        tracker_shutdown.subscribe(),
    ));

    // The seed lives on a second loopback address so the tracker's
    // self-exclusion rule does not hide it from the downloader.
    let seed = seed_session(&dir, "demo");
    let (seed_addr, _seed_shutdown) = spawn_upload(seed, "127.0.0.2").await;

    let socket = TcpSocket::new_v4()?;
    socket.bind("127.0.0.2:0".parse()?)?;
    let mut conn = Connection::new(socket.connect(tracker_addr).await?);
    conn.send_line(&format!("REGISTER demo {} E0", seed_addr.port()))
        .await?;
    assert_eq!(conn.recv_line().await?, "OK");

    let leech = FileSession::new("demo", dir.path().join("leech.dat"), FILE_SIZE, false);
    let config = downloader_config(tracker_addr);
    let downloader = Downloader::new(
        Arc::clone(&leech),
        TrackerClient::new(tracker_addr),
        config,
    );

    tokio::time::timeout(Duration::from_secs(10), downloader.run()).await??;

    assert!(leech.is_complete().await);
    assert_eq!(std::fs::read(dir.path().join("leech.dat"))?, test_bytes());
    Ok(())
}
