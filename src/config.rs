use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Whether this peer starts with the complete file or an empty bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Seed,
    Download,
}

/// Everything a peer process needs to join a swarm for one file.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub mode: Mode,
    /// Identifier both sides must agree on during the handshake
    pub file_id: String,
    /// Local path of the shared file
    pub path: PathBuf,
    /// Total file size in bytes
    pub file_size: u64,
    /// Port the upload engine listens on
    pub listen_port: u16,
    /// Registry address
    pub tracker_addr: SocketAddr,
    /// Sleep between discovery cycles when no peers are known
    pub poll_interval: Duration,
    /// Sleep between full passes over the discovered peers
    pub retry_interval: Duration,
}

impl PeerConfig {
    pub fn new(
        mode: Mode,
        file_id: impl Into<String>,
        path: impl Into<PathBuf>,
        file_size: u64,
        listen_port: u16,
        tracker_addr: SocketAddr,
    ) -> Self {
        Self {
            mode,
            file_id: file_id.into(),
            path: path.into(),
            file_size,
            listen_port,
            tracker_addr,
            poll_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(3),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}
