use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::bitfield::Bitfield;
use crate::store::{FileStore, StoreError};
use crate::{PieceIndex, PIECE_SIZE};

/// Process-wide state for one shared file: identity and geometry, the
/// ownership bitmap behind a lock, and the piece store behind its own
/// lock. Shared as `Arc<FileSession>` by the upload and download engines.
///
/// Lock discipline: the bitmap lock covers a single check or update and is
/// never held across network I/O; the store lock covers exactly one file
/// read or write.
pub struct FileSession {
    file_id: String,
    file_size: u64,
    piece_count: u32,
    path: PathBuf,
    bitfield: RwLock<Bitfield>,
    store: Mutex<FileStore>,
    pub stats: TransferStats,
}

impl FileSession {
    /// `seeded` decides the starting bitmap: all-true for a peer that
    /// already holds the complete file, all-false for a fresh download.
    pub fn new(
        file_id: impl Into<String>,
        path: impl Into<PathBuf>,
        file_size: u64,
        seeded: bool,
    ) -> Arc<Self> {
        let path = path.into();
        let store = FileStore::new(&path, file_size);
        let piece_count = store.piece_count();
        let bitfield = if seeded {
            Bitfield::full(piece_count)
        } else {
            Bitfield::new(piece_count)
        };

        Arc::new(Self {
            file_id: file_id.into(),
            file_size,
            piece_count,
            path,
            bitfield: RwLock::new(bitfield),
            store: Mutex::new(store),
            stats: TransferStats::new(),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn piece_len(&self, index: PieceIndex) -> u32 {
        let offset = index as u64 * PIECE_SIZE as u64;
        u64::min(PIECE_SIZE as u64, self.file_size.saturating_sub(offset)) as u32
    }

    pub async fn has_piece(&self, index: PieceIndex) -> bool {
        self.bitfield.read().await.has(index)
    }

    /// Marks a piece as owned. Monotone: pieces are never un-marked. The
    /// caller must have durably written the piece first.
    pub async fn mark_piece(&self, index: PieceIndex) {
        self.bitfield.write().await.set(index);
    }

    /// Snapshot of the current bitmap, taken under the lock and released
    /// before any I/O happens with it.
    pub async fn bitfield(&self) -> Bitfield {
        self.bitfield.read().await.clone()
    }

    pub async fn is_complete(&self) -> bool {
        self.bitfield.read().await.is_all_set()
    }

    pub async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, StoreError> {
        self.store.lock().await.read_piece(index)
    }

    pub async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StoreError> {
        self.store.lock().await.write_piece(index, data)
    }
}

/// Lock-free transfer counters, read by progress reporting.
pub struct TransferStats {
    downloaded_bytes: AtomicU64,
    uploaded_bytes: AtomicU64,
}

impl TransferStats {
    fn new() -> Self {
        Self {
            downloaded_bytes: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::Relaxed)
    }
}
