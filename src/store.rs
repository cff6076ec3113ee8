use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::{PieceIndex, PIECE_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("piece index {0} out of range")]
    OutOfRange(PieceIndex),
    #[error("piece {index} expects {expected} bytes, got {actual}")]
    LengthMismatch {
        index: PieceIndex,
        expected: u32,
        actual: usize,
    },
    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and writes fixed-size byte ranges of the shared file. The caller
/// (`FileSession`) holds this behind one async lock so concurrent upload
/// and download activity cannot interleave seeks and writes.
pub struct FileStore {
    path: PathBuf,
    file_size: u64,
    piece_count: u32,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            path: path.into(),
            file_size,
            piece_count: file_size.div_ceil(PIECE_SIZE as u64) as u32,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Length of a piece: `PIECE_SIZE` except the final index, which holds
    /// whatever remains of the file.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32, StoreError> {
        if index >= self.piece_count {
            return Err(StoreError::OutOfRange(index));
        }
        let offset = index as u64 * PIECE_SIZE as u64;
        Ok(u64::min(PIECE_SIZE as u64, self.file_size - offset) as u32)
    }

    pub fn read_piece(&mut self, index: PieceIndex) -> Result<Vec<u8>, StoreError> {
        let len = self.piece_len(index)?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(index as u64 * PIECE_SIZE as u64))?;

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Writes one piece at its offset, creating the file pre-extended to
    /// the full target size on first use.
    pub fn write_piece(&mut self, index: PieceIndex, data: &[u8]) -> Result<(), StoreError> {
        let expected = self.piece_len(index)?;
        if data.len() != expected as usize {
            return Err(StoreError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        if file.metadata()?.len() < self.file_size {
            file.set_len(self.file_size)?;
        }

        file.seek(SeekFrom::Start(index as u64 * PIECE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}
