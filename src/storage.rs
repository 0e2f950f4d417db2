//! Persistent storage for piece data
//!
//! The engine sees the torrent content as one logical byte range; mapping
//! that range onto a file tree is an external concern. [`Storage`] is the
//! narrow interface the session reads when serving peer requests and writes
//! when a piece verifies. [`MemoryStorage`] backs the tests, [`FileStorage`]
//! backs a single flat file on disk.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::error::{EngineError, Result, StorageErrorKind};

/// Byte-range storage over the logical concatenation of torrent content
pub trait Storage: Send + Sync {
    /// Read `length` bytes starting at `offset`
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at `offset`
    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Total length of the backing range
    fn len(&self) -> u64;

    /// Check if the backing range is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(offset: u64, length: usize, total: u64) -> Result<()> {
    let end = offset
        .checked_add(length as u64)
        .ok_or_else(|| EngineError::storage(StorageErrorKind::OutOfRange, "range overflows"))?;
    if end > total {
        return Err(EngineError::storage(
            StorageErrorKind::OutOfRange,
            format!("range {}..{} exceeds total length {}", offset, end, total),
        ));
    }
    Ok(())
}

/// In-memory storage for testing
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Create zero-filled storage of the given total length
    pub fn new(total_length: u64) -> Self {
        Self {
            data: RwLock::new(vec![0; total_length as usize]),
        }
    }

    /// Create storage pre-filled with `data`
    pub fn with_content(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }
}

impl Storage for MemoryStorage {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.data.read();
        check_range(offset, length, data.len() as u64)?;
        let start = offset as usize;
        Ok(data[start..start + length].to_vec())
    }

    fn write_range(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        check_range(offset, buf.len(), data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }
}

/// Flat-file storage over one file on disk
pub struct FileStorage {
    file: Mutex<File>,
    total_length: u64,
}

impl FileStorage {
    /// Open or create the backing file, sized to `total_length`
    pub fn create(path: impl AsRef<Path>, total_length: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        file.set_len(total_length)?;
        Ok(Self {
            file: Mutex::new(file),
            total_length,
        })
    }
}

impl Storage for FileStorage {
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        check_range(offset, length, self.total_length)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.total_length)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.total_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let storage = MemoryStorage::new(64);
        storage.write_range(16, &[7u8; 8]).unwrap();
        assert_eq!(storage.read_range(16, 8).unwrap(), vec![7u8; 8]);
        assert_eq!(storage.read_range(0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let storage = MemoryStorage::new(64);
        assert!(storage.read_range(60, 8).is_err());
        assert!(storage.write_range(64, &[1]).is_err());
        assert!(storage.read_range(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::create(dir.path().join("content"), 128).unwrap();
        storage.write_range(100, b"hello").unwrap();
        assert_eq!(storage.read_range(100, 5).unwrap(), b"hello".to_vec());
        assert_eq!(storage.len(), 128);
    }
}
