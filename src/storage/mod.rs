use crate::error::{BittorrentError, Result};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Random access by absolute offset. Callers only ever touch disjoint
/// ranges, one piece each.
pub trait PositionalFile {
    fn read_at(&mut self, offset: u64, len: usize) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Push written data to durable storage.
    fn flush(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// The output file of a transfer
pub struct StorageManager {
    path: PathBuf,
    file: File,
    total_length: u64,
}

impl StorageManager {
    /// Open or create `path` for writing and size it to `total_length`.
    ///
    /// A longer existing file is truncated and a shorter one zero-extended,
    /// so every piece range can be read back during validation.
    pub async fn create<P: AsRef<Path>>(path: P, total_length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| storage_error("open", &path, e))?;

        let existing = file.metadata().await?.len();
        if existing != total_length {
            debug!(
                "Resizing {:?} from {} to {} bytes",
                path, existing, total_length
            );
            file.set_len(total_length).await?;
        }

        info!("Storage initialized: {:?}, {} bytes", path, total_length);

        Ok(Self {
            path,
            file,
            total_length,
        })
    }

    /// Open a complete file for reading only; its length must be exactly
    /// `total_length`.
    pub async fn open_existing<P: AsRef<Path>>(path: P, total_length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .await
            .map_err(|e| storage_error("open", &path, e))?;

        let existing = file.metadata().await?.len();
        if existing != total_length {
            return Err(BittorrentError::StorageError(format!(
                "{:?} is {} bytes, expected {}",
                path, existing, total_length
            )));
        }

        Ok(Self {
            path,
            file,
            total_length,
        })
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.total_length {
            return Err(BittorrentError::StorageError(format!(
                "range {}..{} is past end of file ({} bytes)",
                offset,
                offset + len as u64,
                self.total_length
            )));
        }
        Ok(())
    }
}

fn storage_error(op: &str, path: &Path, e: std::io::Error) -> BittorrentError {
    BittorrentError::StorageError(format!("{} {:?}: {}", op, path, e))
}

impl PositionalFile for StorageManager {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut buffer = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file
            .read_exact(&mut buffer)
            .await
            .map_err(|e| storage_error("read", &self.path, e))?;
        Ok(buffer)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file
            .write_all(data)
            .await
            .map_err(|e| storage_error("write", &self.path, e))?;
        debug!("Wrote {} bytes at offset {}", data.len(), offset);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file
            .sync_all()
            .await
            .map_err(|e| storage_error("sync", &self.path, e))
    }
}

/// In-memory file that records every write.
#[cfg(test)]
pub struct MemoryFile {
    pub data: Vec<u8>,
    pub writes: Vec<(u64, Vec<u8>)>,
}

#[cfg(test)]
impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            writes: Vec::new(),
        }
    }
}

#[cfg(test)]
impl PositionalFile for MemoryFile {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        Ok(self.data[start..start + len].to_vec())
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.writes.push((offset, data.to_vec()));
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_sizes_file_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.bin");

        let mut storage = StorageManager::create(&path, 8).await.unwrap();
        assert_eq!(storage.read_at(0, 8).await.unwrap(), vec![0u8; 8]);

        storage.write_at(4, b"efgh").await.unwrap();
        storage.write_at(0, b"abcd").await.unwrap();
        storage.flush().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdefgh");
        assert!(storage.write_at(6, b"xyz").await.is_err());
    }

    #[tokio::test]
    async fn test_create_keeps_existing_prefix_and_truncates_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, b"abcdefghEXTRA").await.unwrap();

        let mut storage = StorageManager::create(&path, 8).await.unwrap();
        assert_eq!(storage.read_at(0, 8).await.unwrap(), b"abcdefgh");
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_open_existing_requires_full_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        assert!(StorageManager::open_existing(&path, 8).await.is_err());
        let mut storage = StorageManager::open_existing(&path, 3).await.unwrap();
        assert_eq!(storage.read_at(1, 2).await.unwrap(), b"bc");
    }
}
