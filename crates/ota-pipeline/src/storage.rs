//! Storage collaborator
//!
//! The pipeline treats persistent storage as an opaque hierarchical byte
//! store. [`FsStorage`] maps it onto the host filesystem.

use std::io;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Hierarchical byte store used for staging
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Whether a file or directory exists at `path`
    async fn exists(&self, path: &Path) -> bool;

    /// Create `path` and all missing parents
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Read a whole file
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Read up to `len` bytes starting at `offset`; short at end of file
    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Create or truncate a file with the given contents
    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Append to an existing file (created if missing)
    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Atomically replace `to` with `from`
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Delete a file
    async fn remove(&self, path: &Path) -> io::Result<()>;

    /// Size of a file in bytes
    async fn size(&self, path: &Path) -> io::Result<u64>;
}

/// Host filesystem storage
#[derive(Debug, Default, Clone, Copy)]
pub struct FsStorage;

impl FsStorage {
    /// Create a new filesystem storage handle
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Storage for FsStorage {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(tokio::fs::metadata(path).await?.len())
    }
}
