//! Local-file [`BlockStorage`] implementation for host builds.
//!
//! `LocalBlockStorage` maps storage address 0 to the start of a single file
//! and performs positioned reads and writes with `std::fs`. Used when the
//! `std` feature is enabled (xtask simulation, end-to-end tests).
//!
//! Reads past the current end of file are an error, not zero-filled: the
//! engine only reads addresses a flush has already written.

extern crate std;

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::BlockStorage;

/// Error type for local file operations.
#[derive(Debug)]
pub struct LocalStorageError(pub std::io::Error);

impl core::fmt::Display for LocalStorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "local storage error: {}", self.0)
    }
}

impl std::error::Error for LocalStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// A [`BlockStorage`] backed by one file on the local filesystem.
///
/// # Example
/// ```no_run
/// # async fn example() {
/// use platform::storage_local::LocalBlockStorage;
/// use platform::BlockStorage;
/// let mut storage = LocalBlockStorage::create("/tmp/recording.tw").unwrap();
/// storage.write(0, &[0u8; 2048]).await.unwrap();
/// # }
/// ```
pub struct LocalBlockStorage {
    path: PathBuf,
    file: fs::File,
}

impl LocalBlockStorage {
    /// Create (or truncate) the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `LocalStorageError` if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LocalStorageError> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(LocalStorageError)?;
        Ok(Self { path, file })
    }

    /// Open an existing file for reading and writing.
    ///
    /// # Errors
    ///
    /// Returns `LocalStorageError` if the file does not exist or cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LocalStorageError> {
        let path = path.as_ref().to_path_buf();
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(LocalStorageError)?;
        Ok(Self { path, file })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the backing file in bytes.
    ///
    /// # Errors
    ///
    /// Returns `LocalStorageError` if the file metadata cannot be read.
    pub fn size_bytes(&self) -> Result<u64, LocalStorageError> {
        Ok(self.file.metadata().map_err(LocalStorageError)?.len())
    }

    /// Flush OS buffers to disk.
    ///
    /// # Errors
    ///
    /// Returns `LocalStorageError` if the sync fails.
    pub fn sync(&mut self) -> Result<(), LocalStorageError> {
        self.file.sync_all().map_err(LocalStorageError)
    }
}

impl BlockStorage for LocalBlockStorage {
    type Error = LocalStorageError;

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.file
            .seek(SeekFrom::Start(u64::from(address)))
            .map_err(LocalStorageError)?;
        self.file.write_all(data).map_err(LocalStorageError)
    }

    async fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.file
            .seek(SeekFrom::Start(u64::from(address)))
            .map_err(LocalStorageError)?;
        self.file.read_exact(dest).map_err(LocalStorageError)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_storage_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let mut storage = LocalBlockStorage::create(tmp.path().join("rec.tw")).unwrap();
        storage.write(0, b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        storage.read(0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn local_storage_positioned_write_extends_file() {
        let tmp = TempDir::new().unwrap();
        let mut storage = LocalBlockStorage::create(tmp.path().join("rec.tw")).unwrap();
        storage.write(4096, &[7u8; 2048]).await.unwrap();
        assert_eq!(storage.size_bytes().unwrap(), 6144);

        let mut gap = [0xFFu8; 16];
        storage.read(0, &mut gap).await.unwrap();
        assert_eq!(gap, [0u8; 16]);

        let mut tail = [0u8; 4];
        storage.read(6140, &mut tail).await.unwrap();
        assert_eq!(tail, [7u8; 4]);
    }

    #[tokio::test]
    async fn local_storage_read_past_end_fails() {
        let tmp = TempDir::new().unwrap();
        let mut storage = LocalBlockStorage::create(tmp.path().join("rec.tw")).unwrap();
        storage.write(0, &[1u8; 8]).await.unwrap();
        let mut buf = [0u8; 16];
        assert!(storage.read(0, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn local_storage_reopen_sees_previous_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("rec.tw");
        {
            let mut storage = LocalBlockStorage::create(&path).unwrap();
            storage.write(2048, b"ABCDEFGH").await.unwrap();
            storage.sync().unwrap();
        }
        let mut storage = LocalBlockStorage::open(&path).unwrap();
        assert_eq!(storage.path(), path.as_path());
        let mut buf = [0u8; 4];
        storage.read(2052, &mut buf).await.unwrap();
        assert_eq!(&buf, b"EFGH");
    }

    #[test]
    fn local_storage_open_missing_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(LocalBlockStorage::open(tmp.path().join("missing.tw")).is_err());
    }
}
