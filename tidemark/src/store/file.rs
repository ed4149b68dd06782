//! Store file access
//!
//! One file per database: two fixed-size root-block slots at offsets `0`
//! and `max_block_size`, then secondary payload blocks, one
//! `max_block_size` region each.

use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;

use super::StoreError;

#[derive(Debug)]
pub(crate) struct StoreFile {
    file: File,
    path: PathBuf,
    max_block_size: u32,
}

impl StoreFile {
    /// Create the database file; fails if the path already exists.
    pub(crate) async fn try_create(path: &Path, max_block_size: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| StoreError::FileState {
                path: path.into(),
                reason: e.to_string(),
            })?;

        // Both slot regions exist from the start; slot 1 stays zeroed
        // (invalid) until the second commit.
        file.set_len(2 * max_block_size as u64).await?;

        Ok(Self {
            file,
            path: path.into(),
            max_block_size,
        })
    }

    /// Open an existing database file for read/write.
    pub(crate) async fn try_open(path: &Path, max_block_size: u32) -> Result<Self, StoreError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| StoreError::FileState {
                path: path.into(),
                reason: e.to_string(),
            })?;
        if !meta.is_file() {
            return Err(StoreError::FileState {
                path: path.into(),
                reason: "not a regular file".to_string(),
            });
        }

        let file = OpenOptions::new()
            .create(false)
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| StoreError::FileState {
                path: path.into(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            file,
            path: path.into(),
            max_block_size,
        })
    }

    /// Read one full root-block slot.
    pub(crate) async fn read_slot(&mut self, offset: u64) -> Result<Vec<u8>, StoreError> {
        let mut buf = vec![0; self.max_block_size as usize];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write a root block at `offset` and sync the file.
    pub(crate) async fn write_slot(&mut self, offset: u64, data: &[u8]) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.file.sync_all().await?;
        Ok(())
    }

    fn block_offset(&self, block: u64) -> u64 {
        2 * self.max_block_size as u64 + block * self.max_block_size as u64
    }

    /// Read secondary payload block `block`.
    pub(crate) async fn read_block(&mut self, block: u64) -> Result<Vec<u8>, StoreError> {
        let offset = self.block_offset(block);
        let mut buf = vec![0; self.max_block_size as usize];
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write secondary payload block `block`. Durability rides on the
    /// root-block sync that ends the transaction.
    pub(crate) async fn write_block(&mut self, block: u64, data: &[u8]) -> Result<(), StoreError> {
        if data.len() > self.max_block_size as usize {
            return Err(StoreError::FileState {
                path: self.path.clone(),
                reason: format!(
                    "payload of {} bytes exceeds block size {}",
                    data.len(),
                    self.max_block_size
                ),
            });
        }
        let offset = self.block_offset(block);
        let end = offset + self.max_block_size as u64;
        if self.file.metadata().await?.len() < end {
            self.file.set_len(end).await?;
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn it_creates_and_reopens_a_store_file() {
        let path = Path::new("file_create.db");
        let file = StoreFile::try_create(path, 256).await.expect("creates");
        drop(file);
        let _file = StoreFile::try_open(path, 256).await.expect("opens");
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn it_refuses_to_create_over_an_existing_file() {
        let path = Path::new("file_create_twice.db");
        let _file = StoreFile::try_create(path, 256).await.expect("creates");
        let err = StoreFile::try_create(path, 256).await.unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
        std::fs::remove_file(path).expect("cleanup");
    }

    #[tokio::test]
    async fn it_refuses_to_open_a_missing_file() {
        let err = StoreFile::try_open(Path::new("file_missing.db"), 256)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
    }

    #[tokio::test]
    async fn it_round_trips_payload_blocks() {
        let path = Path::new("file_blocks.db");
        let mut file = StoreFile::try_create(path, 256).await.expect("creates");
        file.write_block(3, b"payload three").await.expect("writes");
        let back = file.read_block(3).await.expect("reads");
        assert_eq!(&back[..13], b"payload three");

        let err = file.write_block(0, &[0; 257]).await.unwrap_err();
        assert!(matches!(err, StoreError::FileState { .. }));
        std::fs::remove_file(path).expect("cleanup");
    }
}
