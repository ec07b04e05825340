//! Durable byte storage for uploaded CSV content, addressed by file id.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object store error for key '{key}': {message}")]
    Remote { key: String, message: String },
}

pub type StoredReader = Box<dyn AsyncRead + Send + Unpin>;

/// An in-progress write of one file's bytes.
///
/// Bytes only become visible as a complete file after `finish`. `abort`
/// discards whatever was written so far.
#[async_trait]
pub trait FileSink: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError>;
    async fn finish(self: Box<Self>) -> Result<(), StorageError>;
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Starts writing the bytes for `file_id`, replacing anything stored there.
    async fn create(&self, file_id: i32) -> Result<Box<dyn FileSink>, StorageError>;

    /// Opens the stored bytes, or `None` when nothing is stored for the id.
    async fn open(&self, file_id: i32) -> Result<Option<StoredReader>, StorageError>;

    /// Removes the bytes for `file_id`. Missing bytes are not an error.
    async fn delete(&self, file_id: i32) -> Result<(), StorageError>;
}

/// Stores files under `{root}/processing_files/{id}`.
#[derive(Clone, Debug)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            root: media_root.into(),
        }
    }

    pub fn path_for(&self, file_id: i32) -> PathBuf {
        self.root.join(crate::entities::processing_file::storage_key(file_id))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn create(&self, file_id: i32) -> Result<Box<dyn FileSink>, StorageError> {
        let path = self.path_for(file_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        Ok(Box::new(LocalFileSink { path, file }))
    }

    async fn open(&self, file_id: i32) -> Result<Option<StoredReader>, StorageError> {
        let path = self.path_for(file_id);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn delete(&self, file_id: i32) -> Result<(), StorageError> {
        let path = self.path_for(file_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}

struct LocalFileSink {
    path: PathBuf,
    file: tokio::fs::File,
}

#[async_trait]
impl FileSink for LocalFileSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    async fn finish(mut self: Box<Self>) -> Result<(), StorageError> {
        self.file.flush().await.map_err(|e| io_error(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| io_error(&self.path, e))
    }

    async fn abort(self: Box<Self>) {
        let LocalFileSink { path, file } = *self;
        drop(file);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("Failed to discard partial upload {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_all(store: &LocalFileStore, id: i32) -> Option<Vec<u8>> {
        let mut reader = store.open(id).await.unwrap()?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        Some(buf)
    }

    #[tokio::test]
    async fn test_write_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let mut sink = store.create(1).await.unwrap();
        sink.write_chunk(b"a,b\n").await.unwrap();
        sink.write_chunk(b"1,2\n").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(read_all(&store, 1).await.unwrap(), b"a,b\n1,2\n");
        assert!(dir.path().join("processing_files").join("1").exists());
    }

    #[tokio::test]
    async fn test_open_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.open(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let mut sink = store.create(3).await.unwrap();
        sink.write_chunk(b"x").await.unwrap();
        sink.finish().await.unwrap();

        store.delete(3).await.unwrap();
        store.delete(3).await.unwrap();
        assert!(read_all(&store, 3).await.is_none());
    }

    #[tokio::test]
    async fn test_abort_discards_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let mut sink = store.create(4).await.unwrap();
        sink.write_chunk(b"half a row").await.unwrap();
        sink.abort().await;

        assert!(store.open(4).await.unwrap().is_none());
    }
}
