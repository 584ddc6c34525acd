use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Prepare { path: PathBuf, source: io::Error },

    #[error("failed to create staging file {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to write staging file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read staging file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("staging buffer {0} is no longer writable")]
    Closed(Uuid),
}

/// Directory holding in-flight message bodies.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the staging directory if it does not exist yet.
    pub async fn prepare(&self) -> Result<(), StagingError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StagingError::Prepare {
                path: self.dir.clone(),
                source,
            })
    }

    /// Allocate a buffer under a fresh random key.
    pub async fn allocate(&self) -> Result<StagingBuffer, StagingError> {
        StagingBuffer::create(&self.dir).await
    }
}

/// Spool file for one message body.
///
/// The body can be read back exactly once with [`StagingBuffer::consume`],
/// which also deletes the file. A buffer dropped before that removes its file
/// on a best-effort basis.
#[derive(Debug)]
pub struct StagingBuffer {
    key: Uuid,
    path: PathBuf,
    file: Option<File>,
    written: usize,
    removed: bool,
}

impl StagingBuffer {
    pub async fn create(dir: &Path) -> Result<Self, StagingError> {
        let key = Uuid::new_v4();
        let path = dir.join(key.to_string());

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| StagingError::Create {
                path: path.clone(),
                source,
            })?;

        log::debug!("Allocated staging buffer {}", path.display());

        Ok(Self {
            key,
            path,
            file: Some(file),
            written: 0,
            removed: false,
        })
    }

    pub fn key(&self) -> Uuid {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append a chunk. On failure the partial file is deleted and the buffer
    /// can no longer be written to.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        let file = self.file.as_mut().ok_or(StagingError::Closed(self.key))?;

        if let Err(source) = file.write_all(chunk).await {
            log::error!("Write to staging file {} failed: {}", self.path.display(), source);
            self.file = None;
            self.remove().await;
            return Err(StagingError::Write {
                path: self.path.clone(),
                source,
            });
        }

        self.written += chunk.len();
        Ok(())
    }

    /// Read back the full body and delete the file.
    ///
    /// A failure to delete is logged and otherwise ignored.
    pub async fn consume(mut self) -> Result<Vec<u8>, StagingError> {
        let mut file = self.file.take().ok_or(StagingError::Closed(self.key))?;

        if let Err(source) = file.flush().await {
            self.remove().await;
            return Err(StagingError::Write {
                path: self.path.clone(),
                source,
            });
        }
        drop(file);

        let body = tokio::fs::read(&self.path).await;
        self.remove().await;

        body.map_err(|source| StagingError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Drop the buffer and its file without reading it.
    pub async fn discard(mut self) {
        self.file = None;
        self.remove().await;
    }

    /// Swap the handle for a read-only one so later writes fail.
    #[cfg(test)]
    pub(crate) async fn reopen_read_only(&mut self) {
        self.file = Some(File::open(&self.path).await.unwrap());
    }

    async fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => log::debug!("Removed staging file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to delete file {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed abandoned staging file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to delete file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());

        let chunks: [&[u8]; 4] = [
            b"Subject: hi\r\n",
            b"\r\n",
            b"bare lf\nmixed\r\n\xff\xfe not utf-8\r\n",
            b"",
        ];
        let mut buffer = area.allocate().await.unwrap();
        let path = buffer.path().to_path_buf();
        for chunk in chunks {
            buffer.write(chunk).await.unwrap();
        }

        assert_eq!(buffer.len(), chunks.iter().map(|c| c.len()).sum::<usize>());
        assert!(path.exists());

        let body = buffer.consume().await.unwrap();
        assert_eq!(body, chunks.concat());
        assert!(!path.exists(), "staging file must be deleted after consume");
    }

    #[tokio::test]
    async fn test_keys_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path());

        let first = area.allocate().await.unwrap();
        let second = area.allocate().await.unwrap();
        assert_ne!(first.key(), second.key());
        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = StagingBuffer::create(dir.path()).await.unwrap();
        buffer.write(b"partial").await.unwrap();
        let path = buffer.path().to_path_buf();

        drop(buffer);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = StagingBuffer::create(dir.path()).await.unwrap();
        let path = buffer.path().to_path_buf();

        buffer.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_consume_of_vanished_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = StagingBuffer::create(dir.path()).await.unwrap();
        buffer.write(b"partial").await.unwrap();
        std::fs::remove_file(buffer.path()).unwrap();

        let result = buffer.consume().await;
        assert!(matches!(result, Err(StagingError::Read { .. })), "{result:?}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = StagingBuffer::create(dir.path()).await.unwrap();
        buffer.reopen_read_only().await;

        // tokio may defer the write error to the flush in consume
        let error = match buffer.write(b"data").await {
            Err(e) => e,
            Ok(()) => buffer.consume().await.unwrap_err(),
        };
        assert!(matches!(error, StagingError::Write { .. }), "{error:?}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_closed_buffer_rejects_io() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = StagingBuffer::create(dir.path()).await.unwrap();
        buffer.file = None;

        let result = buffer.write(b"late").await;
        assert!(matches!(result, Err(StagingError::Closed(_))));
        assert!(matches!(buffer.consume().await, Err(StagingError::Closed(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_create_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");

        let result = StagingBuffer::create(&missing).await;
        assert!(matches!(result, Err(StagingError::Create { .. })));
    }

    #[tokio::test]
    async fn test_prepare_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let area = StagingArea::new(dir.path().join("nested/tmp"));

        area.prepare().await.unwrap();
        assert!(area.dir().is_dir());
        assert!(area.allocate().await.is_ok());
    }
}
