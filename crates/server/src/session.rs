//! Per-upload write state.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use blockhaul_store::UploadId;

use crate::TransferError;

/// An active upload.
///
/// Owns the exclusive append-only handle to the backing file and the write
/// offset, which together are protected by a read/write lock so the offset
/// always reflects what has actually been written. The session never seeks,
/// never truncates, and never appends past the declared size.
pub struct UploadSession {
    id: UploadId,
    size: i64,
    metadata: Vec<u8>,
    file_sha256: Option<[u8; 32]>,
    path: PathBuf,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    sink: Option<File>,
    write_offset: i64,
}

impl UploadSession {
    pub(crate) fn new(
        id: UploadId,
        size: i64,
        file_sha256: Option<[u8; 32]>,
        metadata: Vec<u8>,
        sink: File,
        path: PathBuf,
    ) -> UploadSession {
        UploadSession {
            id,
            size,
            metadata,
            file_sha256,
            path,
            inner: RwLock::new(SessionInner {
                sink: Some(sink),
                write_offset: 0,
            }),
        }
    }

    /// The session identifier.
    pub fn id(&self) -> &UploadId {
        &self.id
    }

    /// Total number of bytes the client declared it will upload.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Opaque client-supplied metadata.
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Declared whole-file digest, if any.
    pub fn file_sha256(&self) -> Option<&[u8; 32]> {
        self.file_sha256.as_ref()
    }

    /// Location of the backing file inside the store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `data` to the backing file and advances the write offset.
    ///
    /// Fails with [`TransferError::Overflow`] before touching the file if
    /// the write would exceed the declared size. Data is synced to storage
    /// before the offset advances, so an offset handed to a resuming client
    /// never exceeds what survives a crash.
    pub async fn write(&self, data: &[u8]) -> Result<usize, TransferError> {
        let mut inner = self.inner.write().await;

        if inner.write_offset + data.len() as i64 > self.size {
            return Err(TransferError::Overflow);
        }

        let sink = inner
            .sink
            .as_mut()
            .ok_or_else(|| TransferError::Io(std::io::Error::other("upload sink already closed")))?;

        sink.write_all(data).await?;
        sink.sync_data().await?;

        inner.write_offset += data.len() as i64;
        Ok(data.len())
    }

    /// Snapshot of the current write offset.
    pub async fn offset(&self) -> i64 {
        self.inner.read().await.write_offset
    }

    /// Closes the sink, flushing it to storage. Idempotent.
    pub(crate) async fn close(&self) -> Result<(), TransferError> {
        let mut inner = self.inner.write().await;
        if let Some(mut sink) = inner.sink.take() {
            sink.flush().await?;
            sink.sync_all().await?;
        }
        Ok(())
    }
}
