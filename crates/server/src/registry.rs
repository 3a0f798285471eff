//! In-memory index of active uploads.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use blockhaul_store::{FileStore, StoreError, UploadId, sha256_file};

use crate::TransferError;
use crate::session::UploadSession;

/// The sole authority on which upload sessions exist and what their current
/// offsets are.
///
/// The map is guarded by a mutex held only for map operations, never across
/// file I/O; each session carries its own lock for the write offset.
pub struct Registry {
    store: FileStore,
    sessions: Mutex<HashMap<String, Arc<UploadSession>>>,
}

impl Registry {
    /// Opens a registry whose backing files live under `incoming`.
    pub async fn open(incoming: impl Into<PathBuf>) -> Result<Registry, TransferError> {
        Ok(Registry {
            store: FileStore::open(incoming).await?,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying file store.
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Mints an ID, creates the backing file, and registers the session.
    ///
    /// An ID collision (with a live session or a leftover file) is an
    /// internal inconsistency, never a silent overwrite.
    pub async fn create(
        &self,
        size: i64,
        file_sha256: Option<[u8; 32]>,
        metadata: Vec<u8>,
    ) -> Result<Arc<UploadSession>, TransferError> {
        let id = UploadId::generate();

        if self.sessions.lock().unwrap().contains_key(id.as_str()) {
            return Err(StoreError::AlreadyExists(id.to_string()).into());
        }

        // Exclusive create is the real collision guard.
        let sink = self.store.create(&id).await?;
        let path = self.store.map(&id);
        let session = Arc::new(UploadSession::new(
            id.clone(),
            size,
            file_sha256,
            metadata,
            sink,
            path,
        ));

        match self.sessions.lock().unwrap().entry(id.as_str().to_owned()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(id.to_string()).into()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Looks up a live session by its wire ID.
    pub fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Snapshot of all live sessions, in no particular order.
    pub fn list(&self) -> Vec<Arc<UploadSession>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Returns `true` if no session is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the session, closes its sink, and verifies the whole-file
    /// digest when one was declared.
    ///
    /// On a digest mismatch the backing file is retained on disk for the
    /// operator; only the session is gone.
    pub async fn finish(&self, id: &str) -> Result<(), TransferError> {
        debug!(id, "finishing upload");

        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(id)
            .ok_or_else(|| TransferError::NotFound(id.to_owned()))?;

        session.close().await?;

        if let Some(expected) = session.file_sha256() {
            let actual = sha256_file(session.path()).await?;
            if actual != *expected {
                return Err(TransferError::FileDigestMismatch);
            }
        }

        Ok(())
    }

    /// Finishes every remaining session, aggregating errors instead of
    /// stopping at the first.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        let ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();

        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.finish(&id).await {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransferError::Shutdown(errors))
        }
    }
}
