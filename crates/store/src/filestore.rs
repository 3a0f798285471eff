//! Sharded on-disk store for incoming files.
//!
//! Each upload lives at `<root>/<shard-low>/<shard-high>/<id>`, with the
//! shard components taken from the low 64 bits of the ID. Shard directories
//! are created lazily when a file is created and pruned eagerly when one is
//! removed.

use std::path::{Path, PathBuf};

use tokio::fs::{DirBuilder, File, OpenOptions};

use crate::{StoreError, UploadId};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// File store rooted at a single directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<FileStore, StoreError> {
        let root = root.into();
        make_dirs(&root).await?;
        Ok(FileStore { root })
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an ID to its absolute location inside the store.
    pub fn map(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.shard_path()).join(id.as_str())
    }

    /// Creates the backing file for `id` and returns an exclusive handle.
    ///
    /// The file must not exist yet; a pre-existing file is a store
    /// inconsistency, not something to clobber. Writers are expected to
    /// follow every append with `sync_data` so the advertised offset never
    /// exceeds what survives a crash.
    pub async fn create(&self, id: &UploadId) -> Result<File, StoreError> {
        let path = self.map(id);
        if let Some(parent) = path.parent() {
            make_dirs(parent).await?;
        }

        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(FILE_MODE);

        opts.open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                StoreError::AlreadyExists(id.to_string())
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Opens the stored file for `id` read-only.
    pub async fn open_read_only(&self, id: &UploadId) -> Result<File, StoreError> {
        let path = self.map(id);
        File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(e)
            }
        })
    }

    /// Removes the stored file for `id` and prunes empty shard directories.
    ///
    /// The walk stops at the first non-empty ancestor and never removes the
    /// store root, so unrelated files placed inside a shard are left alone.
    pub async fn remove(&self, id: &UploadId) -> Result<(), StoreError> {
        let path = self.map(id);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;

        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            match is_dir_empty(d).await {
                Ok(true) => tokio::fs::remove_dir(d).await?,
                // Non-empty or unreadable: stop pruning, the removal itself
                // already succeeded.
                _ => break,
            }
            dir = d.parent();
        }
        Ok(())
    }
}

async fn make_dirs(path: &Path) -> std::io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(path).await
}

async fn is_dir_empty(path: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(path).await?;
    Ok(entries.next_entry().await?.is_none())
}
