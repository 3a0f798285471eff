//! Resume state sidecar.
//!
//! A tiny JSON file next to the source, `<source>.upload`, holding only the
//! server-assigned ID. It is written once CreateUpload succeeds and removed
//! once the stream closes cleanly; any failure in between leaves it in
//! place so a later run can resume.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::ClientError;

const SIDECAR_SUFFIX: &str = "upload";

/// Only the ID is persisted; size, offset, and block size are re-derived on
/// every run (the server owns the durable offset).
#[derive(Debug, Serialize, Deserialize)]
struct SidecarFile {
    id: String,
}

/// The sidecar location for a source file: `<source>.upload`.
pub fn sidecar_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Writes the sidecar with owner-only permissions.
pub(crate) async fn save(source: &Path, id: &str) -> Result<(), ClientError> {
    let path = sidecar_path(source);
    info!(path = %path.display(), id, "saving resume state");

    let data = serde_json::to_vec(&SidecarFile { id: id.to_owned() }).map_err(|source| {
        ClientError::Sidecar {
            path: path.clone(),
            source,
        }
    })?;

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);

    let mut file = opts.open(&path).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Reads the stored ID, or `None` if no sidecar exists.
pub(crate) async fn load(source: &Path) -> Result<Option<String>, ClientError> {
    let path = sidecar_path(source);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let parsed: SidecarFile =
        serde_json::from_slice(&data).map_err(|source| ClientError::Sidecar { path, source })?;
    Ok(Some(parsed.id))
}

/// Removes the sidecar.
pub(crate) async fn remove(source: &Path) -> Result<(), ClientError> {
    Ok(tokio::fs::remove_file(sidecar_path(source)).await?)
}
