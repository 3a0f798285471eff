//! Client side of the blockhaul transfer service.
//!
//! Drives uploads and downloads over the framed TCP protocol. Upload
//! progress survives process death through a small sidecar file next to the
//! source (`<source>.upload`) holding the server-assigned ID; on the next
//! run the client asks the server for the durable offset and resumes from
//! there.

mod client;
mod state;

pub use client::{ClientConfig, TransferClient};
pub use state::sidecar_path;

use std::path::PathBuf;

use blockhaul_protocol::{ProtocolError, Status};

/// Errors produced by the transfer client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection timed out")]
    Timeout,

    #[error("block checksum verification failed")]
    DigestMismatch,

    #[error("seek mismatch, wanted offset {expected}, file is at {actual}")]
    SeekMismatch { expected: i64, actual: i64 },

    #[error("invalid resume state file {path}: {source}")]
    Sidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl ClientError {
    /// The status code of the server-side failure, if this error is one.
    pub fn remote_status(&self) -> Option<Status> {
        match self {
            ClientError::Protocol(ProtocolError::Remote { status, .. }) => Some(*status),
            _ => None,
        }
    }
}
