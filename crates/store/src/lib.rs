//! Content-addressed incoming store for the blockhaul transfer service.
//!
//! Provides opaque 128-bit upload identifiers, the sharded on-disk file
//! store keyed by those identifiers, and the SHA-256 helpers both transfer
//! endpoints verify blocks with.

mod checksum;
mod filestore;
mod id;

pub use checksum::{sha256_bytes, sha256_file};
pub use filestore::FileStore;
pub use id::UploadId;

/// Errors produced by the store crate.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("no stored file for id {0}")]
    NotFound(String),

    #[error("file for id {0} already exists")]
    AlreadyExists(String),
}
