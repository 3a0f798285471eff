//! TCP wire protocol for the blockhaul transfer service.
//!
//! Each TCP connection carries exactly one RPC. The first byte of the
//! connection identifies the request; the server answers with one or more
//! response frames. See [`wire`] for the binary layout of every frame.
//!
//! Block-size negotiation is part of the protocol contract: both endpoints
//! clamp independently, so a peer must be prepared to use an effective block
//! size different from what it asked for.

pub mod status;
pub mod wire;

pub use status::Status;
pub use wire::{
    CreateUploadRequest, CreateUploadResponse, DownloadBlock, DownloadRequest, OffsetResponse,
    UploadBlock, UploadFrame,
};

/// Smallest block size either endpoint will use (10 KiB).
pub const MIN_BLOCK_SIZE: i64 = 10 * 1024;

/// Largest block size either endpoint will use (2 MiB).
pub const MAX_BLOCK_SIZE: i64 = 2 * 1024 * 1024;

/// Block size used when the peer did not express a preference (1 MiB).
pub const DEFAULT_BLOCK_SIZE: i64 = MAX_BLOCK_SIZE / 2;

/// Maximum length of an ID on the wire.
///
/// A 128-bit integer is at most 25 base-36 digits; 64 leaves slack without
/// letting a peer allocate unbounded memory.
pub const MAX_ID_LEN: usize = 64;

/// Maximum length of the opaque metadata blob on CreateUpload (64 KiB).
pub const MAX_METADATA_LEN: usize = 64 * 1024;

/// Length of a SHA-256 digest on the wire.
pub const SHA256_LEN: usize = 32;

/// Clamps a block size into `[MIN_BLOCK_SIZE, MAX_BLOCK_SIZE]`.
///
/// A size of zero means "no preference" and yields [`DEFAULT_BLOCK_SIZE`].
pub fn clamp_block_size(bs: i64) -> i64 {
    if bs == 0 {
        return DEFAULT_BLOCK_SIZE;
    }
    bs.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

/// Errors produced while encoding or decoding protocol frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unexpected frame tag {got:#04x}")]
    UnexpectedFrame { got: u8 },

    #[error("remote error ({status}): {message}")]
    Remote { status: Status, message: String },
}
