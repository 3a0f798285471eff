//! Server side of the blockhaul transfer service.
//!
//! Accepts framed RPC connections over TCP and drives the upload/download
//! state machines against an in-memory session registry backed by the
//! sharded incoming file store. Sessions do not survive a process restart;
//! the client-side resume state does, and a resuming client whose server
//! restarted sees NotFound and starts over.

mod download;
mod hooks;
mod registry;
mod server;
mod session;
mod upload;

pub use hooks::{Hook, TransferHooks};
pub use registry::Registry;
pub use server::{ServerConfig, TransferServer};
pub use session::UploadSession;

use blockhaul_protocol::{ProtocolError, Status};
use blockhaul_store::StoreError;

/// Errors produced by the transfer server.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("upload id not found: {0}")]
    NotFound(String),

    #[error("offset mismatch, server={server}, client={client}")]
    OffsetMismatch { server: i64, client: i64 },

    #[error("block checksum did not match")]
    BlockDigestMismatch,

    #[error("checksum mismatch for whole file")]
    FileDigestMismatch,

    #[error("attempted to write more bytes than the declared file size")]
    Overflow,

    #[error("upload incomplete")]
    Incomplete,

    #[error("upload stream ended before the first block")]
    FirstBlockMissing,

    #[error("connection idle past the read deadline")]
    Timeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("shutdown finished {} upload(s) with errors", .0.len())]
    Shutdown(Vec<TransferError>),
}

impl TransferError {
    /// Maps the error onto the wire status vocabulary.
    pub fn status(&self) -> Status {
        match self {
            TransferError::NotFound(_) => Status::NotFound,
            TransferError::OffsetMismatch { .. }
            | TransferError::Overflow
            | TransferError::Incomplete
            | TransferError::FirstBlockMissing => Status::FailedPrecondition,
            TransferError::BlockDigestMismatch | TransferError::FileDigestMismatch => {
                Status::DataLoss
            }
            TransferError::Timeout => Status::DeadlineExceeded,
            TransferError::Store(StoreError::InvalidId(_)) => Status::InvalidArgument,
            TransferError::Store(StoreError::NotFound(_)) => Status::NotFound,
            TransferError::Store(_) => Status::Internal,
            TransferError::Io(_) | TransferError::Shutdown(_) => Status::Internal,
            TransferError::Protocol(ProtocolError::Io(_)) => Status::Unknown,
            TransferError::Protocol(ProtocolError::Remote { status, .. }) => *status,
            TransferError::Protocol(_) => Status::InvalidArgument,
        }
    }
}
