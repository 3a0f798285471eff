//! Transfer client.
//!
//! One TCP connection per RPC: CreateUpload, GetOffset, the upload stream,
//! and the download stream. The upload path implements the resume protocol:
//! consult the sidecar, negotiate the starting offset with the server, seek,
//! and stream blocks from there.

use std::path::Path;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter, SeekFrom};
use tokio::net::{TcpStream, tcp};
use tracing::{debug, info};

use blockhaul_protocol::wire::{
    self, CreateUploadRequest, CreateUploadResponse, DownloadRequest, OffsetResponse, UploadBlock,
};
use blockhaul_protocol::{ProtocolError, clamp_block_size};
use blockhaul_store::sha256_bytes;

use crate::{ClientError, state};

/// How long to wait for the TCP connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a late error frame after a send failure.
const ERROR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Write buffer size for the upload stream (256 KiB).
const IO_BUFFER_SIZE: usize = 256 * 1024;

type ConnReader = BufReader<tcp::OwnedReadHalf>;
type ConnWriter = BufWriter<tcp::OwnedWriteHalf>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub server_addr: String,
    /// Fault injection: silently stop after this many sent blocks without
    /// closing the stream (0 = disabled). The sidecar stays in place so the
    /// next run resumes.
    pub quit_after: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:4200".into(),
            quit_after: 0,
        }
    }
}

/// Upload state carried through one upload run.
struct UploadState {
    id: String,
    offset: i64,
    block_size: i64,
}

/// The transfer client.
pub struct TransferClient {
    config: ClientConfig,
}

impl TransferClient {
    pub fn new(config: ClientConfig) -> TransferClient {
        TransferClient { config }
    }

    async fn connect(&self) -> Result<(ConnReader, ConnWriter), ClientError> {
        let stream = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(&self.config.server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(ClientError::Timeout),
        };

        let (reader, writer) = stream.into_split();
        Ok((
            BufReader::with_capacity(IO_BUFFER_SIZE, reader),
            BufWriter::with_capacity(IO_BUFFER_SIZE, writer),
        ))
    }

    /// Registers a new upload with the server.
    pub async fn create_upload(
        &self,
        size: i64,
        file_sha256: Option<[u8; 32]>,
        metadata: &[u8],
    ) -> Result<CreateUploadResponse, ClientError> {
        let (mut reader, mut writer) = self.connect().await?;

        wire::write_create_upload(
            &mut writer,
            &CreateUploadRequest {
                size,
                file_sha256,
                metadata: metadata.to_vec(),
            },
        )
        .await?;
        writer.flush().await?;

        Ok(wire::read_created(&mut reader).await?)
    }

    /// Asks the server for the durable offset of an upload.
    pub async fn get_offset(&self, id: &str) -> Result<OffsetResponse, ClientError> {
        let (mut reader, mut writer) = self.connect().await?;

        wire::write_get_offset(&mut writer, id).await?;
        writer.flush().await?;

        Ok(wire::read_offset_response(&mut reader).await?)
    }

    /// Uploads `path`, creating a new session or resuming a previous one.
    ///
    /// Returns the upload ID. On success the sidecar is removed; on any
    /// failure it stays so the next invocation resumes from the server's
    /// offset.
    pub async fn upload(&self, path: &Path, metadata: &[u8]) -> Result<String, ClientError> {
        let state = self.create_or_resume(path, metadata).await?;

        let mut file = File::open(path).await?;
        let pos = file.seek(SeekFrom::Start(state.offset as u64)).await?;
        if pos != state.offset as u64 {
            return Err(ClientError::SeekMismatch {
                expected: state.offset,
                actual: pos as i64,
            });
        }

        let (mut reader, mut writer) = self.connect().await?;
        wire::write_upload_open(&mut writer).await?;

        let mut buf = vec![0u8; state.block_size as usize];
        let mut offset = state.offset;

        for sent in 1usize.. {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            let block = UploadBlock {
                id: state.id.clone(),
                offset,
                sha256: sha256_bytes(&buf[..n]),
                data: buf[..n].to_vec(),
            };
            if let Err(e) = wire::write_block(&mut writer, &block).await {
                return Err(surface_stream_error(&mut reader, e).await);
            }

            offset += n as i64;
            debug!(id = %state.id, block = sent, offset, "block sent");

            if self.config.quit_after > 0 && sent == self.config.quit_after {
                // Push buffered blocks onto the wire, then vanish without
                // closing the stream.
                if let Err(e) = writer.flush().await {
                    return Err(surface_stream_error(&mut reader, ProtocolError::Io(e)).await);
                }
                info!(
                    quit_after = self.config.quit_after,
                    "quitting after configured number of blocks"
                );
                return Ok(state.id);
            }
        }

        if let Err(e) = wire::write_stream_end(&mut writer).await {
            return Err(surface_stream_error(&mut reader, e).await);
        }
        if let Err(e) = writer.flush().await {
            return Err(surface_stream_error(&mut reader, ProtocolError::Io(e)).await);
        }

        wire::read_upload_ok(&mut reader).await?;

        // Uploaded and acknowledged; the resume state has served its
        // purpose. A failed removal is worth a log line, not a failed
        // upload.
        if let Err(e) = state::remove(path).await {
            tracing::error!(path = %path.display(), "failed to remove resume state: {e}");
        }
        Ok(state.id)
    }

    /// Downloads the stored file `id` into `dst`.
    ///
    /// Refuses to overwrite an existing destination.
    pub async fn download(&self, id: &str, dst: &Path) -> Result<(), ClientError> {
        self.download_at(id, dst, 0).await
    }

    /// Downloads starting at `offset`; `dst` receives only the tail.
    pub async fn download_at(&self, id: &str, dst: &Path, offset: i64) -> Result<(), ClientError> {
        // Open the destination first so a clobber is caught before the
        // server does any work.
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).append(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut out = opts.open(dst).await?;

        let (mut reader, mut writer) = self.connect().await?;
        wire::write_download_request(
            &mut writer,
            &DownloadRequest {
                id: id.to_owned(),
                offset,
                preferred_block_size: 0,
            },
        )
        .await?;
        writer.flush().await?;

        while let Some(block) = wire::read_download_frame(&mut reader).await? {
            if sha256_bytes(&block.data) != block.sha256 {
                return Err(ClientError::DigestMismatch);
            }
            out.write_all(&block.data).await?;
        }

        out.sync_all().await?;
        Ok(())
    }

    /// The resume decision: an existing sidecar means ask the server where
    /// to continue; otherwise create a fresh upload and persist its ID.
    async fn create_or_resume(
        &self,
        path: &Path,
        metadata: &[u8],
    ) -> Result<UploadState, ClientError> {
        let size = tokio::fs::metadata(path).await?.len() as i64;

        if let Some(id) = state::load(path).await? {
            info!(path = %path.display(), id = %id, "resuming upload");
            let resp = self.get_offset(&id).await?;
            info!(offset = resp.offset, "server offset received");
            return Ok(UploadState {
                id,
                offset: resp.offset,
                block_size: clamp_block_size(resp.preferred_block_size),
            });
        }

        info!(path = %path.display(), size, "new upload");
        let resp = self.create_upload(size, None, metadata).await?;
        state::save(path, &resp.id).await?;
        Ok(UploadState {
            id: resp.id,
            offset: 0,
            block_size: clamp_block_size(resp.preferred_block_size),
        })
    }
}

/// After a send failure, the server's error frame may still be in flight;
/// prefer it over the bare transport error when it arrives in time.
async fn surface_stream_error(reader: &mut ConnReader, fallback: ProtocolError) -> ClientError {
    match tokio::time::timeout(ERROR_DRAIN_TIMEOUT, wire::read_upload_ok(reader)).await {
        Ok(Err(remote @ ProtocolError::Remote { .. })) => remote.into(),
        _ => fallback.into(),
    }
}
