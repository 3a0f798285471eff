//! Binary frame layout.
//!
//! # Wire format
//!
//! ```text
//! REQUESTS (client -> server), first byte of the connection:
//!   CREATE_UPLOAD (0x01): [8 BE: size][1: has_sha256][32: sha256?][4 BE: meta_len][meta]
//!   GET_OFFSET    (0x02): [2 BE: id_len][id UTF-8]
//!   UPLOAD_OPEN   (0x03): opens an upload stream, then:
//!     BLOCK       (0x04): [2 BE: id_len][id][8 BE: offset][32: sha256][4 BE: data_len][data]
//!     STREAM_END  (0x05): (empty)
//!   DOWNLOAD      (0x06): [2 BE: id_len][id][8 BE: offset][8 BE: preferred_blocksize]
//!
//! RESPONSES (server -> client):
//!   CREATED        (0x81): [2 BE: id_len][id][8 BE: preferred_blocksize]
//!   OFFSET         (0x82): [8 BE: offset][8 BE: preferred_blocksize]
//!   UPLOAD_OK      (0x83): (empty)
//!   DOWNLOAD_BLOCK (0x84): [32: sha256][4 BE: data_len][data]
//!   DOWNLOAD_END   (0x85): (empty)
//!   ERROR          (0xff): [1: status][2 BE: msg_len][msg UTF-8]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::status::Status;
use crate::{MAX_BLOCK_SIZE, MAX_ID_LEN, MAX_METADATA_LEN, ProtocolError, SHA256_LEN};

/// Request tag: create a new upload.
pub const REQ_CREATE_UPLOAD: u8 = 0x01;

/// Request tag: query the durable offset of an upload.
pub const REQ_GET_OFFSET: u8 = 0x02;

/// Request tag: open an upload stream.
pub const REQ_UPLOAD_OPEN: u8 = 0x03;

/// Stream frame: one upload block.
pub const FRAME_BLOCK: u8 = 0x04;

/// Stream frame: client half-close.
pub const FRAME_STREAM_END: u8 = 0x05;

/// Request tag: download a stored file.
pub const REQ_DOWNLOAD: u8 = 0x06;

/// Response tag: upload created.
pub const RESP_CREATED: u8 = 0x81;

/// Response tag: offset answer.
pub const RESP_OFFSET: u8 = 0x82;

/// Response tag: upload stream accepted in full.
pub const RESP_UPLOAD_OK: u8 = 0x83;

/// Response tag: one download block.
pub const RESP_DOWNLOAD_BLOCK: u8 = 0x84;

/// Response tag: download complete.
pub const RESP_DOWNLOAD_END: u8 = 0x85;

/// Response tag: RPC failed; carries a status code and message.
pub const FRAME_ERROR: u8 = 0xff;

/// CreateUpload request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUploadRequest {
    /// Total number of bytes the client promises to upload.
    pub size: i64,
    /// Optional SHA-256 of the complete file, enforced at finish.
    pub file_sha256: Option<[u8; 32]>,
    /// Opaque client-supplied metadata, handed to observer hooks.
    pub metadata: Vec<u8>,
}

/// CreateUpload response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUploadResponse {
    pub id: String,
    pub preferred_block_size: i64,
}

/// GetOffset response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetResponse {
    pub offset: i64,
    pub preferred_block_size: i64,
}

/// One block of an upload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBlock {
    pub id: String,
    pub offset: i64,
    pub sha256: [u8; 32],
    pub data: Vec<u8>,
}

/// Download request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub id: String,
    pub offset: i64,
    pub preferred_block_size: i64,
}

/// One block of a download stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBlock {
    pub sha256: [u8; 32],
    pub data: Vec<u8>,
}

/// A frame received on an open upload stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFrame {
    Block(UploadBlock),
    End,
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

async fn write_id<W: AsyncWrite + Unpin>(writer: &mut W, id: &str) -> Result<(), ProtocolError> {
    let bytes = id.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_ID_LEN {
        return Err(ProtocolError::Malformed(format!(
            "id length {} out of range (1..={MAX_ID_LEN})",
            bytes.len()
        )));
    }
    writer.write_u16(bytes.len() as u16).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_id<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let len = reader.read_u16().await? as usize;
    if len == 0 || len > MAX_ID_LEN {
        return Err(ProtocolError::Malformed(format!(
            "id length {len} out of range (1..={MAX_ID_LEN})"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| ProtocolError::Malformed(format!("id not UTF-8: {e}")))
}

async fn read_sha256<R: AsyncRead + Unpin>(reader: &mut R) -> Result<[u8; 32], ProtocolError> {
    let mut digest = [0u8; SHA256_LEN];
    reader.read_exact(&mut digest).await?;
    Ok(digest)
}

async fn write_data<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() as i64 > MAX_BLOCK_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "block of {} bytes exceeds maximum {MAX_BLOCK_SIZE}",
            data.len()
        )));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(data).await?;
    Ok(())
}

async fn read_data<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_u32().await? as usize;
    if len as i64 > MAX_BLOCK_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "block of {len} bytes exceeds maximum {MAX_BLOCK_SIZE}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads an error frame body and converts it into [`ProtocolError::Remote`].
async fn read_error_body<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolError {
    let status = match reader.read_u8().await {
        Ok(code) => Status::from_u8(code),
        Err(e) => return ProtocolError::Io(e),
    };
    let message = async {
        let len = reader.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
    }
    .await
    .unwrap_or_default();

    ProtocolError::Remote { status, message }
}

/// Reads a response tag, resolving an error frame into `Remote` and checking
/// the tag against `expected`.
async fn expect_tag<R: AsyncRead + Unpin>(reader: &mut R, expected: u8) -> Result<(), ProtocolError> {
    let tag = reader.read_u8().await?;
    if tag == FRAME_ERROR {
        return Err(read_error_body(reader).await);
    }
    if tag != expected {
        return Err(ProtocolError::UnexpectedFrame { got: tag });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Reads the request tag that opens a connection.
pub async fn read_request_tag<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8, ProtocolError> {
    Ok(reader.read_u8().await?)
}

/// Writes a CreateUpload request, tag included.
pub async fn write_create_upload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    req: &CreateUploadRequest,
) -> Result<(), ProtocolError> {
    if req.metadata.len() > MAX_METADATA_LEN {
        return Err(ProtocolError::Malformed(format!(
            "metadata of {} bytes exceeds maximum {MAX_METADATA_LEN}",
            req.metadata.len()
        )));
    }
    writer.write_u8(REQ_CREATE_UPLOAD).await?;
    writer.write_i64(req.size).await?;
    match &req.file_sha256 {
        Some(digest) => {
            writer.write_u8(1).await?;
            writer.write_all(digest).await?;
        }
        None => writer.write_u8(0).await?,
    }
    writer.write_u32(req.metadata.len() as u32).await?;
    writer.write_all(&req.metadata).await?;
    Ok(())
}

/// Reads a CreateUpload request body (tag already consumed).
pub async fn read_create_upload<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<CreateUploadRequest, ProtocolError> {
    let size = reader.read_i64().await?;
    let file_sha256 = match reader.read_u8().await? {
        0 => None,
        1 => Some(read_sha256(reader).await?),
        flag => {
            return Err(ProtocolError::Malformed(format!(
                "invalid sha256 presence flag {flag:#04x}"
            )));
        }
    };
    let meta_len = reader.read_u32().await? as usize;
    if meta_len > MAX_METADATA_LEN {
        return Err(ProtocolError::Malformed(format!(
            "metadata of {meta_len} bytes exceeds maximum {MAX_METADATA_LEN}"
        )));
    }
    let mut metadata = vec![0u8; meta_len];
    reader.read_exact(&mut metadata).await?;
    Ok(CreateUploadRequest {
        size,
        file_sha256,
        metadata,
    })
}

/// Writes a GetOffset request, tag included.
pub async fn write_get_offset<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: &str,
) -> Result<(), ProtocolError> {
    writer.write_u8(REQ_GET_OFFSET).await?;
    write_id(writer, id).await
}

/// Reads a GetOffset request body (tag already consumed).
pub async fn read_get_offset<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    read_id(reader).await
}

/// Writes the upload stream opener.
pub async fn write_upload_open<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_u8(REQ_UPLOAD_OPEN).await?;
    Ok(())
}

/// Writes one upload block frame.
pub async fn write_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    block: &UploadBlock,
) -> Result<(), ProtocolError> {
    writer.write_u8(FRAME_BLOCK).await?;
    write_id(writer, &block.id).await?;
    writer.write_i64(block.offset).await?;
    writer.write_all(&block.sha256).await?;
    write_data(writer, &block.data).await
}

/// Writes the upload stream half-close frame.
pub async fn write_stream_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_u8(FRAME_STREAM_END).await?;
    Ok(())
}

/// Reads the next frame of an open upload stream.
pub async fn read_upload_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<UploadFrame, ProtocolError> {
    match reader.read_u8().await? {
        FRAME_STREAM_END => Ok(UploadFrame::End),
        FRAME_BLOCK => {
            let id = read_id(reader).await?;
            let offset = reader.read_i64().await?;
            let sha256 = read_sha256(reader).await?;
            let data = read_data(reader).await?;
            Ok(UploadFrame::Block(UploadBlock {
                id,
                offset,
                sha256,
                data,
            }))
        }
        tag => Err(ProtocolError::UnexpectedFrame { got: tag }),
    }
}

/// Writes a Download request, tag included.
pub async fn write_download_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    req: &DownloadRequest,
) -> Result<(), ProtocolError> {
    writer.write_u8(REQ_DOWNLOAD).await?;
    write_id(writer, &req.id).await?;
    writer.write_i64(req.offset).await?;
    writer.write_i64(req.preferred_block_size).await?;
    Ok(())
}

/// Reads a Download request body (tag already consumed).
pub async fn read_download_request<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<DownloadRequest, ProtocolError> {
    let id = read_id(reader).await?;
    let offset = reader.read_i64().await?;
    let preferred_block_size = reader.read_i64().await?;
    Ok(DownloadRequest {
        id,
        offset,
        preferred_block_size,
    })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Writes a CreateUpload response.
pub async fn write_created<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &CreateUploadResponse,
) -> Result<(), ProtocolError> {
    writer.write_u8(RESP_CREATED).await?;
    write_id(writer, &resp.id).await?;
    writer.write_i64(resp.preferred_block_size).await?;
    Ok(())
}

/// Reads a CreateUpload response, surfacing error frames as `Remote`.
pub async fn read_created<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<CreateUploadResponse, ProtocolError> {
    expect_tag(reader, RESP_CREATED).await?;
    let id = read_id(reader).await?;
    let preferred_block_size = reader.read_i64().await?;
    Ok(CreateUploadResponse {
        id,
        preferred_block_size,
    })
}

/// Writes a GetOffset response.
pub async fn write_offset_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &OffsetResponse,
) -> Result<(), ProtocolError> {
    writer.write_u8(RESP_OFFSET).await?;
    writer.write_i64(resp.offset).await?;
    writer.write_i64(resp.preferred_block_size).await?;
    Ok(())
}

/// Reads a GetOffset response, surfacing error frames as `Remote`.
pub async fn read_offset_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<OffsetResponse, ProtocolError> {
    expect_tag(reader, RESP_OFFSET).await?;
    let offset = reader.read_i64().await?;
    let preferred_block_size = reader.read_i64().await?;
    Ok(OffsetResponse {
        offset,
        preferred_block_size,
    })
}

/// Writes the upload-accepted response.
pub async fn write_upload_ok<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_u8(RESP_UPLOAD_OK).await?;
    Ok(())
}

/// Reads the upload stream response, surfacing error frames as `Remote`.
pub async fn read_upload_ok<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ProtocolError> {
    expect_tag(reader, RESP_UPLOAD_OK).await
}

/// Writes one download block frame.
pub async fn write_download_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    block: &DownloadBlock,
) -> Result<(), ProtocolError> {
    writer.write_u8(RESP_DOWNLOAD_BLOCK).await?;
    writer.write_all(&block.sha256).await?;
    write_data(writer, &block.data).await
}

/// Writes the download end frame.
pub async fn write_download_end<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ProtocolError> {
    writer.write_u8(RESP_DOWNLOAD_END).await?;
    Ok(())
}

/// Reads the next download frame.
///
/// Returns `None` at the end-of-stream frame; error frames surface as
/// `Remote`.
pub async fn read_download_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<DownloadBlock>, ProtocolError> {
    match reader.read_u8().await? {
        RESP_DOWNLOAD_END => Ok(None),
        RESP_DOWNLOAD_BLOCK => {
            let sha256 = read_sha256(reader).await?;
            let data = read_data(reader).await?;
            Ok(Some(DownloadBlock { sha256, data }))
        }
        FRAME_ERROR => Err(read_error_body(reader).await),
        tag => Err(ProtocolError::UnexpectedFrame { got: tag }),
    }
}

/// Writes an error frame.
pub async fn write_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: Status,
    message: &str,
) -> Result<(), ProtocolError> {
    let bytes = message.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    writer.write_u8(FRAME_ERROR).await?;
    writer.write_u8(status as u8).await?;
    writer.write_u16(len as u16).await?;
    writer.write_all(&bytes[..len]).await?;
    Ok(())
}
