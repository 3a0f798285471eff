//! Download stream handler.

use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tracing::info;

use blockhaul_protocol::wire::{self, DownloadBlock};
use blockhaul_protocol::{ProtocolError, clamp_block_size};
use blockhaul_store::{UploadId, sha256_bytes};

use crate::server::{ConnReader, ConnWriter, TransferServer};
use crate::TransferError;

impl TransferServer {
    pub(crate) async fn handle_download(
        &self,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
    ) -> Result<(), TransferError> {
        let req = self.timed(wire::read_download_request(reader)).await?;
        let block_size = clamp_block_size(req.preferred_block_size);

        info!(id = %req.id, offset = req.offset, block_size, "download");

        if req.offset < 0 {
            return Err(ProtocolError::Malformed(format!(
                "negative download offset {}",
                req.offset
            ))
            .into());
        }

        let id = UploadId::parse(&req.id)?;
        let mut file = self.registry().store().open_read_only(&id).await?;

        if req.offset > 0 {
            file.seek(SeekFrom::Start(req.offset as u64)).await?;
        }

        let mut buf = vec![0u8; block_size as usize];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            wire::write_download_block(
                writer,
                &DownloadBlock {
                    sha256: sha256_bytes(&buf[..n]),
                    data: buf[..n].to_vec(),
                },
            )
            .await?;
        }

        wire::write_download_end(writer).await?;
        Ok(())
    }
}
