//! Upload stream handler.
//!
//! A stream starts with no session attached; the first block names it. From
//! then on each block must carry the exact offset the session sits at and a
//! digest matching its payload. Clean stream end with the declared size
//! reached finishes the session; any failure terminates the stream and
//! leaves the session in the registry so the client can resume from the
//! preserved offset.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info};

use blockhaul_protocol::wire::{self, UploadFrame};
use blockhaul_store::sha256_bytes;

use crate::server::{ConnReader, ConnWriter, TransferServer};
use crate::session::UploadSession;
use crate::TransferError;

impl TransferServer {
    pub(crate) async fn handle_upload(
        &self,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
        peer_addr: SocketAddr,
    ) -> Result<(), TransferError> {
        let mut session: Option<Arc<UploadSession>> = None;

        loop {
            let frame = match self.timed(wire::read_upload_frame(reader)).await {
                Ok(frame) => frame,
                Err(e) => {
                    // Transport died mid-stream; whatever landed stays the
                    // resume point.
                    error!(%peer_addr, "transfer stopped: {e}");
                    return Err(e);
                }
            };

            match frame {
                UploadFrame::End => {
                    let Some(session) = session else {
                        error!(%peer_addr, "transfer stopped on first block");
                        return Err(TransferError::FirstBlockMissing);
                    };

                    let offset = session.offset().await;
                    if offset != session.size() {
                        error!(id = %session.id(), %peer_addr, offset, "transfer stopped (end of stream)");
                        return Err(TransferError::Incomplete);
                    }

                    self.hooks().fire_finished(&session, offset);

                    let id = session.id().to_string();
                    self.registry().finish(&id).await?;
                    info!(id = %id, size = session.size(), "upload finished");

                    wire::write_upload_ok(writer).await?;
                    return Ok(());
                }

                UploadFrame::Block(block) => {
                    // The first block selects the session; it is not
                    // consumed by that, and still passes every check below.
                    let session = match &session {
                        Some(s) => Arc::clone(s),
                        None => {
                            let s = self
                                .registry()
                                .get(&block.id)
                                .ok_or_else(|| TransferError::NotFound(block.id.clone()))?;
                            session = Some(Arc::clone(&s));
                            s
                        }
                    };

                    let server_offset = session.offset().await;
                    if server_offset != block.offset {
                        return Err(TransferError::OffsetMismatch {
                            server: server_offset,
                            client: block.offset,
                        });
                    }

                    let checksum = sha256_bytes(&block.data);
                    if checksum != block.sha256 {
                        return Err(TransferError::BlockDigestMismatch);
                    }

                    let n = session.write(&block.data).await?;

                    let offset = session.offset().await;
                    self.hooks().fire_progress(&session, offset);

                    debug!(
                        id = %block.id,
                        offset,
                        size = n,
                        checksum = %hex::encode(checksum),
                        "wrote block"
                    );
                }
            }
        }
    }
}
