//! TCP transfer server.
//!
//! Binds a listener, accepts connections, and dispatches each one to the
//! RPC handler named by its first byte. Every connection carries exactly one
//! RPC; failures are answered with an error frame carrying the status code
//! for the failure kind.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, tcp};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use blockhaul_protocol::wire::{
    self, CreateUploadResponse, OffsetResponse, REQ_CREATE_UPLOAD, REQ_DOWNLOAD, REQ_GET_OFFSET,
    REQ_UPLOAD_OPEN,
};
use blockhaul_protocol::{DEFAULT_BLOCK_SIZE, ProtocolError, clamp_block_size};

use crate::hooks::TransferHooks;
use crate::registry::Registry;
use crate::TransferError;

/// Read/write buffer size per connection (256 KiB).
const IO_BUFFER_SIZE: usize = 256 * 1024;

pub(crate) type ConnReader = BufReader<tcp::OwnedReadHalf>;
pub(crate) type ConnWriter = BufWriter<tcp::OwnedWriteHalf>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub listen_addr: SocketAddr,
    /// Directory holding in-progress and accepted files.
    pub incoming_dir: PathBuf,
    /// Block size advertised to clients; clamped into the protocol range.
    pub preferred_block_size: i64,
    /// Per-read idle deadline on every connection.
    pub read_timeout: Duration,
    /// Lifecycle observer hooks.
    pub hooks: TransferHooks,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 4200).into(),
            incoming_dir: PathBuf::from("incoming"),
            preferred_block_size: DEFAULT_BLOCK_SIZE,
            read_timeout: Duration::from_secs(30),
            hooks: TransferHooks::default(),
        }
    }
}

/// The transfer server.
pub struct TransferServer {
    registry: Registry,
    hooks: TransferHooks,
    preferred_block_size: i64,
    read_timeout: Duration,
    listen_addr: SocketAddr,
    cancel: CancellationToken,
    local_addr: tokio::sync::Mutex<Option<SocketAddr>>,
}

impl TransferServer {
    /// Creates a server, opening (and if needed creating) the incoming
    /// store.
    pub async fn new(config: ServerConfig) -> Result<Arc<TransferServer>, TransferError> {
        let registry = Registry::open(config.incoming_dir).await?;
        Ok(Arc::new(TransferServer {
            registry,
            hooks: config.hooks,
            preferred_block_size: clamp_block_size(config.preferred_block_size),
            read_timeout: config.read_timeout,
            listen_addr: config.listen_addr,
            cancel: CancellationToken::new(),
            local_addr: tokio::sync::Mutex::new(None),
        }))
    }

    /// The session registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The address the server is listening on, once [`run`](Self::run) has
    /// bound the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Requests a graceful shutdown of the accept loop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation, then drains in-flight
    /// connections and the registry.
    pub async fn run(self: &Arc<Self>) -> Result<(), TransferError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!(%local_addr, "transfer server listening");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            connections.spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, "connection failed: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }

                // Reap finished connection tasks as they complete.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);

        // Let in-flight streams run to an outcome before the registry
        // force-finishes their sessions; an idle stream hits its own read
        // deadline within this window. Stragglers are aborted.
        let drained = tokio::time::timeout(self.read_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                active = connections.len(),
                "aborting connections still active at shutdown"
            );
            connections.shutdown().await;
        }

        self.registry.shutdown().await
    }

    /// Bounds a frame read with the configured idle deadline.
    pub(crate) async fn timed<T, F>(&self, fut: F) -> Result<T, TransferError>
    where
        F: Future<Output = Result<T, ProtocolError>>,
    {
        match tokio::time::timeout(self.read_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(TransferError::Timeout),
        }
    }

    /// Handles one connection: dispatch on the request tag, answer failures
    /// with an error frame.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), TransferError> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(IO_BUFFER_SIZE, reader);
        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, writer);

        let tag = self.timed(wire::read_request_tag(&mut reader)).await?;

        let result = match tag {
            REQ_CREATE_UPLOAD => self.handle_create_upload(&mut reader, &mut writer).await,
            REQ_GET_OFFSET => self.handle_get_offset(&mut reader, &mut writer).await,
            REQ_UPLOAD_OPEN => self.handle_upload(&mut reader, &mut writer, peer_addr).await,
            REQ_DOWNLOAD => self.handle_download(&mut reader, &mut writer).await,
            tag => Err(ProtocolError::UnexpectedFrame { got: tag }.into()),
        };

        match result {
            Ok(()) => {
                writer.flush().await?;
                Ok(())
            }
            Err(e) => {
                // Best effort: the peer may already be gone.
                let _ = wire::write_error(&mut writer, e.status(), &e.to_string()).await;
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                Err(e)
            }
        }
    }

    async fn handle_create_upload(
        &self,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
    ) -> Result<(), TransferError> {
        let req = self.timed(wire::read_create_upload(reader)).await?;
        if req.size < 0 {
            return Err(ProtocolError::Malformed(format!(
                "negative declared size {}",
                req.size
            ))
            .into());
        }

        let session = self
            .registry
            .create(req.size, req.file_sha256, req.metadata)
            .await?;

        info!(id = %session.id(), size = session.size(), "upload created");
        self.hooks.fire_created(&session, session.offset().await);

        wire::write_created(
            writer,
            &CreateUploadResponse {
                id: session.id().to_string(),
                preferred_block_size: self.preferred_block_size,
            },
        )
        .await?;
        Ok(())
    }

    async fn handle_get_offset(
        &self,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
    ) -> Result<(), TransferError> {
        let id = self.timed(wire::read_get_offset(reader)).await?;

        let session = self
            .registry
            .get(&id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        let offset = session.offset().await;

        wire::write_offset_response(
            writer,
            &OffsetResponse {
                offset,
                preferred_block_size: self.preferred_block_size,
            },
        )
        .await?;
        Ok(())
    }

    pub(crate) fn hooks(&self) -> &TransferHooks {
        &self.hooks
    }

    pub(crate) fn preferred_block_size(&self) -> i64 {
        self.preferred_block_size
    }
}
