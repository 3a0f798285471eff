fn main() {
    println!("Run `cargo test -p e2e` to execute the end-to-end transfer scenarios.");
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
    use tokio::net::{TcpStream, tcp};

    use blockhaul_client::{ClientConfig, TransferClient, sidecar_path};
    use blockhaul_protocol::wire::{self, UploadBlock};
    use blockhaul_protocol::{ProtocolError, Status};
    use blockhaul_server::{ServerConfig, TransferHooks, TransferServer};
    use blockhaul_store::{FileStore, UploadId, sha256_bytes};

    const MIB: i64 = 1024 * 1024;

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        server: Arc<TransferServer>,
        handle: tokio::task::JoinHandle<()>,
        addr: String,
        incoming: std::path::PathBuf,
    }

    async fn start(dir: &Path, preferred_block_size: i64, hooks: TransferHooks) -> Harness {
        let incoming = dir.join("incoming");
        let config = ServerConfig {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            incoming_dir: incoming.clone(),
            preferred_block_size,
            hooks,
            ..ServerConfig::default()
        };
        let server = TransferServer::new(config).await.unwrap();
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });

        let mut addr = None;
        for _ in 0..200 {
            addr = server.local_addr().await;
            if addr.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        Harness {
            server,
            handle,
            addr: addr.expect("server did not bind").to_string(),
            incoming,
        }
    }

    impl Harness {
        fn client(&self) -> TransferClient {
            self.client_quitting(0)
        }

        fn client_quitting(&self, quit_after: usize) -> TransferClient {
            TransferClient::new(ClientConfig {
                server_addr: self.addr.clone(),
                quit_after,
            })
        }

        /// Reads the stored bytes for an upload straight off the incoming
        /// store.
        async fn stored_bytes(&self, id: &str) -> Vec<u8> {
            let store = FileStore::open(&self.incoming).await.unwrap();
            let path = store.map(&UploadId::parse(id).unwrap());
            tokio::fs::read(path).await.unwrap()
        }

        async fn stop(self) {
            self.server.shutdown();
            self.handle.await.unwrap();
        }
    }

    /// Deterministic filler.
    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn block(id: &str, offset: i64, data: Vec<u8>) -> UploadBlock {
        UploadBlock {
            id: id.to_owned(),
            offset,
            sha256: sha256_bytes(&data),
            data,
        }
    }

    type RawReader = BufReader<tcp::OwnedReadHalf>;
    type RawWriter = BufWriter<tcp::OwnedWriteHalf>;

    /// Opens a raw upload stream for hand-crafted block sequences.
    async fn open_upload_stream(addr: &str) -> (RawReader, RawWriter) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut writer = BufWriter::new(writer);
        wire::write_upload_open(&mut writer).await.unwrap();
        (BufReader::new(reader), writer)
    }

    async fn send_block(writer: &mut RawWriter, block: &UploadBlock) {
        wire::write_block(writer, block).await.unwrap();
        writer.flush().await.unwrap();
    }

    fn remote_status(err: ProtocolError) -> Status {
        match err {
            ProtocolError::Remote { status, .. } => status,
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    /// Happy path: three 1 MiB blocks, single stream.
    #[tokio::test]
    async fn upload_happy_path() {
        let dir = tempfile::tempdir().unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let finished_hook = Arc::clone(&finished);
        let hooks = TransferHooks {
            finished: Some(Arc::new(move |_path, _size, _offset, _meta| {
                finished_hook.fetch_add(1, Ordering::SeqCst);
            })),
            ..TransferHooks::default()
        };

        let harness = start(dir.path(), MIB, hooks).await;

        let data = pattern((3 * MIB) as usize);
        let source = dir.path().join("three-blocks.bin");
        tokio::fs::write(&source, &data).await.unwrap();

        let id = harness.client().upload(&source, &[1, 2, 3]).await.unwrap();

        assert!(!sidecar_path(&source).exists());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(harness.server.registry().is_empty());

        let stored = harness.stored_bytes(&id).await;
        assert_eq!(stored.len() as i64, 3 * MIB);
        assert_eq!(stored, data);

        harness.stop().await;
    }

    /// Resume after an abrupt client halt one block in.
    #[tokio::test]
    async fn resume_after_abrupt_halt() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;

        let data = pattern((3 * MIB) as usize);
        let source = dir.path().join("interrupted.bin");
        tokio::fs::write(&source, &data).await.unwrap();

        // First run sends one block and vanishes without closing the
        // stream.
        let id = harness
            .client_quitting(1)
            .upload(&source, &[])
            .await
            .unwrap();
        assert!(sidecar_path(&source).exists());

        // The server's durable offset converges on exactly one block.
        let mut offset = 0;
        for _ in 0..200 {
            offset = harness.client().get_offset(&id).await.unwrap().offset;
            if offset == MIB {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(offset, MIB);

        // Second run picks up at the offset and completes.
        let resumed = harness.client().upload(&source, &[]).await.unwrap();
        assert_eq!(resumed, id);
        assert!(!sidecar_path(&source).exists());

        assert_eq!(harness.stored_bytes(&id).await, data);

        harness.stop().await;
    }

    /// A block carrying a stale offset is rejected and moves nothing.
    #[tokio::test]
    async fn offset_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let created = client.create_upload(2 * MIB, None, &[]).await.unwrap();
        let data = pattern(MIB as usize);

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &block(&created.id, 0, data.clone())).await;
        // Replay offset 0 after the server advanced to 1 MiB.
        send_block(&mut writer, &block(&created.id, 0, data)).await;

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::FailedPrecondition);

        // The server offset is unchanged by the rejected block.
        let resp = client.get_offset(&created.id).await.unwrap();
        assert_eq!(resp.offset, MIB);

        harness.stop().await;
    }

    /// A corrupted payload with a stale digest is rejected before landing.
    #[tokio::test]
    async fn block_digest_corruption_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let created = client.create_upload(MIB, None, &[]).await.unwrap();

        let data = pattern(MIB as usize);
        let mut corrupt = block(&created.id, 0, data);
        // Flip one payload byte but keep the digest computed beforehand.
        corrupt.data[1234] ^= 0x01;

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &corrupt).await;

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::DataLoss);

        let resp = client.get_offset(&created.id).await.unwrap();
        assert_eq!(resp.offset, 0);

        harness.stop().await;
    }

    /// All blocks verify, but the declared whole-file digest does not.
    #[tokio::test]
    async fn whole_file_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let data = pattern(MIB as usize);
        let mut declared = sha256_bytes(&data);
        declared[0] ^= 0x01;

        let created = client
            .create_upload(MIB, Some(declared), &[])
            .await
            .unwrap();

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &block(&created.id, 0, data.clone())).await;
        wire::write_stream_end(&mut writer).await.unwrap();
        writer.flush().await.unwrap();

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::DataLoss);

        // The session is gone; the bytes stay on disk for the operator.
        assert!(harness.server.registry().get(&created.id).is_none());
        assert_eq!(harness.stored_bytes(&created.id).await, data);

        harness.stop().await;
    }

    /// Writing one byte past the declared size fails the stream.
    #[tokio::test]
    async fn overflow_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let created = client.create_upload(100, None, &[]).await.unwrap();

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &block(&created.id, 0, pattern(60))).await;
        // 60 + 41 = 101 > 100.
        send_block(&mut writer, &block(&created.id, 60, pattern(41))).await;

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::FailedPrecondition);

        let resp = client.get_offset(&created.id).await.unwrap();
        assert_eq!(resp.offset, 60);
        assert_eq!(harness.stored_bytes(&created.id).await.len(), 60);

        harness.stop().await;
    }

    /// A stream closed before the declared size is incomplete; the offset
    /// survives as the resume point.
    #[tokio::test]
    async fn early_stream_end_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let created = client.create_upload(2 * MIB, None, &[]).await.unwrap();

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &block(&created.id, 0, pattern(MIB as usize))).await;
        wire::write_stream_end(&mut writer).await.unwrap();
        writer.flush().await.unwrap();

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::FailedPrecondition);

        let resp = client.get_offset(&created.id).await.unwrap();
        assert_eq!(resp.offset, MIB);

        harness.stop().await;
    }

    /// A stream with zero blocks is rejected outright.
    #[tokio::test]
    async fn empty_stream_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        wire::write_stream_end(&mut writer).await.unwrap();
        writer.flush().await.unwrap();

        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::FailedPrecondition);

        harness.stop().await;
    }

    /// Unknown IDs surface as NotFound on every entry point.
    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let err = client.get_offset("zzzz").await.unwrap_err();
        assert_eq!(err.remote_status(), Some(Status::NotFound));

        let (mut reader, mut writer) = open_upload_stream(&harness.addr).await;
        send_block(&mut writer, &block("zzzz", 0, pattern(100))).await;
        let err = wire::read_upload_ok(&mut reader).await.unwrap_err();
        assert_eq!(remote_status(err), Status::NotFound);

        let dst = dir.path().join("missing-download");
        let err = client.download("zzzz", &dst).await.unwrap_err();
        assert_eq!(err.remote_status(), Some(Status::NotFound));

        harness.stop().await;
    }

    /// Three simultaneous uploads of 100 x 10 KiB blocks do not interfere.
    #[tokio::test]
    async fn concurrent_uploads_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), 10 * 1024, TransferHooks::default()).await;
        let client = harness.client();

        let block_size = 10 * 1024usize;
        let total = 100 * block_size;

        // Distinct payloads per upload.
        let payloads: Vec<Vec<u8>> = (0..3u8)
            .map(|n| pattern(total).iter().map(|b| b.wrapping_add(n)).collect())
            .collect();

        let mut ids = Vec::new();
        for payload in &payloads {
            let created = client
                .create_upload(payload.len() as i64, None, &[])
                .await
                .unwrap();
            ids.push(created.id);
        }
        assert_eq!(harness.server.registry().len(), 3);

        let mut tasks = Vec::new();
        for (id, payload) in ids.iter().cloned().zip(payloads.clone()) {
            let addr = harness.addr.clone();
            tasks.push(tokio::spawn(async move {
                let (mut reader, mut writer) = open_upload_stream(&addr).await;
                for (i, chunk) in payload.chunks(block_size).enumerate() {
                    let offset = (i * block_size) as i64;
                    send_block(&mut writer, &block(&id, offset, chunk.to_vec())).await;
                }
                wire::write_stream_end(&mut writer).await.unwrap();
                writer.flush().await.unwrap();
                wire::read_upload_ok(&mut reader).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(harness.server.registry().is_empty());
        for (id, payload) in ids.iter().zip(&payloads) {
            assert_eq!(&harness.stored_bytes(id).await, payload);
        }

        harness.stop().await;
    }

    /// Download honors the requested starting offset.
    #[tokio::test]
    async fn ranged_download() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;
        let client = harness.client();

        let data = pattern((2 * MIB) as usize);
        let source = dir.path().join("ranged.bin");
        tokio::fs::write(&source, &data).await.unwrap();
        let id = client.upload(&source, &[]).await.unwrap();

        let dst = dir.path().join("tail.bin");
        client.download_at(&id, &dst, MIB).await.unwrap();

        let tail = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(tail, data[MIB as usize..]);

        harness.stop().await;
    }

    /// A malformed ID on download is rejected as invalid, not as missing.
    #[tokio::test]
    async fn download_rejects_malformed_id() {
        let dir = tempfile::tempdir().unwrap();
        let harness = start(dir.path(), MIB, TransferHooks::default()).await;

        let dst = dir.path().join("never-written");
        let err = harness
            .client()
            .download("NOT-BASE-36", &dst)
            .await
            .unwrap_err();
        assert_eq!(err.remote_status(), Some(Status::InvalidArgument));

        harness.stop().await;
    }

    /// Hooks observe the full lifecycle: one created, one progress per
    /// block, one finished.
    #[tokio::test]
    async fn hooks_observe_lifecycle() {
        let dir = tempfile::tempdir().unwrap();

        let created = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (c, p, f) = (
            Arc::clone(&created),
            Arc::clone(&progress),
            Arc::clone(&finished),
        );
        let hooks = TransferHooks {
            created: Some(Arc::new(move |_, _, _, _| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            progress: Some(Arc::new(move |_, _, _, _| {
                p.fetch_add(1, Ordering::SeqCst);
            })),
            finished: Some(Arc::new(move |_, _, _, _| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        };

        let harness = start(dir.path(), MIB, hooks).await;

        let data = pattern((3 * MIB) as usize);
        let source = dir.path().join("observed.bin");
        tokio::fs::write(&source, &data).await.unwrap();
        harness.client().upload(&source, &[9]).await.unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(progress.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        harness.stop().await;
    }
}
