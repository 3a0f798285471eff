//! Blockhaul transfer server entry point.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockhaul_server::{ServerConfig, TransferHooks, TransferServer};

/// Resumable block-oriented file transfer server.
#[derive(Parser)]
#[command(name = "blockhauld", version, about)]
struct Opt {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4200")]
    listen_addr: SocketAddr,

    /// Directory for incoming files.
    #[arg(long, default_value = "incoming")]
    incoming: PathBuf,

    /// Preferred block size advertised to clients, in bytes.
    #[arg(long, default_value_t = 1_048_576)]
    blocksize: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();

    let hooks = TransferHooks {
        created: Some(Arc::new(upload_created)),
        progress: Some(Arc::new(upload_progress)),
        finished: Some(Arc::new(upload_finished)),
    };

    let server = TransferServer::new(ServerConfig {
        listen_addr: opt.listen_addr,
        incoming_dir: opt.incoming,
        preferred_block_size: opt.blocksize,
        hooks,
        ..ServerConfig::default()
    })
    .await?;

    let runner = Arc::clone(&server);
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    server.shutdown();
    run_handle.await??;

    info!("server shut down cleanly");
    Ok(())
}

fn upload_created(path: &Path, size: i64, offset: i64, metadata: &[u8]) {
    info!(
        path = %path.display(),
        size,
        offset,
        metadata = %hex::encode(metadata),
        "upload created"
    );
}

fn upload_progress(path: &Path, size: i64, offset: i64, _metadata: &[u8]) {
    let percent = if size > 0 {
        (offset * 100) as f64 / size as f64
    } else {
        100.0
    };
    info!(path = %path.display(), percent = format!("{percent:.1}%"), "progress");
}

fn upload_finished(path: &Path, size: i64, offset: i64, _metadata: &[u8]) {
    info!(path = %path.display(), size, offset, "upload finished");
}
