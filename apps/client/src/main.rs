//! Blockhaul transfer client entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use blockhaul_client::{ClientConfig, TransferClient};

/// Resumable block-oriented file transfer client.
#[derive(Parser)]
#[command(name = "blockhaul", version, about)]
struct Opt {
    /// Server address, host:port.
    #[arg(long, default_value = "127.0.0.1:4200")]
    server_addr: String,

    /// Fault injection: quit after N sent blocks without closing the
    /// stream (0 = disabled).
    #[arg(long, default_value_t = 0)]
    quit_after: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files, resuming any interrupted earlier attempt.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Download a stored file by its upload ID.
    Download {
        /// Upload ID returned by a previous upload.
        id: String,
        /// Destination path; must not exist yet.
        dst: PathBuf,
    },
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
    let client = TransferClient::new(ClientConfig {
        server_addr: opt.server_addr,
        quit_after: opt.quit_after,
    });

    match opt.command {
        Command::Upload { files } => {
            for file in files {
                let id = client.upload(&file, &[]).await?;
                info!(path = %file.display(), id = %id, "uploaded");
            }
        }
        Command::Download { id, dst } => {
            client.download(&id, &dst).await?;
            info!(id = %id, path = %dst.display(), "downloaded");
        }
    }

    Ok(())
}
