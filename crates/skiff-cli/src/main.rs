#![forbid(unsafe_code)]

//! **skiff** – Command-line interface for Skiff event streams.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use skiff_cli::{backup_events, safe_connection_string};
use skiff_store_blob::{open_driver, AppendBlobDriver, FsObjectStore};
use skiff_store_core::StoreConfig;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Skiff event stream maintenance")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a read-only connection string for a stream
    Safe {
        /// Source stream connection string
        stream: String,
    },
    /// Copy all events from one stream to another, preserving sequence
    /// numbers; resumable
    Backup {
        /// Source stream connection string
        source: String,
        /// Target stream connection string (written as a single append blob)
        target: String,
        /// Stop after copying this sequence
        max_seq: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Safe { stream } => {
            println!("{}", safe_connection_string(&stream)?);
        }
        Commands::Backup { source, target, max_seq } => {
            let source_config = StoreConfig::parse(&source)?;
            let source_driver = open_driver(&source_config).await?;

            let target_config = StoreConfig::parse(&target)?;
            let root = target_config
                .root()
                .ok_or_else(|| anyhow::anyhow!("target needs a ConnectionString or AccountName"))?;
            let mut path = PathBuf::from(root);
            if let Some(container) = &target_config.container {
                path.push(container);
            }
            let target_driver = AppendBlobDriver::open(FsObjectStore::open(&path).await?).await?;

            let summary = backup_events(source_driver.as_ref(), &target_driver, max_seq).await?;
            info!(copied = summary.copied, last_key = summary.last_key, "backup finished");
            println!(
                "{}",
                serde_json::json!({
                    "copied": summary.copied,
                    "lastKey": summary.last_key,
                })
            );
        }
    }
    Ok(())
}
