//! # rag-sync CLI
//!
//! Each long-running role is its own subcommand so the gateway and both
//! consumers can be deployed and scaled as separate processes.
//!
//! ## Usage
//!
//! ```bash
//! rag-sync --config ./config/rag-sync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag-sync init` | Create metadata and queue tables |
//! | `rag-sync gateway` | Serve the notification gateway |
//! | `rag-sync content-worker` | Run the content consumer |
//! | `rag-sync access-worker` | Run the access consumer and scheduled reconciliation |
//! | `rag-sync reconcile` | Run one reconciliation sweep and exit |
//! | `rag-sync queue stats` | Show pending, leased and dead counts |
//! | `rag-sync queue retry-dead` | Move dead-lettered entries back to pending |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rag_sync::{config, gateway, migrate, queue, worker};

/// rag-sync: keeps a vector index in step with a Nextcloud file store.
#[derive(Parser)]
#[command(name = "rag-sync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Missing files are allowed; every setting then comes from defaults
    /// and environment variables.
    #[arg(long, global = true, default_value = "./config/rag-sync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metadata and queue schemas. Idempotent.
    Init,

    /// Serve the notification gateway.
    Gateway,

    /// Index file content from the content queue.
    ContentWorker,

    /// Apply permissions from the access queue, reconciling periodically.
    AccessWorker,

    /// Re-apply permissions to every known file once and exit.
    Reconcile,

    /// Inspect or repair the work queues.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Print pending, leased and dead counts for both queues.
    Stats,
    /// Move dead-lettered entries back to pending.
    RetryDead,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Stores initialized successfully.");
        }
        Commands::Gateway => {
            gateway::run_gateway(&cfg).await?;
        }
        Commands::ContentWorker => {
            worker::content::run_content_worker(&cfg).await?;
        }
        Commands::AccessWorker => {
            worker::access::run_access_worker(&cfg).await?;
        }
        Commands::Reconcile => {
            worker::access::run_reconcile(&cfg).await?;
        }
        Commands::Queue { action } => match action {
            QueueAction::Stats => queue::run_stats(&cfg).await?,
            QueueAction::RetryDead => queue::run_retry_dead(&cfg).await?,
        },
    }

    Ok(())
}
