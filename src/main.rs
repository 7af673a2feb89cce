//! lilo CLI
//!
//! Usage:
//!   lilo download --resource-names projects/my-project --db ./logs.sqlite
//!   lilo download --resource-names '["projects/a","projects/b"]' \
//!       --filter 'severity>=ERROR' --db ./logs.sqlite --watch
//!   lilo version
//!
//! Credentials come from `LILO_ACCESS_TOKEN` when set, otherwise from
//! `gcloud auth print-access-token` (or `LILO_TOKEN_COMMAND`).

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lilo::auth::{GcloudTokenSource, StaticTokenSource, TokenCache, TokenSource};
use lilo::config::{api_base_from_env, resolve_watch, DownloadConfig, IngestTuning};
use lilo::gcp::LoggingClient;
use lilo::ingest::Downloader;
use lilo::VERSION;

#[derive(Parser, Debug)]
#[command(name = "lilo")]
#[command(about = "Download Cloud Logging entries into a SQLite file, safe to stop and resume")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download log entries into a SQLite database
    Download {
        /// Resource name (`projects/<id>`) or a JSON array of names
        #[arg(long)]
        resource_names: String,

        /// Cloud Logging filter, ANDed with the receiveTimestamp window
        #[arg(long)]
        filter: Option<String>,

        /// SQLite file, created if missing
        #[arg(long)]
        db: PathBuf,

        /// Keep polling for new entries; optional delay between passes in ms
        #[arg(long, num_args = 0..=1, value_name = "MS")]
        watch: Option<Option<u64>>,
    },

    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Download {
            resource_names,
            filter,
            db,
            watch,
        }) => {
            let tuning = IngestTuning::from_env();
            let config = DownloadConfig::new(
                &resource_names,
                filter,
                db,
                resolve_watch(watch, tuning.default_watch_interval),
            )?;

            info!(config = ?config, version = VERSION, "Started");
            download(config, tuning).await?;
            info!("Completed");
        }
        Some(Commands::Version) => println!("lilo {}", VERSION),
        None => Cli::command().print_help()?,
    }

    Ok(())
}

async fn download(config: DownloadConfig, tuning: IngestTuning) -> Result<()> {
    let client = LoggingClient::new(api_base_from_env())?;
    let tokens = Arc::new(TokenCache::new(token_source(&tuning), tuning.token_lifetime));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if config.watch.is_some() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            warn!("Ctrl-C received, finishing the current pass (press again to exit now)");
            let _ = shutdown_tx.send(true);

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    }

    let downloader = Downloader::new(config, tuning, Arc::new(client), tokens);
    let summary = downloader.run(shutdown_rx).await?;

    info!(
        run_id = summary.run_id,
        passes = summary.passes,
        inserted = summary.inserted,
        skipped = summary.skipped,
        "Download finished"
    );
    Ok(())
}

fn token_source(tuning: &IngestTuning) -> Box<dyn TokenSource> {
    match std::env::var("LILO_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => Box::new(StaticTokenSource::new(token)),
        _ => Box::new(GcloudTokenSource::from_env().with_timeout(tuning.token_command_timeout)),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lilo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
