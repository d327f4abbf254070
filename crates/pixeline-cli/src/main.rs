//! pixeline - distributed image acquisition pipeline
//!
//! Publishes URL corpora to the download queue and runs downloader workers
//! that fetch each unique image at most once across the fleet.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::{Config, redact};

#[derive(Parser)]
#[command(name = "pixeline")]
#[command(about = "Distributed image acquisition pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./pixeline.toml or ~/.config/pixeline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Consume the download queue until SIGINT/SIGTERM
    Worker(cmd::worker::WorkerArgs),
    /// Publish a URL corpus to the download queue
    Publish(cmd::publish::PublishArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(pixeline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug; spinners show activity
    //   non-TTY: info unless --debug; logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    pixeline_core::init_logging(quiet, cli.debug, multi).context("Failed to initialize logging")?;

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Worker(args) => {
            let rt = build_runtime()?;
            rt.block_on(cmd::worker::run(args, &config, &progress))
        }
        Command::Publish(args) => {
            let rt = build_runtime()?;
            rt.block_on(cmd::publish::run(args, &config, &progress))
        }
        Command::Config => {
            let rows = [
                ("Redis", redact(&config.redis.url)),
                ("RabbitMQ", redact(&config.rabbitmq.url)),
                ("PostgreSQL", redact(&config.postgres.url)),
                (
                    "Queues",
                    format!(
                        "{} -> {}",
                        config.rabbitmq.download_queue, config.rabbitmq.embedding_queue
                    ),
                ),
                ("Prefetch", config.rabbitmq.prefetch.to_string()),
                (
                    "Storage directory",
                    config.download.storage_dir.display().to_string(),
                ),
                ("Fetch timeout", format!("{}s", config.download.timeout_secs)),
                ("User agent", config.download.user_agent.clone()),
                ("Lock lease", format!("{}s", config.download.lock_lease_secs)),
                (
                    "Bloom filter",
                    format!(
                        "{} items @ {}",
                        config.bloom.expected_items, config.bloom.error_rate
                    ),
                ),
                ("Corpus", config.corpus.path.display().to_string()),
                ("Chunk size", config.corpus.chunk_size.to_string()),
                (
                    "Connect retry",
                    format!(
                        "{} x {}s",
                        config.retry.max_attempts, config.retry.delay_secs
                    ),
                ),
            ];
            eprintln!("\n{}", cmd::settings_table("Setting", &rows));
            Ok(())
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}
