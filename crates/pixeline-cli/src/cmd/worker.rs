//! `pixeline worker` - consume the download queue until signalled

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use pixeline_core::{CancellationToken, SharedProgress, install_signal_handler};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Publish this corpus file before consuming
    #[arg(long)]
    pub corpus: Option<PathBuf>,

    /// Publish the configured corpus file before consuming
    #[arg(long, conflicts_with = "corpus")]
    pub publish: bool,

    /// Concurrent downloads (broker prefetch)
    #[arg(short, long)]
    pub prefetch: Option<u16>,

    /// Image storage directory
    #[arg(short, long)]
    pub storage_dir: Option<PathBuf>,
}

pub async fn run(args: WorkerArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let mut runtime = config.runtime();
    if let Some(prefetch) = args.prefetch {
        runtime.prefetch = prefetch;
    }
    if let Some(dir) = args.storage_dir {
        runtime.storage_dir = dir;
    }
    let corpus = match (args.corpus, args.publish) {
        (Some(path), _) => Some(path),
        (None, true) => Some(config.corpus.path.clone()),
        (None, false) => None,
    };

    log::info!("Starting worker");
    log::info!("  Storage: {}", runtime.storage_dir.display());
    log::info!("  Prefetch: {}", runtime.prefetch);
    log::info!("  Queue: {}", runtime.endpoints.download_queue);

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());

    let summary =
        match pixeline_downloader::run_worker(&runtime, corpus.as_deref(), progress, shutdown)
            .await
        {
            Ok(summary) => summary,
            Err(e) if super::interrupted_at_startup(&e) => {
                log::info!("Stopped before start-up completed: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

    if let Some(published) = &summary.published {
        if progress.is_tty() {
            eprintln!("\n{}", published.format_table());
        } else {
            published.log();
        }
    }
    if progress.is_tty() {
        eprintln!("\n{}", summary.downloads.format_table());
        eprintln!(
            "{} messages handled in {:.1}s",
            summary.handled,
            summary.elapsed.as_secs_f64()
        );
    } else {
        summary.downloads.log();
        log::info!(
            "{} messages handled in {:.1}s",
            summary.handled,
            summary.elapsed.as_secs_f64()
        );
    }
    Ok(())
}
