//! `pixeline publish` - enqueue a URL corpus and exit

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Args;

use pixeline_core::{CancellationToken, SharedProgress, install_signal_handler};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Corpus file, one URL per line (default: [corpus] path from config)
    pub corpus: Option<PathBuf>,

    /// URLs per batched dedup check
    #[arg(short, long)]
    pub chunk_size: Option<usize>,
}

pub async fn run(args: PublishArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let start = Instant::now();
    let mut runtime = config.runtime();
    if let Some(chunk) = args.chunk_size {
        runtime.chunk_size = chunk;
    }
    let corpus = args.corpus.unwrap_or_else(|| config.corpus.path.clone());

    log::info!("Publishing {}", corpus.display());
    log::info!("  Chunk size: {}", runtime.chunk_size);
    log::info!("  Queue: {}", runtime.endpoints.download_queue);

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());

    let stats = match pixeline_downloader::run_publish(&runtime, &corpus, progress, shutdown).await
    {
        Ok(stats) => stats,
        Err(e) if super::interrupted_at_startup(&e) => {
            log::info!("Stopped before start-up completed: {e}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if progress.is_tty() {
        eprintln!("\n{}", stats.format_table());
        eprintln!("Done in {:.1}s", start.elapsed().as_secs_f64());
    } else {
        stats.log();
    }
    Ok(())
}
