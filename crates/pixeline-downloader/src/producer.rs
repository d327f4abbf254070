//! Corpus publisher: stream a URL list, drop known URLs in batches, enqueue the rest.
//!
//! Memory is bounded by one chunk: lines are read one at a time and at most
//! `chunk_size` URLs are buffered before the batched dedup check and publish.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use pixeline_core::{CancellationToken, fmt_num};
use pixeline_store::StateStore;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::admission::filter_new;
use crate::broker::{Broker, publish_json};
use crate::messages::DownloadRequest;
use crate::stats::PublishStats;

/// Chunks between progress log lines when there is no TTY
const LOG_EVERY_CHUNKS: u64 = 100;

pub struct Producer {
    state: Arc<dyn StateStore>,
    broker: Arc<dyn Broker>,
    queue: String,
    chunk_size: usize,
    shutdown: CancellationToken,
}

impl Producer {
    pub fn new(
        state: Arc<dyn StateStore>,
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            state,
            broker,
            queue: queue.into(),
            chunk_size: chunk_size.max(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop between chunks once `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Publish every new URL in the corpus file at `path`.
    pub async fn publish_corpus(&self, path: &Path, pb: &ProgressBar) -> Result<PublishStats> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open corpus {}", path.display()))?;
        log::info!("Publishing corpus {}", path.display());
        let stats = self.publish_lines(BufReader::new(file), pb).await?;
        log::info!(
            "Corpus done: {} published, {} already known",
            fmt_num(stats.published),
            fmt_num(stats.filtered_out)
        );
        Ok(stats)
    }

    /// Publish from any line source; blank lines and `#` comments are skipped.
    pub async fn publish_lines<R>(&self, reader: R, pb: &ProgressBar) -> Result<PublishStats>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut stats = PublishStats::default();
        let mut chunk: Vec<String> = Vec::with_capacity(self.chunk_size);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await.context("Failed to read corpus")? {
            stats.lines_read += 1;
            let url = line.trim();
            if url.is_empty() || url.starts_with('#') {
                stats.skipped += 1;
                continue;
            }
            chunk.push(url.to_string());
            if chunk.len() >= self.chunk_size {
                self.flush(&mut chunk, &mut stats).await?;
                report(&stats, pb);
                if self.shutdown.is_cancelled() {
                    log::warn!(
                        "Publish interrupted after {} lines",
                        fmt_num(stats.lines_read)
                    );
                    return Ok(stats);
                }
            }
        }
        self.flush(&mut chunk, &mut stats).await?;
        pb.finish_and_clear();
        Ok(stats)
    }

    async fn flush(&self, chunk: &mut Vec<String>, stats: &mut PublishStats) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let fresh = filter_new(self.state.as_ref(), chunk)
            .await
            .context("Batch dedup check failed")?;
        stats.chunks += 1;
        stats.filtered_out += (chunk.len() - fresh.len()) as u64;
        for url in fresh {
            publish_json(self.broker.as_ref(), &self.queue, &DownloadRequest { url })
                .await
                .with_context(|| format!("Failed to publish to {}", self.queue))?;
            stats.published += 1;
        }
        chunk.clear();
        Ok(())
    }
}

fn report(stats: &PublishStats, pb: &ProgressBar) {
    if pb.is_hidden() {
        if stats.chunks % LOG_EVERY_CHUNKS == 0 {
            log::info!(
                "{} lines read, {} published, {} already known",
                fmt_num(stats.lines_read),
                fmt_num(stats.published),
                fmt_num(stats.filtered_out)
            );
        }
    } else {
        pb.set_message(format!(
            "{} lines, {} published, {} known",
            fmt_num(stats.lines_read),
            fmt_num(stats.published),
            fmt_num(stats.filtered_out)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixeline_store::{Marker, MemoryStateStore, NOT_FOUND_SENTINEL};

    use crate::memory::MemoryBroker;

    fn producer(state: &Arc<MemoryStateStore>, broker: &Arc<MemoryBroker>, chunk: usize) -> Producer {
        Producer::new(state.clone(), broker.clone(), "downloads", chunk)
    }

    fn urls(broker: &MemoryBroker) -> Vec<String> {
        broker
            .published_json::<DownloadRequest>("downloads")
            .into_iter()
            .map(|r| r.url)
            .collect()
    }

    #[tokio::test]
    async fn skips_blank_and_comment_lines() {
        let state = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let corpus = "# header\nhttp://x/a.jpg\n\n   \n  http://x/b.jpg  \n#http://x/c.jpg\n";
        let stats = producer(&state, &broker, 10)
            .publish_lines(corpus.as_bytes(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(urls(&broker), vec!["http://x/a.jpg", "http://x/b.jpg"]);
        assert_eq!(stats.lines_read, 6);
        assert_eq!(stats.skipped, 4);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.chunks, 1);
    }

    #[tokio::test]
    async fn known_urls_are_not_published() {
        let state = Arc::new(MemoryStateStore::new());
        state
            .set_marker(Marker::Downloaded, "http://x/b.jpg", "/img/b.jpg")
            .await
            .unwrap();
        state
            .set_marker(Marker::NotFound, "http://x/c.jpg", NOT_FOUND_SENTINEL)
            .await
            .unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let corpus = "http://x/a.jpg\nhttp://x/b.jpg\nhttp://x/c.jpg\n";
        let stats = producer(&state, &broker, 2)
            .publish_lines(corpus.as_bytes(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(urls(&broker), vec!["http://x/a.jpg"]);
        assert_eq!(stats.filtered_out, 2);
        assert_eq!(stats.chunks, 2);
        assert_eq!(state.batch_sizes(), vec![2, 2, 1, 1]);
    }

    #[tokio::test]
    async fn exact_multiple_has_no_empty_flush() {
        let state = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let corpus = "a\nb\nc\nd\n";
        let stats = producer(&state, &broker, 2)
            .publish_lines(corpus.as_bytes(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.published, 4);
    }

    #[tokio::test]
    async fn missing_corpus_is_an_error() {
        let state = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let err = producer(&state, &broker, 10)
            .publish_corpus(Path::new("/nonexistent/corpus.txt"), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corpus"));
    }

    #[tokio::test]
    async fn reads_corpus_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "http://x/a.jpg\nhttp://x/b.jpg").unwrap();
        let state = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let stats = producer(&state, &broker, 10)
            .publish_corpus(&path, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(stats.published, 2);
    }

    #[tokio::test]
    async fn cancelled_producer_stops_between_chunks() {
        let state = Arc::new(MemoryStateStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let token = CancellationToken::new();
        token.cancel();
        let corpus = "a\nb\nc\nd\ne\n";
        let stats = producer(&state, &broker, 2)
            .with_shutdown(token)
            .publish_lines(corpus.as_bytes(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.published, 2);
    }

    #[tokio::test]
    async fn store_outage_aborts_publish() {
        let state = Arc::new(MemoryStateStore::new());
        state.set_offline(true);
        let broker = Arc::new(MemoryBroker::new());
        let result = producer(&state, &broker, 10)
            .publish_lines("a\n".as_bytes(), &ProgressBar::hidden())
            .await;
        assert!(result.is_err());
        assert!(broker.published("downloads").is_empty());
    }
}
