//! Process entry points: connect the real backends and run worker or publisher

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pixeline_core::{
    CancellationToken, ConnectionError, HttpFetcher, MembershipFilter, SharedProgress,
    retry_connect,
};
use pixeline_store::{PgRecordStore, PgSettings, RedisStateStore, StateStore};

use crate::admission::AdmissionEngine;
use crate::amqp::AmqpBroker;
use crate::broker::{Broker, Subscription};
use crate::config::Config;
use crate::consumer::Consumer;
use crate::download::Downloader;
use crate::producer::Producer;
use crate::stats::{DownloadStats, DownloadSummary, PublishStats};

/// Interval between progress log lines when there is no TTY
const LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Worker execution summary
#[derive(Debug)]
pub struct WorkerSummary {
    /// Present when a corpus was published before consuming
    pub published: Option<PublishStats>,
    pub downloads: DownloadSummary,
    /// Deliveries fully handled
    pub handled: u64,
    pub elapsed: Duration,
}

pub async fn connect_state(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Arc<RedisStateStore>, ConnectionError> {
    let url = &config.endpoints.redis_url;
    let store = retry_connect("Redis", config.retry, shutdown, || {
        RedisStateStore::connect(url)
    })
    .await?;
    Ok(Arc::new(store))
}

pub async fn connect_broker(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Arc<AmqpBroker>, ConnectionError> {
    let uri = &config.endpoints.amqp_url;
    let broker =
        retry_connect("RabbitMQ", config.retry, shutdown, || AmqpBroker::connect(uri)).await?;
    Ok(Arc::new(broker))
}

pub async fn connect_records(
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Arc<PgRecordStore>, ConnectionError> {
    let settings = PgSettings {
        url: config.endpoints.postgres_url.clone(),
        min_connections: config.endpoints.postgres_min_connections,
        max_connections: config.endpoints.postgres_max_connections,
        acquire_timeout: Duration::from_secs(30),
    };
    let records = retry_connect("PostgreSQL", config.retry, shutdown, || {
        PgRecordStore::connect(&settings)
    })
    .await?;
    Ok(Arc::new(records))
}

/// Subscribe to the download queue, retrying queue declaration failures.
pub async fn subscribe(
    broker: &dyn Broker,
    config: &Config,
    shutdown: &CancellationToken,
) -> Result<Subscription, ConnectionError> {
    let queue = &config.endpoints.download_queue;
    retry_connect(&format!("queue {queue}"), config.retry, shutdown, || {
        broker.subscribe(queue, config.prefetch)
    })
    .await
}

/// Connect everything, optionally publish `corpus`, then consume until
/// `shutdown` fires or the subscription ends.
pub async fn run_worker(
    config: &Config,
    corpus: Option<&Path>,
    progress: &SharedProgress,
    shutdown: CancellationToken,
) -> Result<WorkerSummary> {
    let start = Instant::now();

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.storage_dir.display()))?;

    let state: Arc<dyn StateStore> = connect_state(config, &shutdown).await?;
    let broker = connect_broker(config, &shutdown).await?;
    let records = connect_records(config, &shutdown).await?;
    broker
        .declare(&config.endpoints.embedding_queue)
        .await
        .context("Failed to declare embedding queue")?;

    let published = match corpus {
        Some(path) => Some(publish(config, path, &state, broker.clone(), progress, &shutdown).await?),
        None => None,
    };

    let fetcher = HttpFetcher::new(&config.user_agent, config.fetch_timeout)
        .context("Failed to build HTTP client")?;
    let filter = Arc::new(MembershipFilter::new(
        config.bloom_expected_items,
        config.bloom_error_rate,
    ));
    let engine = Arc::new(AdmissionEngine::new(
        Arc::clone(&state),
        filter,
        config.lock_lease,
    ));
    log::info!("Worker {} starting", engine.worker_id());
    let downloader = Arc::new(Downloader::new(
        engine,
        records,
        Arc::new(fetcher),
        config.storage_dir.clone(),
    ));
    let consumer = Consumer::new(
        Arc::clone(&downloader),
        broker.clone(),
        config.endpoints.embedding_queue.clone(),
        config.prefetch,
    );

    let subscription = subscribe(&*broker, config, &shutdown).await?;
    let ticker_stop = shutdown.child_token();
    let ticker = spawn_ticker(Arc::clone(downloader.stats()), progress, ticker_stop.clone());

    let handled = consumer.run(subscription, &shutdown).await;

    ticker_stop.cancel();
    let _ = ticker.await;
    if let Err(e) = broker.close().await {
        log::warn!("Broker close failed: {e}");
    }

    Ok(WorkerSummary {
        published,
        downloads: downloader.stats().snapshot(),
        handled,
        elapsed: start.elapsed(),
    })
}

/// Publish `corpus` to the download queue and exit.
pub async fn run_publish(
    config: &Config,
    corpus: &Path,
    progress: &SharedProgress,
    shutdown: CancellationToken,
) -> Result<PublishStats> {
    let state: Arc<dyn StateStore> = connect_state(config, &shutdown).await?;
    let broker = connect_broker(config, &shutdown).await?;
    let stats = publish(config, corpus, &state, broker.clone(), progress, &shutdown).await?;
    if let Err(e) = broker.close().await {
        log::warn!("Broker close failed: {e}");
    }
    Ok(stats)
}

async fn publish(
    config: &Config,
    corpus: &Path,
    state: &Arc<dyn StateStore>,
    broker: Arc<AmqpBroker>,
    progress: &SharedProgress,
    shutdown: &CancellationToken,
) -> Result<PublishStats> {
    let queue = &config.endpoints.download_queue;
    broker
        .declare(queue)
        .await
        .with_context(|| format!("Failed to declare {queue}"))?;
    let producer = Producer::new(Arc::clone(state), broker, queue.clone(), config.chunk_size)
        .with_shutdown(shutdown.clone());
    let pb = progress.stage_line("publish");
    producer.publish_corpus(corpus, &pb).await
}

/// Refresh the spinner every second (TTY) or log counters every minute.
fn spawn_ticker(
    stats: Arc<DownloadStats>,
    progress: &SharedProgress,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let pb = progress.stage_line("download");
    let period = if progress.is_tty() {
        Duration::from_secs(1)
    } else {
        LOG_INTERVAL
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let s = stats.snapshot();
                    if pb.is_hidden() {
                        s.log();
                    } else {
                        pb.set_message(format!(
                            "{} downloaded, {} not found, {} errors, {} rejected",
                            s.downloaded,
                            s.not_found,
                            s.errors,
                            s.rejected()
                        ));
                    }
                }
            }
        }
        pb.finish_and_clear();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixeline_core::{ProgressContext, RetryPolicy};

    fn refused_config(dir: &Path) -> Config {
        let mut config = Config::default();
        // port 1 refuses immediately
        config.endpoints.redis_url = "redis://127.0.0.1:1/".into();
        config.endpoints.amqp_url = "amqp://127.0.0.1:1/%2f".into();
        config.endpoints.postgres_url = "postgres://127.0.0.1:1/images".into();
        config.storage_dir = dir.join("images");
        config.retry = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        };
        config
    }

    #[tokio::test]
    async fn cancelled_worker_returns_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let config = refused_config(dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let progress = Arc::new(ProgressContext::new());

        let started = Instant::now();
        let err = run_worker(&config, None, &progress, token).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        let conn = err.downcast_ref::<ConnectionError>().unwrap();
        assert!(conn.is_cancelled());
        assert_eq!(conn.service(), "Redis");
    }

    #[tokio::test]
    async fn cancelled_publish_returns_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let config = refused_config(dir.path());
        let token = CancellationToken::new();
        token.cancel();
        let progress = Arc::new(ProgressContext::new());

        let started = Instant::now();
        let err = run_publish(&config, &dir.path().join("urls.txt"), &progress, token)
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(err.downcast_ref::<ConnectionError>().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn refused_redis_fails_within_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let config = refused_config(dir.path());

        let started = Instant::now();
        let err = connect_state(&config, &CancellationToken::new())
            .await
            .unwrap_err();

        // two 2s sleeps plus three immediate refusals
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!err.is_cancelled());
        assert_eq!(err.attempts(), 3);
    }
}
