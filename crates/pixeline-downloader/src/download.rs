//! Download orchestration for one admitted URL.
//!
//! ```text
//! Admitted -> Validating -> Fetching -> Persisting -> Recording -> Completed
//!                 |             |
//!                 v             v (404/410)
//!              Failed        Rejected (not_found marker)
//! ```
//!
//! Every failure is reported as `None` plus a counter, never as a panic or
//! an error the consumer loop would have to handle. The lease is released
//! on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use pixeline_core::{FetchOutcome, Fetcher, validate_url};
use pixeline_store::{Marker, NOT_FOUND_SENTINEL, RecordStore, image_filename};

use crate::admission::{Admission, AdmissionEngine, LeaseGuard};
use crate::stats::DownloadStats;

/// A URL fetched, stored and recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub id: i64,
    pub url: String,
    pub path: PathBuf,
}

pub struct Downloader {
    engine: Arc<AdmissionEngine>,
    records: Arc<dyn RecordStore>,
    fetcher: Arc<dyn Fetcher>,
    storage_dir: PathBuf,
    stats: Arc<DownloadStats>,
}

impl Downloader {
    pub fn new(
        engine: Arc<AdmissionEngine>,
        records: Arc<dyn RecordStore>,
        fetcher: Arc<dyn Fetcher>,
        storage_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            records,
            fetcher,
            storage_dir: storage_dir.into(),
            stats: Arc::new(DownloadStats::new()),
        }
    }

    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    pub fn stats(&self) -> &Arc<DownloadStats> {
        &self.stats
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Admit `url` and, if admitted, download it.
    pub async fn process(&self, url: &str) -> Option<Downloaded> {
        match self.engine.admit(url).await {
            Ok(Admission::Admitted(guard)) => self.download(guard).await,
            Ok(Admission::Rejected(reason)) => {
                self.stats.record_rejection(reason);
                None
            }
            Err(e) => {
                log::error!("Admission check failed for {url}: {e}");
                self.stats.record_error();
                None
            }
        }
    }

    /// Run the pipeline for a URL whose lease `guard` owns, then release it.
    pub async fn download(&self, guard: LeaseGuard) -> Option<Downloaded> {
        let result = self.run(guard.url()).await;
        guard.release().await;
        result
    }

    async fn run(&self, url: &str) -> Option<Downloaded> {
        let parsed = match validate_url(url) {
            Ok(u) => u,
            Err(reason) => {
                log::warn!("Invalid URL {url}: {reason}");
                self.stats.record_error();
                return None;
            }
        };

        let started = Instant::now();
        let bytes = match self.fetcher.fetch(&parsed).await {
            FetchOutcome::Success(bytes) => bytes,
            FetchOutcome::NotFound => {
                log::info!("Not found: {url}");
                if let Err(e) = self
                    .engine
                    .state()
                    .set_marker(Marker::NotFound, url, NOT_FOUND_SENTINEL)
                    .await
                {
                    log::warn!("Failed to mark {url} not found: {e}");
                }
                self.stats.record_not_found();
                return None;
            }
            FetchOutcome::Transient(e) => {
                if e.is_retryable() {
                    log::warn!("Fetch failed for {url}: {e}");
                } else {
                    log::warn!("Fetch failed for {url} (permanent): {e}");
                }
                self.stats.record_error();
                return None;
            }
        };
        let latency = started.elapsed();

        let path = self.storage_dir.join(image_filename(url, &parsed));
        if let Err(e) = write_atomic(&path, &bytes).await {
            log::error!("Failed to write {}: {e}", path.display());
            self.stats.record_error();
            return None;
        }
        let path_str = path.to_string_lossy().into_owned();

        let id = match self.records.store(url, &path_str).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                log::error!("No record id for {url}");
                self.stats.record_error();
                return None;
            }
            Err(e) => {
                log::error!("Failed to record {url}: {e}");
                self.stats.record_error();
                return None;
            }
        };

        // the record is authoritative; a missing marker only costs a re-check
        if let Err(e) = self
            .engine
            .state()
            .set_marker(Marker::Downloaded, url, &path_str)
            .await
        {
            log::warn!("Failed to mark {url} downloaded: {e}");
        }
        self.engine.filter().insert(url);
        self.stats.record_success(bytes.len(), latency);
        log::debug!(
            "Downloaded {url} -> {} ({} bytes, {:.0?})",
            path.display(),
            bytes.len(),
            latency
        );

        Some(Downloaded {
            id,
            url: url.to_string(),
            path,
        })
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pixeline_core::{FetchError, MembershipFilter};
    use pixeline_store::{MemoryRecordStore, MemoryStateStore, StateStore};
    use url::Url;

    /// Serves a fixed outcome per call
    struct StaticFetcher {
        status: Option<u16>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn ok() -> Self {
            Self {
                status: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn status(code: u16) -> Self {
            Self {
                status: Some(code),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &Url) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status {
                None => FetchOutcome::Success(url.as_str().as_bytes().to_vec()),
                Some(404) => FetchOutcome::NotFound,
                Some(code) => FetchOutcome::Transient(FetchError::Http {
                    status: Some(code),
                    message: "test".into(),
                }),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: Arc<MemoryStateStore>,
        records: Arc<MemoryRecordStore>,
        fetcher: Arc<StaticFetcher>,
        downloader: Downloader,
    }

    fn fixture(fetcher: StaticFetcher) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(MemoryStateStore::new());
        let records = Arc::new(MemoryRecordStore::new());
        let fetcher = Arc::new(fetcher);
        let dyn_state: Arc<dyn StateStore> = state.clone();
        let engine = Arc::new(AdmissionEngine::new(
            dyn_state,
            Arc::new(MembershipFilter::new(1000, 0.001)),
            Duration::from_secs(60),
        ));
        let downloader = Downloader::new(engine, records.clone(), fetcher.clone(), dir.path());
        Fixture {
            _dir: dir,
            state,
            records,
            fetcher,
            downloader,
        }
    }

    #[tokio::test]
    async fn success_writes_records_and_marks() {
        let f = fixture(StaticFetcher::ok());
        let url = "http://x/a.PNG?w=1";
        let done = f.downloader.process(url).await.unwrap();

        assert_eq!(done.id, 1);
        assert_eq!(done.url, url);
        assert!(done.path.starts_with(f.downloader.storage_dir()));
        assert!(done.path.to_string_lossy().ends_with(".png"));
        assert_eq!(std::fs::read(&done.path).unwrap(), url.as_bytes());

        let path_str = done.path.to_string_lossy().into_owned();
        assert_eq!(f.state.get(&format!("downloaded:{url}")), Some(path_str));
        assert!(f.downloader.engine().filter().contains(url));
        assert!(!f.state.is_locked(url));

        let stats = f.downloader.stats().snapshot();
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.bytes, url.len() as u64);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let f = fixture(StaticFetcher::ok());
        f.downloader.process("http://x/a.jpg").await.unwrap();
        let names: Vec<String> = std::fs::read_dir(f.downloader.storage_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".tmp"));
    }

    #[tokio::test]
    async fn second_process_is_rejected_locally() {
        let f = fixture(StaticFetcher::ok());
        assert!(f.downloader.process("http://x/a.jpg").await.is_some());
        assert!(f.downloader.process("http://x/a.jpg").await.is_none());
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.downloader.stats().snapshot().rejected_filter, 1);
    }

    #[tokio::test]
    async fn not_found_is_terminal_and_not_an_error() {
        let f = fixture(StaticFetcher::status(404));
        let url = "http://x/missing.jpg";
        assert!(f.downloader.process(url).await.is_none());
        assert_eq!(f.state.get(&format!("not_found:{url}")).as_deref(), Some("true"));
        assert!(f.state.get(&format!("downloaded:{url}")).is_none());
        assert!(f.records.is_empty());
        assert!(!f.state.is_locked(url));

        let stats = f.downloader.stats().snapshot();
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.errors, 0);

        assert!(f.downloader.process(url).await.is_none());
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.downloader.stats().snapshot().rejected_not_found, 1);
    }

    #[tokio::test]
    async fn server_error_leaves_no_marker() {
        let f = fixture(StaticFetcher::status(503));
        let url = "http://x/flaky.jpg";
        assert!(f.downloader.process(url).await.is_none());
        assert!(f.state.get(&format!("not_found:{url}")).is_none());
        assert!(f.state.get(&format!("downloaded:{url}")).is_none());
        assert!(!f.state.is_locked(url));
        assert_eq!(f.downloader.stats().snapshot().errors, 1);

        // eligible again on redelivery
        assert!(f.downloader.process(url).await.is_none());
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_url_is_counted_and_not_fetched() {
        let f = fixture(StaticFetcher::ok());
        for url in ["ftp://x/a.jpg", "not a url", "http://"] {
            assert!(f.downloader.process(url).await.is_none());
            assert!(!f.state.is_locked(url));
        }
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.downloader.stats().snapshot().errors, 3);
    }

    #[tokio::test]
    async fn missing_record_id_fails_without_marker() {
        let f = fixture(StaticFetcher::ok());
        f.records.set_offline(true);
        let url = "http://x/a.jpg";
        assert!(f.downloader.process(url).await.is_none());
        assert!(f.state.get(&format!("downloaded:{url}")).is_none());
        assert!(!f.downloader.engine().filter().contains(url));
        assert_eq!(f.downloader.stats().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn store_outage_is_an_error_not_a_panic() {
        let f = fixture(StaticFetcher::ok());
        f.state.set_offline(true);
        assert!(f.downloader.process("http://x/a.jpg").await.is_none());
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.downloader.stats().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn existing_record_id_is_reused() {
        let f = fixture(StaticFetcher::ok());
        let url = "http://x/a.jpg";
        let existing = f.records.store(url, "/elsewhere/a.jpg").await.unwrap();
        let done = f.downloader.process(url).await.unwrap();
        assert_eq!(Some(done.id), existing);
        assert_eq!(f.records.inserts(), 1);
    }

    #[tokio::test]
    async fn write_failure_is_counted() {
        let f = fixture(StaticFetcher::ok());
        let missing = f.downloader.storage_dir().join("nope");
        let dyn_state: Arc<dyn StateStore> = f.state.clone();
        let engine = Arc::new(AdmissionEngine::new(
            dyn_state,
            Arc::new(MembershipFilter::new(10, 0.01)),
            Duration::from_secs(60),
        ));
        let downloader = Downloader::new(engine, f.records.clone(), f.fetcher.clone(), missing);
        assert!(downloader.process("http://x/a.jpg").await.is_none());
        assert!(f.records.is_empty());
        assert_eq!(downloader.stats().snapshot().errors, 1);
    }
}
