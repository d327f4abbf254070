//! In-process implementations of the store contracts.
//!
//! Same semantics as the Redis/PostgreSQL backends (only-if-absent leases
//! with expiry on the tokio clock, idempotent inserts), plus call counters so
//! callers can assert how many round trips a code path made.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::records::RecordStore;
use crate::state::{Marker, StateStore, StoreError, lock_key};

#[derive(Debug, Default)]
struct StateInner {
    values: FxHashMap<String, String>,
    leases: FxHashMap<String, (String, Instant)>,
}

/// Shared-state store held in process memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<StateInner>,
    round_trips: AtomicU64,
    batch_sizes: Mutex<Vec<usize>>,
    offline: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn begin(&self) -> Result<std::sync::MutexGuard<'_, StateInner>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of requests served so far (a pipelined batch counts once)
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Sizes of every batch passed to `has_marker_batch`, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Raw value under a full key (`downloaded:...`, `lock:...`)
    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((token, expires)) = inner.leases.get(key) {
            return (*expires > Instant::now()).then(|| token.clone());
        }
        inner.values.get(key).cloned()
    }

    /// Whether a live lease exists for `url`
    pub fn is_locked(&self, url: &str) -> bool {
        self.get(&lock_key(url)).is_some()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn try_lock(&self, url: &str, token: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut inner = self.begin()?;
        let key = lock_key(url);
        let now = Instant::now();
        if let Some((_, expires)) = inner.leases.get(&key) {
            if *expires > now {
                return Ok(false);
            }
        }
        inner.leases.insert(key, (token.to_string(), now + lease));
        Ok(true)
    }

    async fn unlock(&self, url: &str, token: &str) -> Result<bool, StoreError> {
        let mut inner = self.begin()?;
        let key = lock_key(url);
        let now = Instant::now();
        match inner.leases.get(&key) {
            Some((held, expires)) if held == token && *expires > now => {
                inner.leases.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn has_marker(&self, marker: Marker, url: &str) -> Result<bool, StoreError> {
        let inner = self.begin()?;
        Ok(inner.values.contains_key(&marker.key(url)))
    }

    async fn set_marker(&self, marker: Marker, url: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.begin()?;
        inner.values.insert(marker.key(url), value.to_string());
        Ok(())
    }

    async fn has_marker_batch(
        &self,
        marker: Marker,
        urls: &[String],
    ) -> Result<Vec<bool>, StoreError> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        self.batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(urls.len());
        let inner = self.begin()?;
        Ok(urls
            .iter()
            .map(|u| inner.values.contains_key(&marker.key(u)))
            .collect())
    }
}

#[derive(Debug, Default)]
struct RecordsInner {
    by_url: FxHashMap<String, (i64, String)>,
    next_id: i64,
}

/// Record store held in process memory; ids start at 1
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<RecordsInner>,
    inserts: AtomicU64,
    calls: AtomicU64,
    offline: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls that created a new row
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }

    /// All `store` calls, including ones that returned an existing id
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Simulate a store that can neither insert nor look up (`Ok(None)`)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn get(&self, url: &str) -> Option<(i64, String)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_url
            .get(url)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_url
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn store(&self, url: &str, path: &str) -> Result<Option<i64>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((id, _)) = inner.by_url.get(url) {
            return Ok(Some(*id));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_url.insert(url.to_string(), (id, path.to_string()));
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn lock_is_exclusive() {
        let store = MemoryStateStore::new();
        assert!(store.try_lock("u", "a", LEASE).await.unwrap());
        assert!(!store.try_lock("u", "b", LEASE).await.unwrap());
        assert!(store.try_lock("other", "b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_requires_matching_token() {
        let store = MemoryStateStore::new();
        store.try_lock("u", "a", LEASE).await.unwrap();
        assert!(!store.unlock("u", "b").await.unwrap());
        assert!(store.is_locked("u"));
        assert!(store.unlock("u", "a").await.unwrap());
        assert!(!store.is_locked("u"));
        assert!(store.try_lock("u", "b", LEASE).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires() {
        let store = MemoryStateStore::new();
        assert!(store.try_lock("u", "a", LEASE).await.unwrap());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!store.try_lock("u", "b", LEASE).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.try_lock("u", "b", LEASE).await.unwrap());
        // the expired holder cannot remove the new lease
        assert!(!store.unlock("u", "a").await.unwrap());
        assert!(store.is_locked("u"));
    }

    #[tokio::test]
    async fn markers_and_batch() {
        let store = MemoryStateStore::new();
        store
            .set_marker(Marker::Downloaded, "b", "/img/b.jpg")
            .await
            .unwrap();
        store
            .set_marker(Marker::NotFound, "c", crate::state::NOT_FOUND_SENTINEL)
            .await
            .unwrap();

        assert!(store.has_marker(Marker::Downloaded, "b").await.unwrap());
        assert!(!store.has_marker(Marker::NotFound, "b").await.unwrap());
        assert_eq!(store.get("downloaded:b").as_deref(), Some("/img/b.jpg"));

        let urls: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let before = store.round_trips();
        let found = store
            .has_marker_batch(Marker::Downloaded, &urls)
            .await
            .unwrap();
        assert_eq!(found, vec![false, true, false]);
        assert_eq!(store.round_trips(), before + 1);
        assert_eq!(store.batch_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn empty_batch_skips_round_trip() {
        let store = MemoryStateStore::new();
        let found = store.has_marker_batch(Marker::NotFound, &[]).await.unwrap();
        assert!(found.is_empty());
        assert_eq!(store.round_trips(), 0);
    }

    #[tokio::test]
    async fn offline_store_errors() {
        let store = MemoryStateStore::new();
        store.set_offline(true);
        let err = store.has_marker(Marker::Downloaded, "a").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn record_store_is_idempotent() {
        let records = MemoryRecordStore::new();
        let first = records.store("http://x/a.jpg", "/img/a.jpg").await.unwrap();
        let second = records.store("http://x/a.jpg", "/img/other.jpg").await.unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(first, second);
        assert_eq!(records.inserts(), 1);
        assert_eq!(records.calls(), 2);
        assert_eq!(records.get("http://x/a.jpg").unwrap().1, "/img/a.jpg");

        let other = records.store("http://x/b.jpg", "/img/b.jpg").await.unwrap();
        assert_eq!(other, Some(2));
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn offline_record_store_returns_none() {
        let records = MemoryRecordStore::new();
        records.set_offline(true);
        assert_eq!(records.store("u", "p").await.unwrap(), None);
        assert!(records.is_empty());
    }
}
