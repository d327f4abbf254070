//! Admission and dedup: decides whether this worker may fetch a URL.
//!
//! Single-URL admission takes the shared lease FIRST and only then consults
//! the local filter and the shared markers, so two workers can never both
//! pass the checks for the same URL inside one lease window. Batch filtering
//! for the producer is lock-free: it only skips URLs already known done.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use pixeline_core::MembershipFilter;
use pixeline_store::{Marker, StateStore, StoreError};

/// Why a URL was not admitted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Another worker holds the lease
    Locked,
    /// Local membership filter hit (may be a false positive)
    ProbablyDuplicate,
    /// `downloaded:{url}` exists
    Downloaded,
    /// `not_found:{url}` exists
    NotFound,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Locked => "locked by another worker",
            Self::ProbablyDuplicate => "probably seen (local filter)",
            Self::Downloaded => "already downloaded",
            Self::NotFound => "known not found",
        })
    }
}

/// Result of [`AdmissionEngine::admit`]
#[derive(Debug)]
pub enum Admission {
    /// The caller now owns the lease on the URL
    Admitted(LeaseGuard),
    Rejected(RejectReason),
}

/// Ownership of `lock:{url}` for one acquisition.
///
/// Release with [`LeaseGuard::release`]. A guard dropped unreleased (early
/// return, panic unwinding, cancelled task) schedules the release on the
/// current tokio runtime; without a runtime the lease is left to expire.
pub struct LeaseGuard {
    state: Arc<dyn StateStore>,
    url: String,
    token: String,
    released: bool,
}

impl LeaseGuard {
    fn new(state: Arc<dyn StateStore>, url: &str, token: String) -> Self {
        Self {
            state,
            url: url.to_string(),
            token,
            released: false,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Delete the lock if it still carries our token.
    ///
    /// Returns false when the lease had already expired (or been taken over)
    /// or the store could not be reached; neither is fatal.
    pub async fn release(mut self) -> bool {
        self.released = true;
        match self.state.unlock(&self.url, &self.token).await {
            Ok(true) => true,
            Ok(false) => {
                log::warn!("Lease on {} expired before release", self.url);
                false
            }
            Err(e) => {
                log::warn!("Failed to release lease on {}: {e}", self.url);
                false
            }
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("url", &self.url)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let url = std::mem::take(&mut self.url);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let state = Arc::clone(&self.state);
                handle.spawn(async move {
                    match state.unlock(&url, &token).await {
                        Ok(_) => log::debug!("Released abandoned lease on {url}"),
                        Err(e) => log::warn!("Failed to release abandoned lease on {url}: {e}"),
                    }
                });
            }
            Err(_) => log::debug!("No runtime to release lease on {url}, left to expire"),
        }
    }
}

/// Lease + filter + marker checks, shared by all consumer tasks of a worker
pub struct AdmissionEngine {
    state: Arc<dyn StateStore>,
    filter: Arc<MembershipFilter>,
    lease: Duration,
    worker_id: String,
    seq: AtomicU64,
}

impl AdmissionEngine {
    pub fn new(state: Arc<dyn StateStore>, filter: Arc<MembershipFilter>, lease: Duration) -> Self {
        Self::with_worker_id(state, filter, lease, uuid::Uuid::new_v4().to_string())
    }

    /// Engine whose lease tokens are prefixed with `worker_id`
    pub fn with_worker_id(
        state: Arc<dyn StateStore>,
        filter: Arc<MembershipFilter>,
        lease: Duration,
        worker_id: String,
    ) -> Self {
        Self {
            state,
            filter,
            lease,
            worker_id,
            seq: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    pub fn filter(&self) -> &MembershipFilter {
        &self.filter
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn next_token(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}:{n}", self.worker_id)
    }

    /// Lock, then check filter, `downloaded:` and `not_found:` in that order.
    ///
    /// A lease that cannot be taken is a rejection, never retried here. Any
    /// rejection after the lock, or a store error while checking, releases
    /// the lock before returning.
    pub async fn admit(&self, url: &str) -> Result<Admission, StoreError> {
        let token = self.next_token();
        if !self.state.try_lock(url, &token, self.lease).await? {
            log::debug!("Locked elsewhere: {url}");
            return Ok(Admission::Rejected(RejectReason::Locked));
        }
        let guard = LeaseGuard::new(Arc::clone(&self.state), url, token);

        match self.check(url).await {
            Ok(None) => Ok(Admission::Admitted(guard)),
            Ok(Some(reason)) => {
                log::debug!("Rejected {url}: {reason}");
                guard.release().await;
                Ok(Admission::Rejected(reason))
            }
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    async fn check(&self, url: &str) -> Result<Option<RejectReason>, StoreError> {
        if self.filter.contains(url) {
            return Ok(Some(RejectReason::ProbablyDuplicate));
        }
        if self.state.has_marker(Marker::Downloaded, url).await? {
            return Ok(Some(RejectReason::Downloaded));
        }
        if self.state.has_marker(Marker::NotFound, url).await? {
            return Ok(Some(RejectReason::NotFound));
        }
        Ok(None)
    }

    /// See [`filter_new`].
    pub async fn filter_new(&self, urls: &[String]) -> Result<Vec<String>, StoreError> {
        filter_new(self.state.as_ref(), urls).await
    }
}

/// Keep the URLs with neither a `downloaded:` nor a `not_found:` marker.
///
/// Two pipelined existence checks for the whole batch. Input order and
/// in-batch duplicates are preserved; locks and the local filter are not
/// consulted.
pub async fn filter_new(state: &dyn StateStore, urls: &[String]) -> Result<Vec<String>, StoreError> {
    if urls.is_empty() {
        return Ok(Vec::new());
    }
    let downloaded = state.has_marker_batch(Marker::Downloaded, urls).await?;
    let not_found = state.has_marker_batch(Marker::NotFound, urls).await?;
    if downloaded.len() != urls.len() || not_found.len() != urls.len() {
        return Err(StoreError::Unavailable(format!(
            "batch reply size mismatch: {} urls, {}/{} replies",
            urls.len(),
            downloaded.len(),
            not_found.len()
        )));
    }
    Ok(urls
        .iter()
        .zip(downloaded.iter().zip(not_found.iter()))
        .filter(|(_, (d, n))| !**d && !**n)
        .map(|(url, _)| url.clone())
        .collect())
}
