//! Shared state store contract: markers, leases and batched existence checks
//!
//! Key layout (shared with every worker process):
//! ```text
//! downloaded:{url}  -> local path
//! not_found:{url}   -> "true"
//! lock:{url}        -> lease token, set only if absent, with TTL
//! ```

use std::time::Duration;

use async_trait::async_trait;

/// Sentinel value stored under `not_found:{url}`
pub const NOT_FOUND_SENTINEL: &str = "true";

/// Terminal per-URL outcomes recorded in the shared store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    /// Fetched and stored; value is the local path
    Downloaded,
    /// Returned a terminal not-found response
    NotFound,
}

impl Marker {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded:",
            Self::NotFound => "not_found:",
        }
    }

    pub fn key(self, url: &str) -> String {
        format!("{}{url}", self.prefix())
    }
}

impl std::fmt::Display for Marker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix().trim_end_matches(':'))
    }
}

pub fn lock_key(url: &str) -> String {
    format!("lock:{url}")
}

/// Error from the shared state store or the record store
#[derive(Debug)]
pub enum StoreError {
    Redis(redis::RedisError),
    Database(sqlx::Error),
    /// Backend refused or could not serve the request
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Redis(e) => write!(f, "Redis: {e}"),
            Self::Database(e) => write!(f, "Database: {e}"),
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e)
    }
}

/// Shared key/value store used by all workers for dedup authority and leases.
///
/// Implementations must be safe to share across tasks (`Arc<dyn StateStore>`).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Set `lock:{url}` to `token` only if absent, expiring after `lease`.
    /// Returns whether this caller now holds the lease.
    async fn try_lock(&self, url: &str, token: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Delete `lock:{url}` only if it still holds `token`.
    /// Returns whether a lock was removed.
    async fn unlock(&self, url: &str, token: &str) -> Result<bool, StoreError>;

    async fn has_marker(&self, marker: Marker, url: &str) -> Result<bool, StoreError>;

    async fn set_marker(&self, marker: Marker, url: &str, value: &str) -> Result<(), StoreError>;

    /// One pipelined existence check for `marker` over all `urls`.
    /// Output is positionally aligned with the input.
    async fn has_marker_batch(&self, marker: Marker, urls: &[String])
        -> Result<Vec<bool>, StoreError>;
}
