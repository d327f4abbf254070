//! Image fetching over HTTP with a bounded per-request timeout.
//!
//! Fetch results are a tagged [`FetchOutcome`] rather than an error type to
//! branch on: callers match on success, not-found or transient.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error types for fetch operations
#[derive(Debug)]
pub enum FetchError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Create HTTP error from reqwest error, without the URL
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: e.without_url().to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => *status,
        }
    }

    /// Whether a later delivery of the same URL could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            // client errors other than timeouts and throttling are permanent
            Self::Http {
                status: Some(s), ..
            } => !(400..500).contains(s) || matches!(s, 408 | 429),
            Self::Http { status: None, .. } => true,
        }
    }
}

/// Result of one fetch attempt
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<u8>),
    /// Terminal: the resource does not exist, never retry
    NotFound,
    /// Network failure or non-2xx other than not-found; eligible for a later attempt
    Transient(FetchError),
}

/// Status codes treated as terminal "not found"
pub fn is_not_found_status(status: u16) -> bool {
    matches!(status, 404 | 410)
}

/// Syntactic check before any network I/O: http(s) scheme and a non-empty host.
pub fn validate_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("unparseable URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", url.scheme()));
    }
    match url.host_str() {
        Some(h) if !h.is_empty() => Ok(url),
        _ => Err("missing host".to_string()),
    }
}

/// Source of image bytes
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchOutcome;
}

/// reqwest-backed fetcher with a pooled client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .pool_max_idle_per_host(8)
            .build()
            .map_err(FetchError::from_reqwest)?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> FetchOutcome {
        let response = match self.client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => return FetchOutcome::Transient(FetchError::from_reqwest(e)),
        };

        let status = response.status();
        if is_not_found_status(status.as_u16()) {
            return FetchOutcome::NotFound;
        }
        if !status.is_success() {
            return FetchOutcome::Transient(FetchError::Http {
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        match response.bytes().await {
            Ok(body) => FetchOutcome::Success(body.to_vec()),
            Err(e) => FetchOutcome::Transient(FetchError::from_reqwest(e)),
        }
    }
}
