//! Pixeline Core - shared infrastructure for the image acquisition pipeline
//!
//! Connection retry, the process-local membership filter, HTTP fetching,
//! logging, progress and shutdown plumbing used by the downloader and CLI.

pub mod bloom;
pub mod error;
pub mod http;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod shutdown;

// Re-exports for convenience
pub use bloom::{BloomFilter, MembershipFilter};
pub use error::{ConnectionError, RetryPolicy};
pub use http::{FetchError, FetchOutcome, Fetcher, HttpFetcher, validate_url};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use retry::retry_connect;
pub use shutdown::install_signal_handler;
pub use tokio_util::sync::CancellationToken;
