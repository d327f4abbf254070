//! Pixeline downloader - admission, download orchestration and queue plumbing
//!
//! Each unique URL is fetched at most once across any number of worker
//! processes: a shared per-URL lease is taken before the dedup checks, and
//! the authoritative record store assigns ids idempotently.
//!
//! # Example
//!
//! ```ignore
//! use pixeline_downloader::{Config, run_worker};
//!
//! let config = Config {
//!     prefetch: 8,
//!     ..Default::default()
//! };
//! let summary = run_worker(&config, None, &progress, shutdown).await?;
//! println!("Downloaded {} images", summary.downloads.downloaded);
//! ```

pub mod admission;
pub mod amqp;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod download;
pub mod memory;
pub mod messages;
pub mod producer;
pub mod runner;
pub mod stats;

// Re-exports
pub use admission::{Admission, AdmissionEngine, LeaseGuard, RejectReason, filter_new};
pub use amqp::AmqpBroker;
pub use broker::{Broker, BrokerError, Delivery, Subscription, publish_json};
pub use config::{Config, Endpoints};
pub use consumer::Consumer;
pub use download::{Downloaded, Downloader};
pub use memory::MemoryBroker;
pub use messages::{DownloadRequest, EmbeddingEvent, parse_download_request};
pub use producer::Producer;
pub use runner::{WorkerSummary, run_publish, run_worker};
pub use stats::{DownloadStats, DownloadSummary, PublishStats};
