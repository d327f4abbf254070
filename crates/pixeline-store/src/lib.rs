//! pixeline-store: shared state and authoritative records
//!
//! The shared state store (Redis) holds dedup markers and per-URL leases for
//! every worker; the record store (PostgreSQL) assigns image ids
//! idempotently. In-memory backends implement the same contracts.

pub mod hash;
pub mod memory;
pub mod records;
pub mod redis_state;
pub mod state;

pub use hash::{image_filename, url_hash};
pub use memory::{MemoryRecordStore, MemoryStateStore};
pub use records::{PgRecordStore, PgSettings, RecordStore};
pub use redis_state::RedisStateStore;
pub use state::{Marker, NOT_FOUND_SENTINEL, StateStore, StoreError, lock_key};
