//! Authoritative `(url, path) -> id` records
//!
//! The idempotent insert is the real linearization point of "this URL is
//! done": a racing second insert for the same URL gets the first id back.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::state::StoreError;

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS images (
    id BIGSERIAL PRIMARY KEY,
    url TEXT UNIQUE NOT NULL,
    file_path TEXT NOT NULL,
    downloaded_at TIMESTAMP DEFAULT NOW()
)";

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert `(url, path)` or return the id already recorded for `url`.
    ///
    /// `Ok(None)` means the store could neither insert nor find the row.
    async fn store(&self, url: &str, path: &str) -> Result<Option<i64>, StoreError>;
}

/// PostgreSQL settings for [`PgRecordStore::connect`]
#[derive(Debug, Clone)]
pub struct PgSettings {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// PostgreSQL-backed record store over a shared pool
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    /// Connect the pool and ensure the `images` table exists.
    pub async fn connect(settings: &PgSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(settings.min_connections)
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.url)
            .await?;
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        log::debug!("images table ensured");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn store(&self, url: &str, path: &str) -> Result<Option<i64>, StoreError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO images (url, file_path) VALUES ($1, $2)
             ON CONFLICT (url) DO NOTHING
             RETURNING id",
        )
        .bind(url)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            log::debug!("Inserted image record {id} for {url}");
            return Ok(Some(id));
        }

        let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM images WHERE url = $1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        match existing {
            Some(id) => log::debug!("URL already recorded as {id}: {url}"),
            None => log::error!("Failed to store or retrieve image record for {url}"),
        }
        Ok(existing)
    }
}
