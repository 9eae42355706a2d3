//! Durable record storage.
//!
//! The ledger talks to storage only through [`RecordStore`]. The store is
//! assumed eventually consistent with read-your-writes from the same
//! process; other processes may write concurrently, so callers dedup by
//! record id and re-read rather than assume staleness-free state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::record::Record;

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record column malformed: {0}")]
    Malformed(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All live records for a session: non-deleted, including `failed` and
    /// `waitingForExternalInput` states.
    async fn fetch_all(&self, session_id: Uuid) -> StoreResult<Vec<Record>>;

    /// Records modified strictly after `mark`, soft-deleted ones included so
    /// incremental reloads observe tombstones.
    async fn fetch_since(
        &self,
        session_id: Uuid,
        mark: DateTime<Utc>,
    ) -> StoreResult<Vec<Record>>;

    async fn upsert(&self, session_id: Uuid, record: &Record) -> StoreResult<()>;

    /// Soft-delete: flip the tombstone flag and bump the modification time.
    async fn mark_deleted(&self, session_id: Uuid, record_id: Uuid) -> StoreResult<()>;
}
