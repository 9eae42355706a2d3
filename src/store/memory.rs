//! In-memory record store.
//!
//! Mirrors the durable store's contract without a database, for tests and
//! local single-process runs. Carries a fault-injection switch so the
//! ledger's incremental-to-full fallback can be exercised deterministically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};
use crate::record::Record;

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<Uuid, (Uuid, Record)>>,
    fail_next_incremental: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `fetch_since` call fail once.
    pub fn fail_next_incremental(&self) {
        self.fail_next_incremental.store(true, Ordering::SeqCst);
    }

    /// Number of stored rows, tombstones included.
    pub fn len(&self) -> usize {
        self.records.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted(mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        records
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn fetch_all(&self, session_id: Uuid) -> StoreResult<Vec<Record>> {
        let records = self.records.lock().expect("memory store poisoned");
        Ok(Self::sorted(
            records
                .values()
                .filter(|(session, record)| *session == session_id && !record.deleted)
                .map(|(_, record)| record.clone())
                .collect(),
        ))
    }

    async fn fetch_since(
        &self,
        session_id: Uuid,
        mark: DateTime<Utc>,
    ) -> StoreResult<Vec<Record>> {
        if self.fail_next_incremental.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected incremental fetch failure".into(),
            ));
        }

        let records = self.records.lock().expect("memory store poisoned");
        Ok(Self::sorted(
            records
                .values()
                .filter(|(session, record)| {
                    *session == session_id && record.last_modified_time > mark
                })
                .map(|(_, record)| record.clone())
                .collect(),
        ))
    }

    async fn upsert(&self, session_id: Uuid, record: &Record) -> StoreResult<()> {
        let mut records = self.records.lock().expect("memory store poisoned");
        records.insert(record.record_id, (session_id, record.clone()));
        Ok(())
    }

    async fn mark_deleted(&self, session_id: Uuid, record_id: Uuid) -> StoreResult<()> {
        let mut records = self.records.lock().expect("memory store poisoned");
        if let Some((session, record)) = records.get_mut(&record_id) {
            if *session == session_id {
                record.deleted = true;
                record.last_modified_time = Utc::now();
            }
        }
        Ok(())
    }
}
