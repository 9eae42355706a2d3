//! The execution ledger: durable record history for one session.
//!
//! Owns the in-memory, start-time-ordered record sequence and keeps it
//! consistent with the durable store. Reloads come in two flavors: a full
//! reload that rebuilds the cache, and an incremental reload bounded by the
//! high-water mark (the latest modification timestamp already reflected in
//! the cache). Incremental fetch failures degrade to a full reload -
//! correctness over efficiency, since a silent omission would starve
//! consumers of inputs forever.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::record::{Record, RecordState};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger queried before the first load")]
    NotLoaded,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Incremental syncs allowed before the next load is forced full, so
    /// drift from concurrent writers is periodically squashed.
    pub incremental_sync_limit: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            incremental_sync_limit: 50,
        }
    }
}

/// What a `load` call observed.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub full_reload: bool,
    pub new_records: Vec<Uuid>,
    pub updated_records: Vec<Uuid>,
    pub deleted_records: Vec<Uuid>,
    pub high_water_mark: Option<DateTime<Utc>>,
}

/// Filter parameters for record export queries.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub include_deleted: bool,
    pub include_failed: bool,
    pub include_waiting: bool,
    /// Restrict to the ancestor closure (inclusive) of this record.
    pub ancestors_of: Option<Uuid>,
}

pub struct RecordLedger {
    session_id: Uuid,
    store: Arc<dyn RecordStore>,
    config: LedgerConfig,
    /// Start-time ordered; soft-deleted records stay in place as tombstones.
    records: Vec<Record>,
    index: HashMap<Uuid, usize>,
    high_water_mark: Option<DateTime<Utc>>,
    loaded: bool,
    incremental_syncs: u32,
}

impl RecordLedger {
    pub fn new(session_id: Uuid, store: Arc<dyn RecordStore>, config: LedgerConfig) -> Self {
        Self {
            session_id,
            store,
            config,
            records: Vec::new(),
            index: HashMap::new(),
            high_water_mark: None,
            loaded: false,
            incremental_syncs: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn high_water_mark(&self) -> Option<DateTime<Utc>> {
        self.high_water_mark
    }

    /// Synchronize the cache with the store.
    ///
    /// A full reload happens when none has run yet, when `incremental` is
    /// false, or when the incremental sync count exceeds the configured
    /// ceiling. Otherwise only records modified since the high-water mark are
    /// fetched and merged in start-time order. After this returns, the cache
    /// is consistent with the store as of the returned high-water mark.
    pub async fn load(&mut self, incremental: bool) -> Result<LoadOutcome, LedgerError> {
        let force_full = !incremental
            || !self.loaded
            || self.incremental_syncs >= self.config.incremental_sync_limit;

        if force_full {
            return self.full_reload().await;
        }

        let mark = match self.high_water_mark {
            Some(mark) => mark,
            None => return self.full_reload().await,
        };

        let batch = match self.store.fetch_since(self.session_id, mark).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "incremental record fetch failed, falling back to full reload"
                );
                return self.full_reload().await;
            }
        };

        let mut outcome = LoadOutcome::default();
        for record in batch {
            let known = self.index.contains_key(&record.record_id);
            if record.deleted {
                outcome.deleted_records.push(record.record_id);
            } else if known {
                outcome.updated_records.push(record.record_id);
            } else {
                outcome.new_records.push(record.record_id);
            }
            self.merge_into_cache(record);
        }

        self.incremental_syncs += 1;
        outcome.high_water_mark = self.high_water_mark;
        debug!(
            session_id = %self.session_id,
            new = outcome.new_records.len(),
            updated = outcome.updated_records.len(),
            deleted = outcome.deleted_records.len(),
            syncs = self.incremental_syncs,
            "incremental ledger sync"
        );
        Ok(outcome)
    }

    async fn full_reload(&mut self) -> Result<LoadOutcome, LedgerError> {
        let fetched = self.store.fetch_all(self.session_id).await?;

        // Classify against the cached modification times so an unchanged
        // record does not read as an update, and a previously-live record
        // absent from the full fetch reads as a deletion.
        let previous: HashMap<Uuid, DateTime<Utc>> = self
            .records
            .iter()
            .filter(|record| !record.deleted)
            .map(|record| (record.record_id, record.last_modified_time))
            .collect();
        let mut outcome = LoadOutcome {
            full_reload: true,
            ..Default::default()
        };
        let mut seen: HashSet<Uuid> = HashSet::with_capacity(fetched.len());
        for record in &fetched {
            seen.insert(record.record_id);
            match previous.get(&record.record_id) {
                None => outcome.new_records.push(record.record_id),
                Some(&cached) if record.last_modified_time != cached => {
                    outcome.updated_records.push(record.record_id);
                }
                Some(_) => {}
            }
        }
        outcome.deleted_records = previous
            .keys()
            .filter(|record_id| !seen.contains(record_id))
            .copied()
            .collect();

        self.records = fetched;
        self.records.sort_by(Self::record_order);
        self.rebuild_index();
        self.high_water_mark = self
            .records
            .iter()
            .map(|record| record.last_modified_time)
            .max();
        self.loaded = true;
        self.incremental_syncs = 0;

        outcome.high_water_mark = self.high_water_mark;
        debug!(
            session_id = %self.session_id,
            records = self.records.len(),
            high_water_mark = ?self.high_water_mark,
            "full ledger reload"
        );
        Ok(outcome)
    }

    /// Merge into the cache, then persist. The cache write comes first so a
    /// plan computed immediately afterwards already sees the update.
    pub async fn insert_or_update_record(&mut self, record: Record) -> Result<(), LedgerError> {
        self.merge_into_cache(record.clone());
        self.store.upsert(self.session_id, &record).await?;
        Ok(())
    }

    /// Cache-only merge; the durable write is deferred to normal
    /// post-processing of the record's next run.
    pub fn add_record_without_writing(&mut self, record: Record) {
        self.merge_into_cache(record);
    }

    /// Soft-delete and persist the tombstone.
    pub async fn delete_record(&mut self, record_id: Uuid) -> Result<(), LedgerError> {
        if let Some(&pos) = self.index.get(&record_id) {
            self.records[pos].mark_deleted();
            let tombstone = self.records[pos].clone();
            self.bump_high_water(tombstone.last_modified_time);
            self.store.upsert(self.session_id, &tombstone).await?;
        } else {
            self.store.mark_deleted(self.session_id, record_id).await?;
        }
        Ok(())
    }

    /// Live (non-deleted) records in start-time order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|record| !record.deleted)
    }

    pub fn live_count(&self) -> usize {
        self.records().count()
    }

    pub fn get(&self, record_id: Uuid) -> Option<&Record> {
        self.index
            .get(&record_id)
            .map(|&pos| &self.records[pos])
            .filter(|record| !record.deleted)
    }

    /// Lookup that also surfaces tombstones, for invariant checks.
    pub fn get_any(&self, record_id: Uuid) -> Option<&Record> {
        self.index.get(&record_id).map(|&pos| &self.records[pos])
    }

    /// Most recent non-deleted record of a node instance.
    pub fn latest_record_for_node(&self, instance_id: &str) -> Option<&Record> {
        self.records
            .iter()
            .rev()
            .find(|record| !record.deleted && record.node_instance_id == instance_id)
    }

    /// Live records of a node instance, start-time ordered.
    pub fn records_for_node(&self, instance_id: &str) -> Vec<&Record> {
        self.records()
            .filter(|record| record.node_instance_id == instance_id)
            .collect()
    }

    /// Transitive producer closure of a record, start-time ordered, the
    /// record itself excluded. Input references that no longer resolve are
    /// skipped; the drift policy deals with those records separately.
    pub fn ancestor_history(&self, record: &Record) -> Result<Vec<Record>, LedgerError> {
        if !self.loaded {
            return Err(LedgerError::NotLoaded);
        }

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut queue: VecDeque<Uuid> = record
            .inputs
            .iter()
            .map(|input| input.record_id)
            .collect();
        let mut history: Vec<Record> = Vec::new();

        while let Some(ancestor_id) = queue.pop_front() {
            if !seen.insert(ancestor_id) {
                continue;
            }
            let Some(ancestor) = self.get(ancestor_id) else {
                debug!(record_id = %ancestor_id, "ancestor reference no longer resolves");
                continue;
            };
            queue.extend(ancestor.inputs.iter().map(|input| input.record_id));
            history.push(ancestor.clone());
        }

        history.sort_by(Self::record_order);
        Ok(history)
    }

    /// Export query with inclusion flags and ancestor scoping.
    pub fn get_filtered_records(&self, filter: &RecordFilter) -> Result<Vec<Record>, LedgerError> {
        if !self.loaded {
            return Err(LedgerError::NotLoaded);
        }

        let scope: Option<HashSet<Uuid>> = match filter.ancestors_of {
            Some(record_id) => {
                let Some(target) = self.get_any(record_id) else {
                    return Ok(Vec::new());
                };
                let mut scope: HashSet<Uuid> = self
                    .ancestor_history(target)?
                    .iter()
                    .map(|record| record.record_id)
                    .collect();
                scope.insert(record_id);
                Some(scope)
            }
            None => None,
        };

        Ok(self
            .records
            .iter()
            .filter(|record| filter.include_deleted || !record.deleted)
            .filter(|record| filter.include_failed || record.state != RecordState::Failed)
            .filter(|record| {
                filter.include_waiting || record.state != RecordState::WaitingForExternalInput
            })
            .filter(|record| {
                scope
                    .as_ref()
                    .is_none_or(|scope| scope.contains(&record.record_id))
            })
            .cloned()
            .collect())
    }

    fn record_order(a: &Record, b: &Record) -> std::cmp::Ordering {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.record_id.cmp(&b.record_id))
    }

    fn merge_into_cache(&mut self, record: Record) {
        self.bump_high_water(record.last_modified_time);

        if let Some(&pos) = self.index.get(&record.record_id) {
            // Replace in place unless the start time moved, which changes the
            // record's position in the ordered sequence.
            if self.records[pos].start_time == record.start_time {
                self.records[pos] = record;
                return;
            }
            self.records.remove(pos);
        }

        let insert_at = self
            .records
            .partition_point(|existing| Self::record_order(existing, &record).is_le());
        self.records.insert(insert_at, record);
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(pos, record)| (record.record_id, pos))
            .collect();
    }

    fn bump_high_water(&mut self, mark: DateTime<Utc>) {
        if self.high_water_mark.is_none_or(|current| mark > current) {
            self.high_water_mark = Some(mark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordInput;
    use crate::store::MemoryRecordStore;

    fn completed(node: &str) -> Record {
        let mut record = Record::new(node, "llm", vec![]);
        record.state = RecordState::Completed;
        record
    }

    async fn seeded_store(records: &[Record]) -> (Arc<MemoryRecordStore>, Uuid) {
        let store = Arc::new(MemoryRecordStore::new());
        let session = Uuid::new_v4();
        for record in records {
            store.upsert(session, record).await.unwrap();
        }
        (store, session)
    }

    #[tokio::test]
    async fn full_and_incremental_reloads_converge() {
        let a = completed("a");
        let (store, session) = seeded_store(&[a.clone()]).await;

        // Ledger 1: incremental path.
        let mut incremental = RecordLedger::new(session, store.clone(), LedgerConfig::default());
        incremental.load(true).await.unwrap();

        let mut b = completed("b");
        b.start_time = Utc::now();
        b.last_modified_time = b.start_time;
        store.upsert(session, &b).await.unwrap();

        let outcome = incremental.load(true).await.unwrap();
        assert!(!outcome.full_reload);
        assert_eq!(outcome.new_records, vec![b.record_id]);

        // Ledger 2: one full reload over the same span.
        let mut full = RecordLedger::new(session, store.clone(), LedgerConfig::default());
        full.load(false).await.unwrap();

        let incremental_ids: Vec<Uuid> =
            incremental.records().map(|record| record.record_id).collect();
        let full_ids: Vec<Uuid> = full.records().map(|record| record.record_id).collect();
        assert_eq!(incremental_ids, full_ids);
        assert_eq!(incremental.high_water_mark(), full.high_water_mark());
    }

    #[tokio::test]
    async fn full_reload_reports_changes_against_the_cache() {
        let a = completed("a");
        let b = completed("b");
        let (store, session) = seeded_store(&[a.clone(), b.clone()]).await;

        let mut ledger = RecordLedger::new(session, store.clone(), LedgerConfig::default());
        ledger.load(false).await.unwrap();

        // b changes, c appears, a is deleted by another process.
        let mut b_updated = b.clone();
        b_updated.state = RecordState::Failed;
        b_updated.last_modified_time = Utc::now();
        store.upsert(session, &b_updated).await.unwrap();
        let mut c = completed("c");
        c.start_time = Utc::now();
        c.last_modified_time = c.start_time;
        store.upsert(session, &c).await.unwrap();
        store.mark_deleted(session, a.record_id).await.unwrap();

        let outcome = ledger.load(false).await.unwrap();
        assert!(outcome.full_reload);
        assert_eq!(outcome.new_records, vec![c.record_id]);
        assert_eq!(outcome.updated_records, vec![b_updated.record_id]);
        assert_eq!(outcome.deleted_records, vec![a.record_id]);
    }

    #[tokio::test]
    async fn incremental_failure_falls_back_to_full_reload() {
        let a = completed("a");
        let (store, session) = seeded_store(&[a.clone()]).await;

        let mut ledger = RecordLedger::new(session, store.clone(), LedgerConfig::default());
        ledger.load(true).await.unwrap();

        let b = completed("b");
        store.upsert(session, &b).await.unwrap();
        store.fail_next_incremental();

        let outcome = ledger.load(true).await.unwrap();
        assert!(outcome.full_reload);
        assert_eq!(ledger.live_count(), 2);
    }

    #[tokio::test]
    async fn sync_ceiling_forces_full_reload() {
        let (store, session) = seeded_store(&[completed("a")]).await;
        let config = LedgerConfig {
            incremental_sync_limit: 2,
        };
        let mut ledger = RecordLedger::new(session, store, config);

        assert!(ledger.load(true).await.unwrap().full_reload);
        assert!(!ledger.load(true).await.unwrap().full_reload);
        assert!(!ledger.load(true).await.unwrap().full_reload);
        // Third incremental attempt crosses the ceiling.
        assert!(ledger.load(true).await.unwrap().full_reload);
    }

    #[tokio::test]
    async fn queries_before_load_are_rejected() {
        let (store, session) = seeded_store(&[]).await;
        let ledger = RecordLedger::new(session, store, LedgerConfig::default());
        let record = completed("a");
        assert!(matches!(
            ledger.ancestor_history(&record),
            Err(LedgerError::NotLoaded)
        ));
        assert!(matches!(
            ledger.get_filtered_records(&RecordFilter::default()),
            Err(LedgerError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn ancestor_history_walks_input_references() {
        let (store, session) = seeded_store(&[]).await;
        let mut ledger = RecordLedger::new(session, store, LedgerConfig::default());
        ledger.load(false).await.unwrap();

        let root = completed("root");
        let mut mid = completed("mid");
        mid.inputs = vec![RecordInput::trigger("root", root.record_id, vec![])];
        let mut leaf = completed("leaf");
        leaf.inputs = vec![RecordInput::trigger("mid", mid.record_id, vec![])];

        ledger.add_record_without_writing(root.clone());
        ledger.add_record_without_writing(mid.clone());
        ledger.add_record_without_writing(leaf.clone());

        let history = ledger.ancestor_history(&leaf).unwrap();
        let ids: Vec<Uuid> = history.iter().map(|record| record.record_id).collect();
        assert_eq!(ids, vec![root.record_id, mid.record_id]);
    }

    #[tokio::test]
    async fn filtered_export_respects_flags_and_scope() {
        let (store, session) = seeded_store(&[]).await;
        let mut ledger = RecordLedger::new(session, store, LedgerConfig::default());
        ledger.load(false).await.unwrap();

        let ok = completed("a");
        let mut failed = completed("b");
        failed.state = RecordState::Failed;
        let mut waiting = completed("c");
        waiting.state = RecordState::WaitingForExternalInput;

        ledger.add_record_without_writing(ok.clone());
        ledger.add_record_without_writing(failed.clone());
        ledger.add_record_without_writing(waiting.clone());

        let defaults = ledger.get_filtered_records(&RecordFilter::default()).unwrap();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].record_id, ok.record_id);

        let everything = ledger
            .get_filtered_records(&RecordFilter {
                include_failed: true,
                include_waiting: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(everything.len(), 3);
    }
}
