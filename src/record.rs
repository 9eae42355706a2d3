//! Execution records - the unit of persisted pipeline state.
//!
//! A record captures one attempt (or replay) of one node instance: the
//! producer records it consumed, the named payloads it produced, and the
//! lifecycle timestamps needed for incremental reloads. Records are never
//! physically removed; superseded or orphaned records carry a soft-delete
//! flag so audit/history export keeps the full sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordState {
    /// Created by the scheduler, not yet issued.
    New,
    /// Execution in flight.
    Started,
    /// Execution finished successfully.
    Completed,
    /// Execution finished with an error.
    Failed,
    /// Execution parked until external input (e.g. user data) arrives.
    WaitingForExternalInput,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::New => "new",
            RecordState::Started => "started",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
            RecordState::WaitingForExternalInput => "waitingForExternalInput",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(RecordState::New),
            "started" => Some(RecordState::Started),
            "completed" => Some(RecordState::Completed),
            "failed" => Some(RecordState::Failed),
            "waitingForExternalInput" => Some(RecordState::WaitingForExternalInput),
            _ => None,
        }
    }

    /// States a node run is allowed to return.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Completed | RecordState::Failed | RecordState::WaitingForExternalInput
        )
    }
}

/// One resolved producer relationship actually consumed by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInput {
    /// Instance id of the producing node.
    pub producer_instance_id: String,
    /// The producer record consumed through this edge.
    pub record_id: Uuid,
    /// Named values copied from the producer output, keyed by consumer
    /// variable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Map<String, Value>>,
    /// Completion events of the producer record that satisfied this edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
}

impl RecordInput {
    pub fn trigger(producer_instance_id: impl Into<String>, record_id: Uuid, events: Vec<String>) -> Self {
        Self {
            producer_instance_id: producer_instance_id.into(),
            record_id,
            values: None,
            events: Some(events),
        }
    }
}

/// One durable execution attempt of a node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_id: Uuid,
    pub node_instance_id: String,
    pub node_type: String,
    /// Producer records consumed by this attempt. Must only reference live
    /// (existing, non-deleted) records; a violation orphans this record.
    pub inputs: Vec<RecordInput>,
    /// Named payloads produced by the run.
    pub output: Map<String, Value>,
    pub state: RecordState,
    /// Named completion events emitted by the run.
    pub events_emitted: Vec<String>,
    /// Opaque execution context (assembled history, persona, etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    pub last_modified_time: DateTime<Utc>,
    /// Soft-delete tombstone. Deleted records stay in history but are
    /// invisible to planning.
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a fresh record for a node firing.
    pub fn new(node_instance_id: impl Into<String>, node_type: impl Into<String>, inputs: Vec<RecordInput>) -> Self {
        let now = Utc::now();
        Self {
            record_id: Uuid::new_v4(),
            node_instance_id: node_instance_id.into(),
            node_type: node_type.into(),
            inputs,
            output: Map::new(),
            state: RecordState::New,
            events_emitted: Vec::new(),
            context: None,
            error: None,
            start_time: now,
            completion_time: None,
            last_modified_time: now,
            deleted: false,
        }
    }

    /// Clone a record into a fresh shell for a re-fire: new id, inputs and
    /// context carried over, output/error/timing reset, state back to `New`.
    pub fn clone_for_refire(source: &Record) -> Self {
        let now = Utc::now();
        Self {
            record_id: Uuid::new_v4(),
            node_instance_id: source.node_instance_id.clone(),
            node_type: source.node_type.clone(),
            inputs: source.inputs.clone(),
            output: Map::new(),
            state: RecordState::New,
            events_emitted: Vec::new(),
            context: source.context.clone(),
            error: None,
            start_time: now,
            completion_time: None,
            last_modified_time: now,
            deleted: false,
        }
    }

    /// Whether this record names `producer_instance_id` among its inputs.
    pub fn consumes_from(&self, producer_instance_id: &str) -> bool {
        self.inputs
            .iter()
            .any(|input| input.producer_instance_id == producer_instance_id)
    }

    /// The producer record consumed through the edge from `producer_instance_id`.
    pub fn consumed_record_id(&self, producer_instance_id: &str) -> Option<Uuid> {
        self.inputs
            .iter()
            .find(|input| input.producer_instance_id == producer_instance_id)
            .map(|input| input.record_id)
    }

    /// Bump the modification timestamp. Every mutation that will be persisted
    /// goes through this so incremental reloads observe the change.
    pub fn touch(&mut self) {
        self.last_modified_time = Utc::now();
    }

    pub fn mark_started(&mut self) {
        self.state = RecordState::Started;
        self.start_time = Utc::now();
        self.touch();
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }
}
