//! Millrace - persistent, resumable dataflow pipeline scheduler for a single
//! interactive session.

pub mod channel;
pub mod config;
pub mod graph;
pub mod ledger;
pub mod node;
pub mod nodes;
pub mod record;
pub mod scheduler;
pub mod store;

pub use channel::{BufferingChannel, NullChannel, StatusChannel, StatusUpdate};
pub use config::Config;
pub use graph::{FlowControlAnalyzer, FlowTree, RecordGraph};
pub use ledger::{LedgerConfig, LedgerError, LoadOutcome, RecordFilter, RecordLedger};
pub use node::{InputEdge, NodeDescription, PipelineGraph};
pub use nodes::{
    CancelHandle, CancelToken, GatherContext, KeySource, NodeError, NodeInstance, NodeMetadata,
    NodeRegistry, RunContext, RunOutput, StaticKeys, cancel_pair,
};
pub use record::{Record, RecordInput, RecordState};
pub use scheduler::{
    DrainSummary, PlanState, RunBundle, Scheduler, SchedulerConfig, SchedulerError,
};
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError};
