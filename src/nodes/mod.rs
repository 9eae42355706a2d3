//! Node instance contract and the kind registry.
//!
//! Every node kind (LLM call, media generation, control flow, input gate)
//! implements [`NodeInstance`]: a small polymorphic contract the scheduler
//! drives without knowing anything about the kind's behavior. Kinds are a
//! closed set registered in an explicit factory map ([`NodeRegistry`]) built
//! at startup; dispatch is by the node type string from the graph definition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

use crate::channel::StatusChannel;
use crate::node::NodeDescription;
use crate::record::{Record, RecordState};

pub mod builtin;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("unknown node type: {0}")]
    UnknownType(String),

    #[error("invalid parameters for node {instance_id}: {message}")]
    InvalidParams { instance_id: String, message: String },

    #[error("node execution failed: {0}")]
    Execution(String),

    #[error("node run was cancelled")]
    Cancelled,
}

/// Static capabilities of a node kind.
#[derive(Debug, Clone, Default)]
pub struct NodeMetadata {
    /// Loop/branch construct re-fired through flow-control reconciliation.
    pub flow_control: bool,
    /// Receives the full ancestor history before running.
    pub context_aware: bool,
    /// Consumer variables carrying composite media payloads: multiple
    /// producer output keys merge into one nested object on these instead of
    /// overwriting.
    pub composite_variables: HashSet<String>,
}

impl NodeMetadata {
    pub fn is_composite(&self, variable: &str) -> bool {
        self.composite_variables.contains(variable)
    }
}

/// Cooperative cancellation, polled by the scheduler before each planning
/// pass and observable mid-run by node implementations (e.g. a streaming
/// callback checking for a halt signal).
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Sender half held by whoever may halt the session.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Create a linked cancel handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Credential lookup for node runs: account-scoped keys first, built-in
/// fallbacks second. Which is which is the caller's concern.
pub trait KeySource: Send + Sync {
    fn resolve(&self, provider: &str) -> Option<String>;
}

/// Fixed key map, used for built-in credentials and in tests.
#[derive(Debug, Default)]
pub struct StaticKeys {
    keys: HashMap<String, String>,
}

impl StaticKeys {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }
}

impl KeySource for StaticKeys {
    fn resolve(&self, provider: &str) -> Option<String> {
        self.keys.get(provider).cloned()
    }
}

/// Pre-run hook arguments: the node may derive parameters or perform side
/// effects before the record is issued.
pub struct GatherContext<'a> {
    pub channel: &'a dyn StatusChannel,
    pub record: &'a mut Record,
    pub additional_params: Option<&'a Value>,
    pub debugging: bool,
}

/// Arguments for the functional unit itself.
pub struct RunContext<'a> {
    pub channel: &'a dyn StatusChannel,
    pub seed: u64,
    pub debugging: bool,
    pub cancel: &'a CancelToken,
    pub record: &'a Record,
    pub keys: &'a dyn KeySource,
}

/// What a run returns. `state` must be one of the permitted terminal states.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub state: RecordState,
    pub output: Map<String, Value>,
    pub events_emitted: Vec<String>,
    pub context: Option<Value>,
    pub error: Option<String>,
    pub waiting_for: Option<String>,
}

impl RunOutput {
    pub fn completed(output: Map<String, Value>, events_emitted: Vec<String>) -> Self {
        Self {
            state: RecordState::Completed,
            output,
            events_emitted,
            context: None,
            error: None,
            waiting_for: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: RecordState::Failed,
            output: Map::new(),
            events_emitted: Vec::new(),
            context: None,
            error: Some(message.into()),
            waiting_for: None,
        }
    }

    pub fn waiting(waiting_for: impl Into<String>) -> Self {
        Self {
            state: RecordState::WaitingForExternalInput,
            output: Map::new(),
            events_emitted: Vec::new(),
            context: None,
            error: None,
            waiting_for: Some(waiting_for.into()),
        }
    }
}

/// One configured unit of work bound to a position in the graph.
///
/// Default implementations make the lifecycle hooks optional; only `run` and
/// `metadata` are mandatory.
#[async_trait]
pub trait NodeInstance: Send + Sync {
    fn metadata(&self) -> &NodeMetadata;

    /// Pre-run side effects and parameter derivation.
    async fn gather_inputs(&self, _ctx: GatherContext<'_>) -> Result<(), NodeError> {
        Ok(())
    }

    /// Context assembly for context-aware kinds: `history` is the full
    /// ancestor record chain for this firing, start-time ordered.
    fn process_execution_context(
        &self,
        _history: &[Record],
        _record: &mut Record,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    async fn pre_process(&self, _record: &mut Record) -> Result<(), NodeError> {
        Ok(())
    }

    /// Final side-effect hook after the run, before the durable write.
    async fn post_process(&self, _record: &mut Record) -> Result<(), NodeError> {
        Ok(())
    }

    /// The functional unit. Long-latency and side-effecting; awaited without
    /// blocking other issued nodes.
    async fn run(&self, ctx: RunContext<'_>) -> Result<RunOutput, NodeError>;

    /// Flow-control kinds only: decide whether a reconciled re-fire should
    /// actually be queued (a loop may have exhausted its iteration count).
    fn process_flow_control(&self, _record: &Record) -> Result<bool, NodeError> {
        Ok(false)
    }
}

/// Constructor for a node kind, invoked once per node description.
pub type NodeFactory =
    Arc<dyn Fn(&NodeDescription) -> Result<Arc<dyn NodeInstance>, NodeError> + Send + Sync>;

/// Explicit factory map from node type string to constructor, built at
/// startup.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::START_NODE_TYPE, builtin::start_factory());
        registry.register(builtin::USER_INPUT_NODE_TYPE, builtin::user_input_factory());
        registry
    }

    pub fn register(&mut self, node_type: impl Into<String>, factory: NodeFactory) {
        self.factories.insert(node_type.into(), factory);
    }

    pub fn instantiate(
        &self,
        description: &NodeDescription,
    ) -> Result<Arc<dyn NodeInstance>, NodeError> {
        let factory = self
            .factories
            .get(&description.node_type)
            .ok_or_else(|| NodeError::UnknownType(description.node_type.clone()))?;
        factory(description)
    }

    pub fn knows(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_unknown_types() {
        let registry = NodeRegistry::with_builtins();
        let description = NodeDescription {
            instance_id: "x".into(),
            node_type: "no-such-kind".into(),
            ..Default::default()
        };
        let err = registry
            .instantiate(&description)
            .err()
            .expect("unknown type must be rejected");
        match err {
            NodeError::UnknownType(kind) => assert_eq!(kind, "no-such-kind"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn cancel_token_observes_handle() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }
}
