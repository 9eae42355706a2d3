//! The session scheduler - plans, issues, and retires node executions.
//!
//! Every drain cycle works like a scoreboard: the ledger is synced, each
//! consuming node is checked for a complete set of unconsumed producer
//! records, ready bundles are issued as concurrent suspended tasks, and the
//! scheduler re-plans as soon as the FIRST task finishes rather than waiting
//! for the whole batch. Flow-control constructs (loops, branches) are
//! reconciled after planning by walking their consumption trees bottom-up
//! and re-firing the ones whose downstream wave has fully drained.
//!
//! Key state:
//! - `PlanState`: the ready queue and in-progress set for one drain, owned
//!   by the scheduling loop and threaded explicitly through the call chain
//! - `awaiting_external_update`: failed/waiting records parked until the
//!   ledger shows further updates
//!
//! All shared mutable state is touched only from the scheduling task; the
//! durable store may still be written concurrently by other processes, which
//! the ledger absorbs by re-reading each cycle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{StatusChannel, StatusUpdate};
use crate::graph::{FlowControlAnalyzer, FlowTree, RecordGraph};
use crate::ledger::{LedgerError, LoadOutcome, RecordLedger};
use crate::node::{InputEdge, NodeDescription, PipelineGraph};
use crate::nodes::{
    CancelToken, GatherContext, KeySource, NodeError, NodeInstance, NodeMetadata, NodeRegistry,
    RunContext, RunOutput,
};
use crate::record::{Record, RecordInput, RecordState};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("unknown node instance: {0}")]
    UnknownInstance(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard ceiling on nodes issued across one whole drain; excess readiness
    /// is deferred to a later drain.
    pub step_budget: usize,
    /// Runaway guard on repeated firings of one node within a single
    /// planning pass.
    pub plan_iteration_limit: usize,
    /// Forwarded to node hooks for verbose diagnostics.
    pub debugging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            step_budget: 128,
            plan_iteration_limit: 32,
            debugging: false,
        }
    }
}

/// A ready-to-run bundle: node instance plus resolved operands, with an
/// optional pre-existing record to reuse (stalled replay, flow-control
/// re-fire).
#[derive(Debug, Clone)]
pub struct RunBundle {
    pub instance_id: String,
    pub inputs: Vec<RecordInput>,
    pub record: Option<Record>,
}

/// Mutable plan state for one drain, owned by the scheduling loop and passed
/// explicitly through the planning/execution call chain.
#[derive(Debug, Default)]
pub struct PlanState {
    pub ready: VecDeque<RunBundle>,
    /// Record ids already sitting in the ready queue this pass.
    pub queued: HashSet<Uuid>,
    /// Records issued but not yet durably retired.
    pub records_in_progress: Vec<Record>,
}

impl PlanState {
    fn in_progress_ids(&self) -> HashSet<Uuid> {
        self.records_in_progress
            .iter()
            .map(|record| record.record_id)
            .collect()
    }

    fn remove_in_progress(&mut self, record_id: Uuid) {
        self.records_in_progress
            .retain(|record| record.record_id != record_id);
    }
}

/// Counters reported after a drain.
#[derive(Debug, Clone, Default)]
pub struct DrainSummary {
    pub issued: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    pub cancelled: bool,
    pub budget_exhausted: bool,
}

struct TaskCompletion {
    record: Record,
    result: Result<RunOutput, NodeError>,
}

type TaskFuture = BoxFuture<'static, TaskCompletion>;

pub struct Scheduler {
    graph: Arc<PipelineGraph>,
    ledger: RecordLedger,
    channel: Arc<dyn StatusChannel>,
    keys: Arc<dyn KeySource>,
    config: SchedulerConfig,
    seed: u64,
    /// One instantiated node per description, built from the registry at
    /// startup.
    instances: HashMap<String, Arc<dyn NodeInstance>>,
    flow_control_instances: HashSet<String>,
    /// Failed/waiting records not replayed until the ledger shows further
    /// updates.
    awaiting_external_update: HashSet<Uuid>,
    /// Waiting notifications already sent, so a client hears about each
    /// pending record once.
    notified_waiting: HashSet<Uuid>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<PipelineGraph>,
        registry: &NodeRegistry,
        ledger: RecordLedger,
        channel: Arc<dyn StatusChannel>,
        keys: Arc<dyn KeySource>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let mut instances = HashMap::new();
        let mut flow_control_instances = HashSet::new();
        for description in graph.nodes.values() {
            let instance = registry.instantiate(description)?;
            if instance.metadata().flow_control {
                flow_control_instances.insert(description.instance_id.clone());
            }
            instances.insert(description.instance_id.clone(), instance);
        }

        Ok(Self {
            graph,
            ledger,
            channel,
            keys,
            config,
            seed: rand::random(),
            instances,
            flow_control_instances,
            awaiting_external_update: HashSet::new(),
            notified_waiting: HashSet::new(),
        })
    }

    /// Override the session seed forwarded to node runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn ledger(&self) -> &RecordLedger {
        &self.ledger
    }

    /// Drain the session: plan, issue, and retire until nothing is ready or
    /// the step budget is exhausted. Cancellation is polled before each
    /// planning pass; in-flight tasks are drained before returning.
    pub async fn run_until_idle(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<DrainSummary, SchedulerError> {
        let mut summary = DrainSummary::default();
        let mut plan = PlanState::default();
        let mut in_flight: FuturesUnordered<TaskFuture> = FuturesUnordered::new();

        loop {
            if cancel.is_cancelled() {
                info!("cancellation observed, aborting drain");
                summary.cancelled = true;
                break;
            }

            let outcome = self.ledger.load(true).await?;
            self.release_awaiting(&outcome);

            self.compute_plan(&mut plan).await?;
            self.reconcile_flow_control(&mut plan)?;

            while summary.issued < self.config.step_budget {
                let Some(bundle) = plan.ready.pop_front() else {
                    break;
                };
                if let Some(record) = &bundle.record {
                    plan.queued.remove(&record.record_id);
                }
                match self.issue_bundle(bundle, &mut plan, cancel).await {
                    Ok(task) => {
                        in_flight.push(task);
                        summary.issued += 1;
                    }
                    Err(SchedulerError::Node(err)) => {
                        // Node-level failures are recovered locally; the
                        // drain continues with the remaining bundles.
                        warn!(error = %err, "node hook failed before issue");
                        summary.failed += 1;
                        self.channel.send_command(StatusUpdate::Error {
                            record_id: None,
                            node_instance_id: None,
                            message: err.to_string(),
                        });
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            if summary.issued >= self.config.step_budget && !plan.ready.is_empty() {
                summary.budget_exhausted = true;
                debug!(
                    deferred = plan.ready.len(),
                    "step budget exhausted, deferring readiness to a later drain"
                );
            }

            if in_flight.is_empty() {
                break;
            }

            // Resume planning on the first completion; siblings keep running.
            if let Some(completion) = in_flight.next().await {
                self.retire(completion, &mut plan, &mut summary).await?;
            }
        }

        // Drain whatever is still in flight before returning.
        while let Some(completion) = in_flight.next().await {
            self.retire(completion, &mut plan, &mut summary).await?;
        }

        if summary.cancelled {
            self.channel.send_command(StatusUpdate::Stopped);
        }

        info!(
            issued = summary.issued,
            completed = summary.completed,
            failed = summary.failed,
            waiting = summary.waiting,
            cancelled = summary.cancelled,
            "drain finished"
        );
        Ok(summary)
    }

    /// Drop await-external registrations once the ledger shows movement: the
    /// record itself was modified externally, or new records appeared that
    /// may unblock it. Within one drain our own writes never surface here,
    /// so a failed record is not retried in the cycle that produced it.
    fn release_awaiting(&mut self, outcome: &LoadOutcome) {
        if self.awaiting_external_update.is_empty() {
            return;
        }
        let fresh_activity = !outcome.new_records.is_empty();
        self.awaiting_external_update.retain(|record_id| {
            if outcome.deleted_records.contains(record_id) {
                return false;
            }
            !(fresh_activity || outcome.updated_records.contains(record_id))
        });
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Rebuild the ready queue from the current record set.
    async fn compute_plan(&mut self, plan: &mut PlanState) -> Result<(), SchedulerError> {
        plan.ready.clear();
        plan.queued.clear();

        // Startup: an empty session schedules the designated start node
        // unconditionally, with no inputs.
        if self.ledger.live_count() == 0 && plan.records_in_progress.is_empty() {
            debug!(start_node = %self.graph.start_node_id, "empty session, scheduling start node");
            plan.ready.push_back(RunBundle {
                instance_id: self.graph.start_node_id.clone(),
                inputs: Vec::new(),
                record: None,
            });
            return Ok(());
        }

        let records: Vec<Record> = self.ledger.records().cloned().collect();
        let in_progress = plan.in_progress_ids();

        self.queue_stalled_replays(&records, &in_progress, plan)
            .await?;

        // Scoreboard pass, deterministic node order.
        let mut descriptions: Vec<NodeDescription> =
            self.graph.nodes.values().cloned().collect();
        descriptions.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        for description in &descriptions {
            if description.inputs.is_empty() {
                continue;
            }
            let Some(instance) = self.instances.get(&description.instance_id) else {
                continue;
            };
            let metadata = instance.metadata();

            let mut pools: Vec<VecDeque<Record>> = description
                .inputs
                .iter()
                .map(|edge| self.unconsumed_for_edge(description, edge, &records))
                .collect();

            for iteration in 0..self.config.plan_iteration_limit {
                let Some(inputs) = assemble_inputs(description, metadata, &mut pools) else {
                    break;
                };
                debug!(
                    instance_id = %description.instance_id,
                    iteration,
                    inputs = inputs.len(),
                    "node ready"
                );
                plan.ready.push_back(RunBundle {
                    instance_id: description.instance_id.clone(),
                    inputs,
                    record: None,
                });
            }
        }

        Ok(())
    }

    /// Re-queue failed/waiting records (and materialized-but-unissued `new`
    /// ones) whose inputs still match the live node signature. Topology
    /// drift soft-deletes the record instead of replaying stale operands.
    async fn queue_stalled_replays(
        &mut self,
        records: &[Record],
        in_progress: &HashSet<Uuid>,
        plan: &mut PlanState,
    ) -> Result<(), SchedulerError> {
        let mut drifted: Vec<Uuid> = Vec::new();

        for record in records {
            let replayable = matches!(
                record.state,
                RecordState::New | RecordState::Failed | RecordState::WaitingForExternalInput
            );
            if !replayable
                || in_progress.contains(&record.record_id)
                || plan.queued.contains(&record.record_id)
                || self.awaiting_external_update.contains(&record.record_id)
            {
                continue;
            }

            if !self.signature_matches(record) {
                warn!(
                    record_id = %record.record_id,
                    instance_id = %record.node_instance_id,
                    "stalled record no longer matches node signature, soft-deleting"
                );
                drifted.push(record.record_id);
                continue;
            }

            debug!(
                record_id = %record.record_id,
                instance_id = %record.node_instance_id,
                state = record.state.as_str(),
                "replaying stalled record with original inputs"
            );
            plan.queued.insert(record.record_id);
            plan.ready.push_back(RunBundle {
                instance_id: record.node_instance_id.clone(),
                inputs: record.inputs.clone(),
                record: Some(record.clone()),
            });
        }

        for record_id in drifted {
            self.ledger.delete_record(record_id).await?;
        }
        Ok(())
    }

    /// A stalled record may replay only if its producer set is a subset of
    /// the live edges (the full set under an all-required policy) and every
    /// input still references a live record.
    fn signature_matches(&self, record: &Record) -> bool {
        let Some(description) = self.graph.get(&record.node_instance_id) else {
            return false;
        };

        // Flow-control records legitimately carry rewired inputs from their
        // descendant leaves, so their producer set is not checked against the
        // declared edges.
        if !self.flow_control_instances.contains(&record.node_instance_id) {
            let declared = description.producer_ids();
            let recorded: HashSet<&str> = record
                .inputs
                .iter()
                .map(|input| input.producer_instance_id.as_str())
                .collect();

            if recorded.iter().any(|producer| !declared.contains(producer)) {
                return false;
            }
            let all_required =
                description.require_all_event_triggers || description.require_all_inputs;
            if all_required && recorded.len() < declared.len() {
                return false;
            }
        }

        // Inputs must reference records that still exist and are not
        // tombstoned.
        record
            .inputs
            .iter()
            .all(|input| self.ledger.get(input.record_id).is_some())
    }

    /// All completed producer records strictly newer than the one this
    /// consumer last consumed through `edge`, filtered to ones that could
    /// satisfy the edge's declared triggers or variables.
    fn unconsumed_for_edge(
        &self,
        description: &NodeDescription,
        edge: &InputEdge,
        records: &[Record],
    ) -> VecDeque<Record> {
        // The consumed high point: this node's most recent record naming the
        // producer among its inputs.
        let consumed_marker = records
            .iter()
            .filter(|record| record.node_instance_id == description.instance_id)
            .filter(|record| record.consumes_from(&edge.producer_instance_id))
            .next_back()
            .map(|consumer_record| {
                consumer_record
                    .consumed_record_id(&edge.producer_instance_id)
                    .and_then(|record_id| self.ledger.get_any(record_id))
                    .map(|consumed| (consumed.start_time, consumed.record_id))
                    // The consumed record vanished entirely; fall back to the
                    // consumer's own start so nothing older is re-selected.
                    .unwrap_or((consumer_record.start_time, consumer_record.record_id))
            });

        records
            .iter()
            .filter(|record| {
                record.node_instance_id == edge.producer_instance_id
                    && record.state == RecordState::Completed
            })
            .filter(|record| match consumed_marker {
                Some(marker) => (record.start_time, record.record_id) > marker,
                None => true,
            })
            .filter(|record| edge_could_match(edge, record))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Pre-run: materialize or reuse the record, run the gather/context
    /// hooks, mark it started, and hand back the suspended run task.
    async fn issue_bundle(
        &mut self,
        bundle: RunBundle,
        plan: &mut PlanState,
        cancel: &CancelToken,
    ) -> Result<TaskFuture, SchedulerError> {
        let description = self
            .graph
            .get(&bundle.instance_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownInstance(bundle.instance_id.clone()))?;
        let instance = self
            .instances
            .get(&bundle.instance_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownInstance(bundle.instance_id.clone()))?;

        let mut record = match bundle.record {
            Some(mut existing) => {
                existing.inputs = bundle.inputs;
                existing
            }
            None => Record::new(
                description.instance_id.clone(),
                description.node_type.clone(),
                bundle.inputs,
            ),
        };

        instance
            .gather_inputs(GatherContext {
                channel: self.channel.as_ref(),
                record: &mut record,
                additional_params: Some(&description.params),
                debugging: self.config.debugging,
            })
            .await?;

        if instance.metadata().context_aware {
            let history = self.ledger.ancestor_history(&record)?;
            instance.process_execution_context(&history, &mut record)?;
        }

        instance.pre_process(&mut record).await?;

        record.mark_started();
        self.ledger.add_record_without_writing(record.clone());
        plan.records_in_progress.push(record.clone());
        self.channel.send_command(StatusUpdate::Started {
            record_id: record.record_id,
            node_instance_id: record.node_instance_id.clone(),
        });
        debug!(
            record_id = %record.record_id,
            instance_id = %record.node_instance_id,
            "issued"
        );

        let channel = Arc::clone(&self.channel);
        let keys = Arc::clone(&self.keys);
        let seed = self.seed;
        let debugging = self.config.debugging;
        let cancel = cancel.clone();
        Ok(async move {
            let result = instance
                .run(RunContext {
                    channel: channel.as_ref(),
                    seed,
                    debugging,
                    cancel: &cancel,
                    record: &record,
                    keys: keys.as_ref(),
                })
                .await;
            TaskCompletion { record, result }
        }
        .boxed())
    }

    /// Post-run: fold the run result into the record, persist, and report.
    async fn retire(
        &mut self,
        completion: TaskCompletion,
        plan: &mut PlanState,
        summary: &mut DrainSummary,
    ) -> Result<(), SchedulerError> {
        let TaskCompletion { mut record, result } = completion;
        plan.remove_in_progress(record.record_id);

        let mut waiting_for = None;
        match result {
            Ok(output) if output.state.is_terminal() => {
                record.state = output.state;
                record.output = output.output;
                record.events_emitted = output.events_emitted;
                if output.context.is_some() {
                    record.context = output.context;
                }
                record.error = output.error;
                waiting_for = output.waiting_for;
            }
            Ok(output) => {
                record.state = RecordState::Failed;
                record.error = Some(format!(
                    "node returned non-terminal state '{}'",
                    output.state.as_str()
                ));
            }
            Err(err) => {
                record.state = RecordState::Failed;
                record.error = Some(err.to_string());
            }
        }
        if record.state != RecordState::WaitingForExternalInput {
            record.completion_time = Some(chrono::Utc::now());
        }
        record.touch();

        if record.state != RecordState::Completed {
            // Not replayed until the ledger shows a later modification.
            self.awaiting_external_update.insert(record.record_id);
        }

        let instance = self.instances.get(&record.node_instance_id).cloned();
        if let Some(instance) = instance {
            if let Err(err) = instance.post_process(&mut record).await {
                warn!(
                    record_id = %record.record_id,
                    error = %err,
                    "post-process hook failed"
                );
            }
        }

        self.ledger.insert_or_update_record(record.clone()).await?;

        match record.state {
            RecordState::Completed => {
                summary.completed += 1;
                self.notified_waiting.remove(&record.record_id);
            }
            RecordState::Failed => {
                summary.failed += 1;
                error!(
                    record_id = %record.record_id,
                    instance_id = %record.node_instance_id,
                    error = record.error.as_deref().unwrap_or("unknown"),
                    "node run failed"
                );
                self.channel.send_command(StatusUpdate::Error {
                    record_id: Some(record.record_id),
                    node_instance_id: Some(record.node_instance_id.clone()),
                    message: record.error.clone().unwrap_or_else(|| "unknown".into()),
                });
            }
            RecordState::WaitingForExternalInput => {
                summary.waiting += 1;
                if self.notified_waiting.insert(record.record_id) {
                    self.channel
                        .send_command(StatusUpdate::WaitingForExternalInput {
                            record_id: record.record_id,
                            node_instance_id: record.node_instance_id.clone(),
                            waiting_for,
                        });
                }
            }
            RecordState::New | RecordState::Started => {}
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Flow-control reconciliation
    // ------------------------------------------------------------------

    /// Walk every flow-control tree bottom-up; re-fire constructs whose
    /// downstream wave has fully drained.
    fn reconcile_flow_control(&mut self, plan: &mut PlanState) -> Result<(), SchedulerError> {
        if self.flow_control_instances.is_empty() {
            return Ok(());
        }

        let records: Vec<Record> = self.ledger.records().cloned().collect();
        let mut analyzer = RecordGraph::build(&records, &self.graph, &self.flow_control_instances);

        let in_progress = plan.in_progress_ids();
        for tree in analyzer.trees() {
            self.walk_flow_tree(&tree, &mut analyzer, plan, &in_progress)?;
        }
        Ok(())
    }

    /// Post-order walk. Returns the leaf records of this branch: the most
    /// downstream records below (or at) this tree node.
    fn walk_flow_tree(
        &mut self,
        tree: &FlowTree,
        analyzer: &mut dyn FlowControlAnalyzer,
        plan: &mut PlanState,
        in_progress: &HashSet<Uuid>,
    ) -> Result<Vec<Record>, SchedulerError> {
        let mut leaves: Vec<Record> = Vec::new();
        for child in &tree.descendants {
            leaves.extend(self.walk_flow_tree(child, analyzer, plan, in_progress)?);
        }

        let is_flow_control = self
            .flow_control_instances
            .contains(&tree.record.node_instance_id);
        if is_flow_control
            && analyzer.subtree_consumed(tree.record.record_id)
            && !in_progress.contains(&tree.record.record_id)
        {
            if let Some(refire) = self.build_refire(&tree.record, &leaves)? {
                if !plan.queued.contains(&refire.record_id) {
                    debug!(
                        record_id = %refire.record_id,
                        instance_id = %refire.node_instance_id,
                        trigger_inputs = leaves.len(),
                        "flow-control re-fire queued"
                    );
                    self.ledger.add_record_without_writing(refire.clone());
                    plan.queued.insert(refire.record_id);
                    plan.ready.push_back(RunBundle {
                        instance_id: refire.node_instance_id.clone(),
                        inputs: refire.inputs.clone(),
                        record: Some(refire.clone()),
                    });
                    // An enclosing construct must not also fire this cycle.
                    analyzer.mark_ancestors_unconsumed(tree.record.record_id);
                    return Ok(vec![refire]);
                }
            }
        }

        if leaves.is_empty() {
            leaves.push(tree.record.clone());
        }
        Ok(leaves)
    }

    /// Clone the construct's most recent record, rewire descendant leaves as
    /// trigger inputs, refresh variable inputs, re-run context assembly, and
    /// ask the node whether it actually wants to go again.
    fn build_refire(
        &mut self,
        original: &Record,
        leaves: &[Record],
    ) -> Result<Option<Record>, SchedulerError> {
        let instance_id = original.node_instance_id.clone();
        let Some(description) = self.graph.get(&instance_id).cloned() else {
            return Ok(None);
        };
        let instance = self
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownInstance(instance_id.clone()))?;

        let source = self
            .ledger
            .latest_record_for_node(&instance_id)
            .cloned()
            .unwrap_or_else(|| original.clone());
        let mut refire = Record::clone_for_refire(&source);

        // Every descendant leaf becomes (or replaces) a trigger input.
        for leaf in leaves {
            let rewired = RecordInput::trigger(
                leaf.node_instance_id.clone(),
                leaf.record_id,
                leaf.events_emitted.clone(),
            );
            match refire
                .inputs
                .iter_mut()
                .find(|input| input.producer_instance_id == leaf.node_instance_id)
            {
                Some(existing) => *existing = rewired,
                None => refire.inputs.push(rewired),
            }
        }

        self.refresh_variable_inputs(&description, instance.metadata(), &mut refire);

        if instance.metadata().context_aware {
            let history = self.ledger.ancestor_history(&refire)?;
            instance.process_execution_context(&history, &mut refire)?;
        }

        if !instance.process_flow_control(&refire)? {
            debug!(
                instance_id = %instance_id,
                "flow-control node declined re-fire"
            );
            return Ok(None);
        }
        Ok(Some(refire))
    }

    /// Re-resolve variable edges against the freshest completed producer
    /// output.
    fn refresh_variable_inputs(
        &self,
        description: &NodeDescription,
        metadata: &NodeMetadata,
        record: &mut Record,
    ) {
        for edge in &description.inputs {
            if !edge.has_variables() {
                continue;
            }
            let Some(freshest) = self
                .ledger
                .records_for_node(&edge.producer_instance_id)
                .into_iter()
                .filter(|producer| producer.state == RecordState::Completed)
                .cloned()
                .next_back()
            else {
                continue;
            };

            let values = copy_variables(edge, &freshest, metadata);
            if values.is_empty() {
                continue;
            }
            match record
                .inputs
                .iter_mut()
                .find(|input| input.producer_instance_id == edge.producer_instance_id)
            {
                Some(existing) => {
                    existing.record_id = freshest.record_id;
                    existing.values = Some(values);
                }
                None => record.inputs.push(RecordInput {
                    producer_instance_id: edge.producer_instance_id.clone(),
                    record_id: freshest.record_id,
                    values: Some(values),
                    events: None,
                }),
            }
        }
    }
}

// ----------------------------------------------------------------------
// Input assembly
// ----------------------------------------------------------------------

fn satisfies_all(record: &Record, triggers: &[String]) -> bool {
    triggers
        .iter()
        .all(|trigger| record.events_emitted.contains(trigger))
}

fn satisfies_any(record: &Record, triggers: &[String]) -> bool {
    triggers
        .iter()
        .any(|trigger| record.events_emitted.contains(trigger))
}

fn matched_events(record: &Record, edge: &InputEdge) -> Vec<String> {
    match &edge.triggers {
        Some(triggers) => record
            .events_emitted
            .iter()
            .filter(|event| triggers.contains(event))
            .cloned()
            .collect(),
        None => record.events_emitted.clone(),
    }
}

/// Could this producer record ever satisfy the edge? Used to pre-filter the
/// unconsumed pool.
fn edge_could_match(edge: &InputEdge, record: &Record) -> bool {
    if !edge.has_triggers() && !edge.has_variables() {
        return true;
    }
    if let Some(triggers) = &edge.triggers {
        if satisfies_any(record, triggers) {
            return true;
        }
    }
    if let Some(variables) = &edge.variables {
        if variables.keys().any(|key| record.output.contains_key(key)) {
            return true;
        }
    }
    false
}

/// Copy the edge's named output fields into consumer variables. Composite
/// media variables accumulate multiple producer keys into one nested object
/// rather than overwriting.
fn copy_variables(
    edge: &InputEdge,
    record: &Record,
    metadata: &NodeMetadata,
) -> Map<String, Value> {
    let mut values = Map::new();
    let Some(variables) = &edge.variables else {
        return values;
    };
    for (producer_key, consumer_var) in variables {
        let Some(value) = record.output.get(producer_key) else {
            continue;
        };
        if metadata.is_composite(consumer_var) {
            let slot = values
                .entry(consumer_var.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(composite) = slot {
                composite.insert(producer_key.clone(), value.clone());
            }
        } else {
            values.insert(consumer_var.clone(), value.clone());
        }
    }
    values
}

/// Assemble one complete input set for the node from the unconsumed pools,
/// or `None` when the node stalls this iteration. On success the consumed
/// records are removed from their pools.
fn assemble_inputs(
    description: &NodeDescription,
    metadata: &NodeMetadata,
    pools: &mut [VecDeque<Record>],
) -> Option<Vec<RecordInput>> {
    let all_required = description.require_all_event_triggers || description.require_all_inputs;
    let mut selections: Vec<Option<Record>> = vec![None; description.inputs.len()];

    // Trigger resolution. Plain edges (no triggers, no variables) behave
    // like trigger edges that any completed record satisfies.
    for (idx, edge) in description.inputs.iter().enumerate() {
        if edge.has_variables() && !edge.has_triggers() {
            continue;
        }
        let position = pools[idx].iter().position(|record| match &edge.triggers {
            Some(triggers) if all_required => satisfies_all(record, triggers),
            Some(triggers) => satisfies_any(record, triggers),
            None => true,
        });
        match position {
            Some(position) => selections[idx] = Some(pools[idx][position].clone()),
            // Under the all-required policy a single unsatisfiable edge
            // stalls the whole attempt.
            None if all_required => return None,
            None => {}
        }
    }

    // Variable resolution: edges with declared variables and no trigger
    // selection take the single oldest unconsumed record for that producer.
    let mut inputs: Vec<RecordInput> = Vec::new();
    for (idx, edge) in description.inputs.iter().enumerate() {
        if let Some(selected) = &selections[idx] {
            let values = edge
                .has_variables()
                .then(|| copy_variables(edge, selected, metadata))
                .filter(|values| !values.is_empty());
            inputs.push(RecordInput {
                producer_instance_id: edge.producer_instance_id.clone(),
                record_id: selected.record_id,
                values,
                events: Some(matched_events(selected, edge)),
            });
            continue;
        }
        if !edge.has_variables() {
            continue;
        }
        match pools[idx].front().cloned() {
            Some(oldest) => {
                let values = copy_variables(edge, &oldest, metadata);
                inputs.push(RecordInput {
                    producer_instance_id: edge.producer_instance_id.clone(),
                    record_id: oldest.record_id,
                    values: Some(values),
                    events: None,
                });
                selections[idx] = Some(oldest);
            }
            None if description.require_all_variables => return None,
            None => {}
        }
    }

    if inputs.is_empty() {
        return None;
    }
    if description.require_all_inputs && inputs.len() < description.inputs.len() {
        return None;
    }

    // Commit: drop the consumed records from their pools so the next
    // iteration assembles a disjoint set.
    for (idx, selection) in selections.iter().enumerate() {
        if let Some(selected) = selection {
            pools[idx].retain(|record| record.record_id != selected.record_id);
        }
    }
    Some(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::BufferingChannel;
    use crate::ledger::LedgerConfig;
    use crate::nodes::{NodeFactory, NodeRegistry, StaticKeys};
    use crate::store::MemoryRecordStore;

    struct InertNode {
        metadata: NodeMetadata,
    }

    #[async_trait::async_trait]
    impl NodeInstance for InertNode {
        fn metadata(&self) -> &NodeMetadata {
            &self.metadata
        }

        async fn run(&self, _ctx: RunContext<'_>) -> Result<RunOutput, NodeError> {
            Ok(RunOutput::completed(Map::new(), vec!["completed".into()]))
        }
    }

    fn inert_factory(metadata: NodeMetadata) -> NodeFactory {
        Arc::new(move |_description| {
            Ok(Arc::new(InertNode {
                metadata: metadata.clone(),
            }) as Arc<dyn NodeInstance>)
        })
    }

    fn test_registry() -> NodeRegistry {
        let mut registry = NodeRegistry::with_builtins();
        registry.register("llm", inert_factory(NodeMetadata::default()));
        registry
    }

    async fn scheduler_for(graph: PipelineGraph) -> Scheduler {
        let store = Arc::new(MemoryRecordStore::new());
        let ledger = RecordLedger::new(Uuid::new_v4(), store, LedgerConfig::default());
        Scheduler::new(
            Arc::new(graph),
            &test_registry(),
            ledger,
            Arc::new(BufferingChannel::new()),
            Arc::new(StaticKeys::default()),
            SchedulerConfig::default(),
        )
        .unwrap()
        .with_seed(7)
    }

    fn trigger_edge(producer: &str, triggers: &[&str]) -> InputEdge {
        InputEdge {
            producer_instance_id: producer.into(),
            triggers: Some(triggers.iter().map(|t| t.to_string()).collect()),
            ..Default::default()
        }
    }

    fn completed_with_events(node: &str, events: &[&str]) -> Record {
        let mut record = Record::new(node, "llm", vec![]);
        record.state = RecordState::Completed;
        record.events_emitted = events.iter().map(|e| e.to_string()).collect();
        record
    }

    fn two_node_graph() -> PipelineGraph {
        let mut graph = PipelineGraph::new("start");
        graph.add_node(NodeDescription {
            instance_id: "start".into(),
            node_type: "start".into(),
            ..Default::default()
        });
        graph.add_node(NodeDescription {
            instance_id: "llm".into(),
            node_type: "llm".into(),
            inputs: vec![trigger_edge("start", &["completed"])],
            ..Default::default()
        });
        graph
    }

    #[tokio::test]
    async fn empty_session_plans_exactly_the_start_node() {
        let mut scheduler = scheduler_for(two_node_graph()).await;
        scheduler.ledger.load(false).await.unwrap();

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();

        assert_eq!(plan.ready.len(), 1);
        let bundle = &plan.ready[0];
        assert_eq!(bundle.instance_id, "start");
        assert!(bundle.inputs.is_empty());
    }

    #[tokio::test]
    async fn consumed_producer_record_is_never_reselected() {
        let mut scheduler = scheduler_for(two_node_graph()).await;
        scheduler.ledger.load(false).await.unwrap();

        let producer = completed_with_events("start", &["completed"]);
        scheduler.ledger.add_record_without_writing(producer.clone());

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.ready.len(), 1);
        assert_eq!(plan.ready[0].instance_id, "llm");
        assert_eq!(plan.ready[0].inputs[0].record_id, producer.record_id);

        // The consumer fires; its record lists the producer as consumed.
        let mut consumer = completed_with_events("llm", &["completed"]);
        consumer.inputs = vec![RecordInput::trigger(
            "start",
            producer.record_id,
            vec!["completed".into()],
        )];
        scheduler.ledger.add_record_without_writing(consumer);

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        assert!(
            plan.ready.is_empty(),
            "second planning pass must not re-select a consumed record"
        );
    }

    #[tokio::test]
    async fn all_required_never_fires_on_partial_triggers() {
        let mut graph = PipelineGraph::new("start");
        graph.add_node(NodeDescription {
            instance_id: "start".into(),
            node_type: "start".into(),
            ..Default::default()
        });
        graph.add_node(NodeDescription {
            instance_id: "llm".into(),
            node_type: "llm".into(),
            inputs: vec![trigger_edge("start", &["first", "second"])],
            require_all_event_triggers: true,
            ..Default::default()
        });

        let mut scheduler = scheduler_for(graph).await;
        scheduler.ledger.load(false).await.unwrap();
        scheduler
            .ledger
            .add_record_without_writing(completed_with_events("start", &["first"]));

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        assert!(plan.ready.is_empty());

        // A record carrying every declared trigger unlocks the node.
        scheduler
            .ledger
            .add_record_without_writing(completed_with_events("start", &["first", "second"]));
        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        assert_eq!(plan.ready.len(), 1);
        assert_eq!(plan.ready[0].instance_id, "llm");
    }

    #[tokio::test]
    async fn require_all_variables_stalls_until_producer_completes() {
        let mut graph = PipelineGraph::new("start");
        graph.add_node(NodeDescription {
            instance_id: "start".into(),
            node_type: "start".into(),
            ..Default::default()
        });
        graph.add_node(NodeDescription {
            instance_id: "llm".into(),
            node_type: "llm".into(),
            inputs: vec![InputEdge {
                producer_instance_id: "start".into(),
                variables: Some([("text".to_string(), "prompt".to_string())].into()),
                ..Default::default()
            }],
            require_all_variables: true,
            ..Default::default()
        });

        let mut scheduler = scheduler_for(graph).await;
        scheduler.ledger.load(false).await.unwrap();

        // A non-completed producer record keeps the session non-empty but
        // contributes nothing consumable.
        let pending = Record::new("start", "start", vec![]);
        scheduler.ledger.add_record_without_writing(pending);

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        assert!(plan.ready.iter().all(|b| b.instance_id != "llm"));

        let mut producer = completed_with_events("start", &["completed"]);
        producer
            .output
            .insert("text".into(), Value::String("write a haiku".into()));
        scheduler.ledger.add_record_without_writing(producer);

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        let bundle = plan
            .ready
            .iter()
            .find(|b| b.instance_id == "llm")
            .expect("llm becomes ready after producer completes");
        let values = bundle.inputs[0].values.as_ref().unwrap();
        assert_eq!(values["prompt"], Value::String("write a haiku".into()));
    }

    #[tokio::test]
    async fn composite_variables_merge_instead_of_overwriting() {
        let edge = InputEdge {
            producer_instance_id: "media".into(),
            variables: Some(
                [
                    ("imageUrl".to_string(), "media".to_string()),
                    ("caption".to_string(), "media".to_string()),
                ]
                .into(),
            ),
            ..Default::default()
        };
        let mut producer = completed_with_events("media", &["completed"]);
        producer
            .output
            .insert("imageUrl".into(), Value::String("s3://img".into()));
        producer
            .output
            .insert("caption".into(), Value::String("a marsh at dusk".into()));

        let metadata = NodeMetadata {
            composite_variables: ["media".to_string()].into(),
            ..Default::default()
        };
        let values = copy_variables(&edge, &producer, &metadata);
        let composite = values["media"].as_object().unwrap();
        assert_eq!(composite["imageUrl"], Value::String("s3://img".into()));
        assert_eq!(composite["caption"], Value::String("a marsh at dusk".into()));
    }

    #[tokio::test]
    async fn drifted_stalled_record_is_soft_deleted_not_replayed() {
        let mut scheduler = scheduler_for(two_node_graph()).await;
        scheduler.ledger.load(false).await.unwrap();

        // A failed record referencing a producer no longer in the node's
        // edge list.
        let ghost = completed_with_events("ghost", &["completed"]);
        let mut stalled = Record::new(
            "llm",
            "llm",
            vec![RecordInput::trigger(
                "ghost",
                ghost.record_id,
                vec!["completed".into()],
            )],
        );
        stalled.state = RecordState::Failed;
        scheduler.ledger.add_record_without_writing(ghost);
        scheduler.ledger.add_record_without_writing(stalled.clone());

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();

        assert!(plan.queued.is_empty());
        assert!(
            scheduler.ledger.get(stalled.record_id).is_none(),
            "drifted record must be tombstoned"
        );
    }

    #[tokio::test]
    async fn stalled_record_with_matching_signature_is_replayed() {
        let mut scheduler = scheduler_for(two_node_graph()).await;
        scheduler.ledger.load(false).await.unwrap();

        let producer = completed_with_events("start", &["completed"]);
        let mut stalled = Record::new(
            "llm",
            "llm",
            vec![RecordInput::trigger(
                "start",
                producer.record_id,
                vec!["completed".into()],
            )],
        );
        stalled.state = RecordState::Failed;
        scheduler.ledger.add_record_without_writing(producer);
        scheduler.ledger.add_record_without_writing(stalled.clone());

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();

        let bundle = plan
            .ready
            .iter()
            .find(|b| b.record.as_ref().map(|r| r.record_id) == Some(stalled.record_id))
            .expect("stalled record requeued with original inputs");
        assert_eq!(bundle.inputs, stalled.inputs);
    }

    #[tokio::test]
    async fn plan_iteration_ceiling_bounds_multi_firing() {
        let mut scheduler = scheduler_for(two_node_graph()).await;
        scheduler.config.plan_iteration_limit = 2;
        scheduler.ledger.load(false).await.unwrap();

        for _ in 0..5 {
            scheduler
                .ledger
                .add_record_without_writing(completed_with_events("start", &["completed"]));
        }

        let mut plan = PlanState::default();
        scheduler.compute_plan(&mut plan).await.unwrap();
        let llm_bundles = plan
            .ready
            .iter()
            .filter(|b| b.instance_id == "llm")
            .count();
        assert_eq!(llm_bundles, 2);
    }
}
