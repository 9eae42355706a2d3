//! Flow-control analysis over the record DAG.
//!
//! Records reference the producer records they consumed, which makes the
//! record set a DAG. For every flow-control node (loop/branch construct) the
//! analyzer builds the tree of records downstream of that node's most recent
//! firing and answers one question per flow-control record: is its consuming
//! subtree fully consumed - has the wave of execution it started drained
//! completely, with every downstream output picked up by its consumers?
//! Only then may the construct re-fire.
//!
//! The consumption policy is deliberately pluggable behind
//! [`FlowControlAnalyzer`]; [`RecordGraph`] is the default. The attribute is
//! monotonic within one analyzer instance: once a record is marked not fully
//! consumed it stays that way until the analyzer is rebuilt from fresh
//! records.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;
use uuid::Uuid;

use crate::node::PipelineGraph;
use crate::record::{Record, RecordState};

/// One node of a flow-control tree: a record and the records that consumed
/// its output, transitively.
#[derive(Debug, Clone)]
pub struct FlowTree {
    pub record: Record,
    pub descendants: Vec<FlowTree>,
}

/// Pluggable flow-control consumption policy.
pub trait FlowControlAnalyzer {
    /// Trees rooted at each top-level flow-control record. Nested
    /// flow-control records appear inside their enclosing tree, not as
    /// separate roots.
    fn trees(&self) -> Vec<FlowTree>;

    /// Whether the record's consuming subtree is fully consumed.
    fn subtree_consumed(&self, record_id: Uuid) -> bool;

    /// Force every enclosing flow-control record of `record_id` to report
    /// "not fully consumed" for the rest of this analyzer's lifetime.
    fn mark_ancestors_unconsumed(&mut self, record_id: Uuid);
}

pub struct RecordGraph {
    /// Live records by id.
    records: HashMap<Uuid, Record>,
    /// Record-level consumer edges: producer record -> consumer records.
    consumers: HashMap<Uuid, Vec<Uuid>>,
    /// Latest record id per flow-control instance.
    flow_control_records: Vec<Uuid>,
    /// Consumption subtree (inclusive) per flow-control record.
    subtrees: HashMap<Uuid, HashSet<Uuid>>,
    /// Non-flow-control consumer instances per producer instance, from the
    /// static topology.
    plain_consumers: HashMap<String, Vec<String>>,
    /// Records forced unconsumed via `mark_ancestors_unconsumed`.
    forced_unconsumed: HashSet<Uuid>,
}

impl RecordGraph {
    pub fn build(
        records: &[Record],
        graph: &PipelineGraph,
        flow_control_instances: &HashSet<String>,
    ) -> Self {
        let live: HashMap<Uuid, Record> = records
            .iter()
            .filter(|record| !record.deleted)
            .map(|record| (record.record_id, record.clone()))
            .collect();

        let mut consumers: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for record in live.values() {
            for input in &record.inputs {
                if live.contains_key(&input.record_id) {
                    consumers
                        .entry(input.record_id)
                        .or_default()
                        .push(record.record_id);
                }
            }
        }
        for list in consumers.values_mut() {
            list.sort_unstable();
        }

        // Latest live record per flow-control instance.
        let mut latest: HashMap<&str, &Record> = HashMap::new();
        for record in live.values() {
            if !flow_control_instances.contains(&record.node_instance_id) {
                continue;
            }
            let entry = latest.entry(record.node_instance_id.as_str()).or_insert(record);
            if record.start_time > entry.start_time {
                *entry = record;
            }
        }
        let mut flow_control_records: Vec<Uuid> =
            latest.values().map(|record| record.record_id).collect();
        flow_control_records.sort_unstable();

        let subtrees = flow_control_records
            .iter()
            .map(|&root| (root, Self::consumption_subtree(root, &consumers)))
            .collect();

        let plain_consumers = graph
            .nodes
            .keys()
            .map(|instance_id| {
                let consumers: Vec<String> = graph
                    .consumers_of(instance_id)
                    .into_iter()
                    .filter(|consumer| !flow_control_instances.contains(&consumer.instance_id))
                    .map(|consumer| consumer.instance_id.clone())
                    .collect();
                (instance_id.clone(), consumers)
            })
            .collect();

        Self {
            records: live,
            consumers,
            flow_control_records,
            subtrees,
            plain_consumers,
            forced_unconsumed: HashSet::new(),
        }
    }

    fn consumption_subtree(root: Uuid, consumers: &HashMap<Uuid, Vec<Uuid>>) -> HashSet<Uuid> {
        let mut subtree = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(record_id) = queue.pop_front() {
            if !subtree.insert(record_id) {
                continue;
            }
            if let Some(next) = consumers.get(&record_id) {
                queue.extend(next.iter().copied());
            }
        }
        subtree
    }

    fn tree_from(&self, record_id: Uuid, visited: &mut HashSet<Uuid>) -> Option<FlowTree> {
        if !visited.insert(record_id) {
            return None;
        }
        let record = self.records.get(&record_id)?.clone();
        let descendants = self
            .consumers
            .get(&record_id)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|&child| self.tree_from(child, visited))
                    .collect()
            })
            .unwrap_or_default();
        Some(FlowTree {
            record,
            descendants,
        })
    }

    /// A completed record counts as consumed when every non-flow-control
    /// consumer its node declares has a live record referencing it.
    fn output_consumed(&self, record: &Record) -> bool {
        let Some(consumer_instances) = self.plain_consumers.get(&record.node_instance_id) else {
            return true;
        };
        consumer_instances.iter().all(|consumer_instance| {
            self.consumers
                .get(&record.record_id)
                .is_some_and(|consumer_records| {
                    consumer_records.iter().any(|consumer_id| {
                        self.records
                            .get(consumer_id)
                            .is_some_and(|consumer| &consumer.node_instance_id == consumer_instance)
                    })
                })
        })
    }
}

impl FlowControlAnalyzer for RecordGraph {
    fn trees(&self) -> Vec<FlowTree> {
        // Top-level roots: flow-control records not inside another
        // flow-control record's subtree.
        let roots: Vec<Uuid> = self
            .flow_control_records
            .iter()
            .copied()
            .filter(|&candidate| {
                !self.flow_control_records.iter().any(|&other| {
                    other != candidate
                        && self
                            .subtrees
                            .get(&other)
                            .is_some_and(|subtree| subtree.contains(&candidate))
                })
            })
            .collect();

        roots
            .into_iter()
            .filter_map(|root| {
                let mut visited = HashSet::new();
                self.tree_from(root, &mut visited)
            })
            .collect()
    }

    fn subtree_consumed(&self, record_id: Uuid) -> bool {
        if self.forced_unconsumed.contains(&record_id) {
            return false;
        }
        let Some(subtree) = self.subtrees.get(&record_id) else {
            return false;
        };

        for member_id in subtree {
            let Some(member) = self.records.get(member_id) else {
                continue;
            };
            if member.state != RecordState::Completed {
                debug!(
                    flow_record = %record_id,
                    pending = %member_id,
                    state = member.state.as_str(),
                    "subtree has unfinished record"
                );
                return false;
            }
            if !self.output_consumed(member) {
                debug!(
                    flow_record = %record_id,
                    unconsumed = %member_id,
                    "subtree has unconsumed output"
                );
                return false;
            }
        }
        true
    }

    fn mark_ancestors_unconsumed(&mut self, record_id: Uuid) {
        for &flow_record in &self.flow_control_records {
            if flow_record == record_id {
                continue;
            }
            if self
                .subtrees
                .get(&flow_record)
                .is_some_and(|subtree| subtree.contains(&record_id))
            {
                self.forced_unconsumed.insert(flow_record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InputEdge, NodeDescription};
    use crate::record::RecordInput;

    fn graph_with(nodes: &[(&str, &str, &[&str])]) -> PipelineGraph {
        let mut graph = PipelineGraph::new(nodes[0].0);
        for (instance_id, node_type, producers) in nodes {
            graph.add_node(NodeDescription {
                instance_id: instance_id.to_string(),
                node_type: node_type.to_string(),
                inputs: producers
                    .iter()
                    .map(|producer| InputEdge {
                        producer_instance_id: producer.to_string(),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            });
        }
        graph
    }

    fn completed(node: &str) -> Record {
        let mut record = Record::new(node, "kind", vec![]);
        record.state = RecordState::Completed;
        record
    }

    /// loop -> body -> (consumed by loop on re-fire). The body's record is a
    /// terminal leaf; once it completes the loop's subtree is drained.
    #[test]
    fn loop_subtree_consumed_when_body_completes() {
        let graph = graph_with(&[
            ("loop", "loop", &[] as &[&str]),
            ("body", "llm", &["loop"]),
        ]);
        let flow_control: HashSet<String> = ["loop".to_string()].into();

        let loop_record = completed("loop");
        let mut body_record = completed("body");
        body_record.inputs = vec![RecordInput::trigger("loop", loop_record.record_id, vec![])];

        let records = vec![loop_record.clone(), body_record.clone()];
        let analyzer = RecordGraph::build(&records, &graph, &flow_control);

        assert!(analyzer.subtree_consumed(loop_record.record_id));

        let trees = analyzer.trees();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].record.record_id, loop_record.record_id);
        assert_eq!(trees[0].descendants.len(), 1);
        assert_eq!(
            trees[0].descendants[0].record.record_id,
            body_record.record_id
        );
    }

    #[test]
    fn running_body_blocks_refire() {
        let graph = graph_with(&[
            ("loop", "loop", &[] as &[&str]),
            ("body", "llm", &["loop"]),
        ]);
        let flow_control: HashSet<String> = ["loop".to_string()].into();

        let loop_record = completed("loop");
        let mut body_record = Record::new("body", "llm", vec![RecordInput::trigger(
            "loop",
            loop_record.record_id,
            vec![],
        )]);
        body_record.state = RecordState::Started;

        let records = vec![loop_record.clone(), body_record];
        let analyzer = RecordGraph::build(&records, &graph, &flow_control);

        assert!(!analyzer.subtree_consumed(loop_record.record_id));
    }

    #[test]
    fn unconsumed_intermediate_output_blocks_refire() {
        // loop -> a -> b: a completed but b has not consumed it yet.
        let graph = graph_with(&[
            ("loop", "loop", &[] as &[&str]),
            ("a", "llm", &["loop"]),
            ("b", "llm", &["a"]),
        ]);
        let flow_control: HashSet<String> = ["loop".to_string()].into();

        let loop_record = completed("loop");
        let mut a_record = completed("a");
        a_record.inputs = vec![RecordInput::trigger("loop", loop_record.record_id, vec![])];

        let records = vec![loop_record.clone(), a_record];
        let analyzer = RecordGraph::build(&records, &graph, &flow_control);

        assert!(!analyzer.subtree_consumed(loop_record.record_id));
    }

    #[test]
    fn forced_unconsumed_is_sticky() {
        let graph = graph_with(&[
            ("outer", "loop", &[] as &[&str]),
            ("inner", "loop", &["outer"]),
            ("body", "llm", &["inner"]),
        ]);
        let flow_control: HashSet<String> = ["outer".to_string(), "inner".to_string()].into();

        let outer_record = completed("outer");
        let mut inner_record = completed("inner");
        inner_record.inputs = vec![RecordInput::trigger("outer", outer_record.record_id, vec![])];
        let mut body_record = completed("body");
        body_record.inputs = vec![RecordInput::trigger("inner", inner_record.record_id, vec![])];

        let records = vec![outer_record.clone(), inner_record.clone(), body_record];
        let mut analyzer = RecordGraph::build(&records, &graph, &flow_control);

        // Only the outer record roots a tree; the inner one nests inside it.
        let trees = analyzer.trees();
        assert_eq!(trees.len(), 1);
        assert_eq!(trees[0].record.record_id, outer_record.record_id);

        assert!(analyzer.subtree_consumed(outer_record.record_id));
        analyzer.mark_ancestors_unconsumed(inner_record.record_id);
        assert!(!analyzer.subtree_consumed(outer_record.record_id));
        // The marked record itself is unaffected.
        assert!(analyzer.subtree_consumed(inner_record.record_id));
    }
}
