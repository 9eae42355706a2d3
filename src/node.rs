//! Static graph configuration.
//!
//! A [`PipelineGraph`] is the immutable definition the scheduler plans
//! against: one [`NodeDescription`] per configured node instance, each with
//! the ordered [`InputEdge`] list describing which producers feed it and
//! under what policy. The graph is owned by the session definition and
//! read-only to the scheduler.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One producer relationship on a consuming node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEdge {
    /// Instance id of the producing node.
    pub producer_instance_id: String,
    /// Named completion events the producer must have emitted for this edge
    /// to be satisfiable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Vec<String>>,
    /// Producer-output-key to consumer-variable-name mappings copied on
    /// firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
    /// Whether the consumer wants the producer's ancestor history spliced in.
    #[serde(default)]
    pub include_history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_params: Option<Value>,
}

impl InputEdge {
    pub fn has_triggers(&self) -> bool {
        self.triggers.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_variables(&self) -> bool {
        self.variables.as_ref().is_some_and(|v| !v.is_empty())
    }
}

/// Static configuration for one node instance in the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    /// Unique, stable identifier of this instance in the graph.
    pub instance_id: String,
    /// Node kind key, resolved through the registry.
    pub node_type: String,
    /// Kind-specific parameters from the graph definition.
    #[serde(default)]
    pub params: Value,
    /// Ordered producer edges.
    #[serde(default)]
    pub inputs: Vec<InputEdge>,
    /// All declared triggers per edge must be satisfied by a single
    /// unconsumed record before the node may fire.
    #[serde(default)]
    pub require_all_event_triggers: bool,
    /// Every edge must contribute before the node may fire.
    #[serde(default)]
    pub require_all_inputs: bool,
    /// Every variables edge must contribute values before the node may fire.
    #[serde(default)]
    pub require_all_variables: bool,
}

impl NodeDescription {
    /// The distinct producer set, used to detect topology drift when
    /// revalidating stalled records.
    pub fn producer_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .inputs
            .iter()
            .map(|edge| edge.producer_instance_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// The full graph definition for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineGraph {
    /// Node descriptions keyed by instance id.
    pub nodes: HashMap<String, NodeDescription>,
    /// The designated entry node, scheduled unconditionally when the session
    /// has no records.
    pub start_node_id: String,
}

impl PipelineGraph {
    pub fn new(start_node_id: impl Into<String>) -> Self {
        Self {
            nodes: HashMap::new(),
            start_node_id: start_node_id.into(),
        }
    }

    pub fn add_node(&mut self, description: NodeDescription) {
        self.nodes.insert(description.instance_id.clone(), description);
    }

    pub fn get(&self, instance_id: &str) -> Option<&NodeDescription> {
        self.nodes.get(instance_id)
    }

    /// All nodes that list `producer_instance_id` among their input edges.
    pub fn consumers_of(&self, producer_instance_id: &str) -> Vec<&NodeDescription> {
        let mut consumers: Vec<&NodeDescription> = self
            .nodes
            .values()
            .filter(|node| {
                node.inputs
                    .iter()
                    .any(|edge| edge.producer_instance_id == producer_instance_id)
            })
            .collect();
        consumers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        consumers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(producer: &str) -> InputEdge {
        InputEdge {
            producer_instance_id: producer.into(),
            ..Default::default()
        }
    }

    #[test]
    fn producer_ids_are_deduplicated_and_sorted() {
        let description = NodeDescription {
            instance_id: "c".into(),
            node_type: "llm".into(),
            inputs: vec![edge("b"), edge("a"), edge("b")],
            ..Default::default()
        };
        assert_eq!(description.producer_ids(), vec!["a", "b"]);
    }

    #[test]
    fn consumers_of_finds_downstream_nodes() {
        let mut graph = PipelineGraph::new("start");
        graph.add_node(NodeDescription {
            instance_id: "start".into(),
            node_type: "start".into(),
            ..Default::default()
        });
        graph.add_node(NodeDescription {
            instance_id: "llm".into(),
            node_type: "llm".into(),
            inputs: vec![edge("start")],
            ..Default::default()
        });

        let consumers = graph.consumers_of("start");
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].instance_id, "llm");
        assert!(graph.consumers_of("llm").is_empty());
    }
}
