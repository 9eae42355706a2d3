//! Built-in node kinds.
//!
//! Only the two kinds a session cannot run without live here: the `start`
//! entry node and the `user-input` gate. Everything substantive (LLM calls,
//! media generation, loops) arrives through external registrations.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use super::{NodeError, NodeFactory, NodeInstance, NodeMetadata, RunContext, RunOutput};

pub const START_NODE_TYPE: &str = "start";
pub const USER_INPUT_NODE_TYPE: &str = "user-input";

/// Event emitted by every successful built-in run.
pub const COMPLETED_EVENT: &str = "completed";

/// Session entry point. Fires unconditionally with no inputs and emits its
/// params as output so downstream nodes can pick up session seed values.
struct StartNode {
    metadata: NodeMetadata,
    params: Map<String, Value>,
}

#[async_trait::async_trait]
impl NodeInstance for StartNode {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    async fn run(&self, ctx: RunContext<'_>) -> Result<RunOutput, NodeError> {
        debug!(record_id = %ctx.record.record_id, "start node firing");
        Ok(RunOutput::completed(
            self.params.clone(),
            vec![COMPLETED_EVENT.to_string()],
        ))
    }
}

pub fn start_factory() -> NodeFactory {
    Arc::new(|description| {
        let params = match &description.params {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(NodeError::InvalidParams {
                    instance_id: description.instance_id.clone(),
                    message: format!("expected object params, got {other}"),
                });
            }
        };
        Ok(Arc::new(StartNode {
            metadata: NodeMetadata::default(),
            params,
        }) as Arc<dyn NodeInstance>)
    })
}

/// Gate node: parks in `waitingForExternalInput` until an external writer
/// merges values into the record's output, then completes on replay.
struct UserInputNode {
    metadata: NodeMetadata,
    prompt: Option<String>,
}

#[async_trait::async_trait]
impl NodeInstance for UserInputNode {
    fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    async fn run(&self, ctx: RunContext<'_>) -> Result<RunOutput, NodeError> {
        if ctx.record.output.is_empty() {
            let waiting_for = self.prompt.clone().unwrap_or_else(|| "userInput".to_string());
            debug!(
                record_id = %ctx.record.record_id,
                waiting_for = %waiting_for,
                "user input gate parking"
            );
            return Ok(RunOutput::waiting(waiting_for));
        }

        // Replay after external input arrived: the record already carries the
        // supplied values.
        Ok(RunOutput::completed(
            ctx.record.output.clone(),
            vec![COMPLETED_EVENT.to_string()],
        ))
    }
}

pub fn user_input_factory() -> NodeFactory {
    Arc::new(|description| {
        let prompt = description
            .params
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Arc::new(UserInputNode {
            metadata: NodeMetadata::default(),
            prompt,
        }) as Arc<dyn NodeInstance>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NullChannel;
    use crate::node::NodeDescription;
    use crate::nodes::{StaticKeys, cancel_pair};
    use crate::record::{Record, RecordState};

    fn run_ctx<'a>(
        record: &'a Record,
        channel: &'a NullChannel,
        cancel: &'a crate::nodes::CancelToken,
        keys: &'a StaticKeys,
    ) -> RunContext<'a> {
        RunContext {
            channel,
            seed: 7,
            debugging: false,
            cancel,
            record,
            keys,
        }
    }

    #[tokio::test]
    async fn start_node_completes_with_params() {
        let description = NodeDescription {
            instance_id: "start".into(),
            node_type: START_NODE_TYPE.into(),
            params: serde_json::json!({"topic": "tides"}),
            ..Default::default()
        };
        let node = start_factory()(&description).unwrap();
        let record = Record::new("start", START_NODE_TYPE, vec![]);
        let channel = NullChannel;
        let (_handle, cancel) = cancel_pair();
        let keys = StaticKeys::default();

        let output = node.run(run_ctx(&record, &channel, &cancel, &keys)).await.unwrap();
        assert_eq!(output.state, RecordState::Completed);
        assert_eq!(output.output["topic"], "tides");
        assert_eq!(output.events_emitted, vec![COMPLETED_EVENT.to_string()]);
    }

    #[tokio::test]
    async fn user_input_gate_waits_then_completes_on_replay() {
        let description = NodeDescription {
            instance_id: "gate".into(),
            node_type: USER_INPUT_NODE_TYPE.into(),
            params: serde_json::json!({"prompt": "pick a voice"}),
            ..Default::default()
        };
        let node = user_input_factory()(&description).unwrap();
        let channel = NullChannel;
        let (_handle, cancel) = cancel_pair();
        let keys = StaticKeys::default();

        let mut record = Record::new("gate", USER_INPUT_NODE_TYPE, vec![]);
        let output = node.run(run_ctx(&record, &channel, &cancel, &keys)).await.unwrap();
        assert_eq!(output.state, RecordState::WaitingForExternalInput);
        assert_eq!(output.waiting_for.as_deref(), Some("pick a voice"));

        // External writer supplies the value; replay completes.
        record
            .output
            .insert("voice".into(), serde_json::Value::String("alto".into()));
        let output = node.run(run_ctx(&record, &channel, &cancel, &keys)).await.unwrap();
        assert_eq!(output.state, RecordState::Completed);
        assert_eq!(output.output["voice"], "alto");
    }
}
