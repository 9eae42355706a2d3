//! Status transport back to the session client.
//!
//! The scheduler only ever forwards status through [`StatusChannel`]; the
//! concrete transport (pub/sub, websocket, test buffer) is opaque to the
//! core. Updates are fire-and-forget: a slow or broken client must never
//! stall planning.

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

/// A status command published to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum StatusUpdate {
    #[serde(rename_all = "camelCase")]
    Started {
        record_id: Uuid,
        node_instance_id: String,
    },
    /// Sent once per pending record; the scheduler deduplicates repeats.
    #[serde(rename_all = "camelCase")]
    WaitingForExternalInput {
        record_id: Uuid,
        node_instance_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        waiting_for: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        record_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        node_instance_id: Option<String>,
        message: String,
    },
    Stopped,
}

/// Opaque status transport consumed by the scheduler.
pub trait StatusChannel: Send + Sync {
    fn send_command(&self, update: StatusUpdate);
}

/// Channel that drops every update. Useful for headless drains.
#[derive(Debug, Default)]
pub struct NullChannel;

impl StatusChannel for NullChannel {
    fn send_command(&self, _update: StatusUpdate) {}
}

/// Channel that buffers updates in order, for assertions in tests.
#[derive(Debug, Default)]
pub struct BufferingChannel {
    updates: Mutex<Vec<StatusUpdate>>,
}

impl BufferingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<StatusUpdate> {
        std::mem::take(&mut self.updates.lock().expect("status buffer poisoned"))
    }

    pub fn snapshot(&self) -> Vec<StatusUpdate> {
        self.updates.lock().expect("status buffer poisoned").clone()
    }
}

impl StatusChannel for BufferingChannel {
    fn send_command(&self, update: StatusUpdate) {
        self.updates.lock().expect("status buffer poisoned").push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_serialize_with_command_tag() {
        let update = StatusUpdate::Started {
            record_id: Uuid::nil(),
            node_instance_id: "llm-1".into(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["command"], "started");
        assert_eq!(json["nodeInstanceId"], "llm-1");
    }

    #[test]
    fn buffering_channel_preserves_order() {
        let channel = BufferingChannel::new();
        channel.send_command(StatusUpdate::Stopped);
        channel.send_command(StatusUpdate::Error {
            record_id: None,
            node_instance_id: None,
            message: "boom".into(),
        });
        let updates = channel.drain();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], StatusUpdate::Stopped);
        assert!(channel.snapshot().is_empty());
    }
}
