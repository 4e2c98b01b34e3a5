//! Message bus abstraction
//!
//! The transport is an external collaborator. This module defines the
//! publish contract, the topic names, and an in-process bus used by tests
//! and by the worker when no broker is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Topic names
pub mod topics {
    /// Create/update/delete of domain records
    pub const CLINICAL_EVENTS: &str = "clinical-events";
    /// Workflow state transitions
    pub const WORKFLOW_EVENTS: &str = "workflow-events";
    /// full_sync / incremental_sync / health_check requests
    pub const SYNC_COMMANDS: &str = "clinical-sync-commands";
    pub const SYNC_ACKS: &str = "clinical-sync-acks";
    pub const SYNC_RESULTS: &str = "clinical-sync-results";
    pub const SYNC_ERRORS: &str = "clinical-sync-errors";
    /// Operator notifications (escalated conflicts)
    pub const SYNC_ALERTS: &str = "clinical-sync-alerts";
}

/// Event type names carried in [`BusMessage::event_type`]
pub mod event_types {
    pub const WORKFLOW_STATE_CREATED: &str = "workflow_state_created";
    pub const WORKFLOW_STATE_CHANGED: &str = "workflow_state_changed";
    pub const WORKFLOW_STATE_RECOVERED: &str = "workflow_state_recovered";
    pub const CONFLICT_RESOLVED: &str = "conflict_resolved";
    pub const CONFLICT_ESCALATED: &str = "conflict_escalated";
    pub const RECORD_QUARANTINED: &str = "record_quarantined";
    pub const RECORD_CREATED: &str = "record_created";
    pub const RECORD_UPDATED: &str = "record_updated";
    pub const RECORD_DELETED: &str = "record_deleted";
    pub const COMMAND_ACKNOWLEDGED: &str = "command_acknowledged";
    pub const SYNC_COMPLETED: &str = "sync_completed";
    pub const SYNC_FAILED: &str = "sync_failed";
    pub const HEALTH_STATUS: &str = "health_status";
}

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },
}

/// A message on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

/// Topic publisher
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError>;
}

/// In-process bus
///
/// Keeps a log of every published message and fans messages out to
/// subscribers over a broadcast channel.
pub struct InMemoryEventBus {
    log: Mutex<Vec<(String, BusMessage)>>,
    sender: broadcast::Sender<(String, BusMessage)>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            log: Mutex::new(vec![]),
            sender,
        }
    }

    /// Subscribe to all topics
    pub fn subscribe(&self) -> broadcast::Receiver<(String, BusMessage)> {
        self.sender.subscribe()
    }

    /// Messages published to a topic so far
    pub fn published(&self, topic: &str) -> Vec<BusMessage> {
        self.log
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BusError> {
        self.log.lock().push((topic.to_string(), message.clone()));
        // No subscribers is not an error
        let _ = self.sender.send((topic.to_string(), message));
        Ok(())
    }
}
