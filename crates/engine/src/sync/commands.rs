//! Bus-driven sync commands and clinical events

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::entity::EntityType;
use super::reconciler::{SyncError, SyncReconciler};
use crate::bus::{event_types, topics, BusMessage, EventBus};

/// Requests accepted on `clinical-sync-commands`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCommand {
    FullSync,
    IncrementalSync { since: Option<DateTime<Utc>> },
    HealthCheck,
}

impl SyncCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FullSync => "full_sync",
            Self::IncrementalSync { .. } => "incremental_sync",
            Self::HealthCheck => "health_check",
        }
    }

    /// Command name is the message's event type; `since` rides in the payload
    pub fn from_message(message: &BusMessage) -> Result<Self, CommandError> {
        match message.event_type.as_str() {
            "full_sync" => Ok(Self::FullSync),
            "incremental_sync" => {
                let since = match message.payload.get("since") {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(
                        serde_json::from_value(value.clone())
                            .map_err(|e| CommandError::InvalidPayload(e.to_string()))?,
                    ),
                };
                Ok(Self::IncrementalSync { since })
            }
            "health_check" => Ok(Self::HealthCheck),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Consumes sync commands and clinical record events from the bus
///
/// Every command is acknowledged on `clinical-sync-acks`; its outcome goes
/// to `clinical-sync-results` or `clinical-sync-errors`.
pub struct SyncCommandHandler {
    reconciler: Arc<SyncReconciler>,
    bus: Arc<dyn EventBus>,
}

impl SyncCommandHandler {
    pub fn new(reconciler: Arc<SyncReconciler>, bus: Arc<dyn EventBus>) -> Self {
        Self { reconciler, bus }
    }

    #[instrument(skip(self, message), fields(command_id = %message.id, command = %message.event_type))]
    pub async fn handle_command(&self, message: &BusMessage) {
        let command = match SyncCommand::from_message(message) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected sync command");
                self.publish_error(message.id, &message.event_type, &e).await;
                return;
            }
        };

        self.publish(
            topics::SYNC_ACKS,
            event_types::COMMAND_ACKNOWLEDGED,
            json!({"command_id": message.id, "command": command.name()}),
        )
        .await;

        let outcome = match command {
            SyncCommand::FullSync => self
                .reconciler
                .run_full()
                .await
                .map(|report| (event_types::SYNC_COMPLETED, json!(report))),
            SyncCommand::IncrementalSync { since } => self
                .reconciler
                .run_incremental(since)
                .await
                .map(|report| (event_types::SYNC_COMPLETED, json!(report))),
            SyncCommand::HealthCheck => self
                .reconciler
                .get_sync_status()
                .await
                .map(|status| (event_types::HEALTH_STATUS, json!(status))),
        };

        match outcome {
            Ok((event_type, result)) => {
                info!(command = command.name(), "Sync command completed");
                self.publish(
                    topics::SYNC_RESULTS,
                    event_type,
                    json!({"command_id": message.id, "command": command.name(), "result": result}),
                )
                .await;
            }
            Err(e) => {
                error!(command = command.name(), error = %e, "Sync command failed");
                self.publish_error(message.id, command.name(), &CommandError::Sync(e))
                    .await;
            }
        }
    }

    /// Apply a `record_created`, `record_updated` or `record_deleted` event
    ///
    /// Payload carries `entity_type` plus `data` (create/update) or `id`
    /// (delete). Failures are logged; the event is not redelivered.
    #[instrument(skip(self, message), fields(event_id = %message.id, event_type = %message.event_type))]
    pub async fn handle_clinical_event(&self, message: &BusMessage) {
        if let Err(e) = self.apply_clinical_event(message).await {
            warn!(error = %e, "Failed to apply clinical event");
        }
    }

    async fn apply_clinical_event(&self, message: &BusMessage) -> Result<(), CommandError> {
        let entity_type = message
            .payload
            .get("entity_type")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::InvalidPayload("missing entity_type".to_string()))
            .and_then(|s| EntityType::from_str(s).map_err(CommandError::InvalidPayload))?;

        match message.event_type.as_str() {
            event_types::RECORD_CREATED | event_types::RECORD_UPDATED => {
                let data = message
                    .payload
                    .get("data")
                    .cloned()
                    .ok_or_else(|| CommandError::InvalidPayload("missing data".to_string()))?;
                let outcome = self
                    .reconciler
                    .handle_incoming_change(entity_type, data)
                    .await?;
                debug!(?outcome, "Applied clinical event");
            }
            event_types::RECORD_DELETED => {
                let id = message
                    .payload
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or_else(|| CommandError::InvalidPayload("missing or invalid id".to_string()))?;
                self.reconciler
                    .handle_incoming_deletion(entity_type, id)
                    .await?;
            }
            other => debug!(event_type = other, "Ignoring clinical event"),
        }
        Ok(())
    }

    /// Dispatch bus messages until shutdown or the channel closes
    pub async fn run(
        &self,
        mut messages: broadcast::Receiver<(String, BusMessage)>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Sync command handler started");
        loop {
            tokio::select! {
                received = messages.recv() => match received {
                    Ok((topic, message)) => match topic.as_str() {
                        topics::SYNC_COMMANDS => self.handle_command(&message).await,
                        topics::CLINICAL_EVENTS => self.handle_clinical_event(&message).await,
                        _ => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Command handler lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        info!("Sync command handler stopped");
    }

    async fn publish_error(&self, command_id: Uuid, command: &str, error: &CommandError) {
        self.publish(
            topics::SYNC_ERRORS,
            event_types::SYNC_FAILED,
            json!({"command_id": command_id, "command": command, "error": error.to_string()}),
        )
        .await;
    }

    async fn publish(&self, topic: &str, event_type: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish(topic, BusMessage::new(event_type, payload))
            .await
        {
            warn!(topic, error = %e, "Failed to publish sync message");
        }
    }
}
