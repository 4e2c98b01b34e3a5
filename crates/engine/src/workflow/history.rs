//! Workflow state history (audit trail)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ClinicalState, WorkflowMetadata};

/// Transition labels that are not `from->to` edges
pub mod transition_labels {
    pub const CREATED: &str = "created";
    pub const RECOVERED: &str = "recovered";
}

/// One entry per committed state change
///
/// History rows are append-only and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateHistory {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub state_id: Uuid,
    pub previous_state_id: Option<Uuid>,
    pub transition: String,
    pub reason: Option<String>,
    pub metadata: WorkflowMetadata,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowStateHistory {
    pub fn new(
        workflow_id: Uuid,
        state_id: Uuid,
        previous_state_id: Option<Uuid>,
        transition: impl Into<String>,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            state_id,
            previous_state_id,
            transition: transition.into(),
            reason: None,
            metadata: WorkflowMetadata::new(),
            created_by: created_by.to_string(),
            created_at,
        }
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_metadata(mut self, metadata: WorkflowMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Label for a rule-governed edge, e.g. `pending->in_progress`
    pub fn edge_label(from: ClinicalState, to: ClinicalState) -> String {
        format!("{from}->{to}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_label() {
        assert_eq!(
            WorkflowStateHistory::edge_label(ClinicalState::Pending, ClinicalState::InProgress),
            "pending->in_progress"
        );
    }
}
