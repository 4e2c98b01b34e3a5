//! Versioned workflow state

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{compute_checksum, WorkflowMetadata, WorkflowStep};

/// State of a clinical workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClinicalState {
    Pending,
    InProgress,
    OnHold,
    Completed,
    Cancelled,
    Failed,
}

impl ClinicalState {
    pub const ALL: [ClinicalState; 6] = [
        Self::Pending,
        Self::InProgress,
        Self::OnHold,
        Self::Completed,
        Self::Cancelled,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::OnHold => "on_hold",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ClinicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClinicalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown clinical state: {s}"))
    }
}

/// The user or system principal performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: vec![],
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// An immutable version of a workflow's state
///
/// A new version is written for every transition and recovery; existing
/// versions are never updated. The checksum covers `state`, `current_step`,
/// `steps` and `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i32,
    pub state: ClinicalState,
    pub current_step: String,
    pub steps: Vec<WorkflowStep>,
    pub metadata: WorkflowMetadata,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

impl WorkflowState {
    /// Build a new version and compute its checksum
    #[allow(clippy::too_many_arguments)]
    pub fn new_version(
        workflow_id: Uuid,
        version: i32,
        state: ClinicalState,
        current_step: String,
        steps: Vec<WorkflowStep>,
        metadata: WorkflowMetadata,
        created_by: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let checksum = compute_checksum(state, &current_step, &steps, &metadata)?;
        Ok(Self {
            id: Uuid::now_v7(),
            workflow_id,
            version,
            state,
            current_step,
            steps,
            metadata,
            created_by: created_by.to_string(),
            created_at,
            checksum,
        })
    }

    /// Recompute the checksum from content
    pub fn recompute_checksum(&self) -> Result<String, serde_json::Error> {
        compute_checksum(self.state, &self.current_step, &self.steps, &self.metadata)
    }

    /// Whether the stored checksum matches the content
    pub fn checksum_matches(&self) -> bool {
        self.recompute_checksum()
            .map(|c| c == self.checksum)
            .unwrap_or(false)
    }
}

/// Content of the first version of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    /// Rule set the workflow is governed by (e.g. "consultation")
    pub workflow_type: String,
    #[serde(default = "default_initial_state")]
    pub state: ClinicalState,
    pub current_step: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

fn default_initial_state() -> ClinicalState {
    ClinicalState::Pending
}

impl InitialState {
    pub fn new(workflow_type: impl Into<String>, current_step: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            state: ClinicalState::Pending,
            current_step: current_step.into(),
            steps: vec![],
            metadata: WorkflowMetadata::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<WorkflowStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_metadata(mut self, metadata: WorkflowMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Denormalized workflow row kept alongside the version table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub workflow_type: String,
    pub state: ClinicalState,
    pub current_step: String,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSummary {
    pub fn for_state(workflow_type: &str, state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id,
            workflow_type: workflow_type.to_string(),
            state: state.state,
            current_step: state.current_step.clone(),
            version: state.version,
            updated_at: state.created_at,
        }
    }
}
