//! Workflow step snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single step inside a workflow snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
    Blocked,
}

impl StepStatus {
    /// Completed and skipped steps need no further work
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// A step embedded in a [`WorkflowState`](super::WorkflowState)
///
/// Steps are value objects: they are never persisted on their own, only as
/// part of the snapshot that owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl WorkflowStep {
    /// Create a pending step whose id and name are the same
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            status: StepStatus::Pending,
            assigned_to: None,
            due_date: None,
            completed_at: None,
            notes: None,
            dependencies: vec![],
            retry_count: None,
            max_retries: None,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the due date
    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Set retry counters
    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = Some(retry_count);
        self.max_retries = Some(max_retries);
        self
    }

    /// Steps are addressed by id, falling back to name
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key
    }

    /// Whether the step is past its due date and still open
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_done() && self.due_date.is_some_and(|due| due < now)
    }

    /// Whether a failed step may be retried
    pub fn has_retries_left(&self) -> bool {
        match (self.retry_count, self.max_retries) {
            (Some(count), Some(max)) => count < max,
            (None, Some(max)) => max > 0,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_step_done_statuses() {
        assert!(StepStatus::Completed.is_done());
        assert!(StepStatus::Skipped.is_done());
        assert!(!StepStatus::Blocked.is_done());
        assert!(!StepStatus::InProgress.is_done());
    }

    #[test]
    fn test_overdue() {
        let now = Utc::now();
        let step = WorkflowStep::new("labs").with_due_date(now - Duration::hours(1));
        assert!(step.is_overdue(now));

        let done = step.clone().with_status(StepStatus::Completed);
        assert!(!done.is_overdue(now));
    }

    #[test]
    fn test_retries_left() {
        assert!(WorkflowStep::new("a").with_retries(1, 3).has_retries_left());
        assert!(!WorkflowStep::new("a").with_retries(3, 3).has_retries_left());
        assert!(!WorkflowStep::new("a").has_retries_left());
    }

    #[test]
    fn test_serialization_skips_empty_options() {
        let json = serde_json::to_value(WorkflowStep::new("assessment")).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("assigned_to").is_none());
        assert_eq!(json["dependencies"], serde_json::json!([]));
    }
}
