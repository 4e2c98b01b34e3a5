//! Named transition conditions

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Actor, ClinicalState, StepStatus, WorkflowMetadata, WorkflowStep};

/// Everything a condition or permission check may look at
///
/// Built once per transition attempt from the current state.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub workflow_id: Uuid,
    pub workflow_type: &'a str,
    pub current_state: ClinicalState,
    pub current_step: &'a str,
    pub actor: &'a Actor,
    pub steps: &'a [WorkflowStep],
    pub metadata: &'a WorkflowMetadata,
    pub now: DateTime<Utc>,
}

/// Conditions a transition rule may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Every step is completed or skipped (and there is at least one)
    AllStepsCompleted,
    /// `metadata.documentation_complete == true`
    DocumentationComplete,
    /// `metadata.cancellation_requested == true`
    CancellationRequested,
    /// `metadata.deadline` has passed or an open step is overdue
    TimeoutExceeded,
    /// `metadata.patient_assigned == true` or a `patient_id` is recorded
    PatientAssigned,
    /// No step is blocked
    NoBlockedSteps,
    /// The current step failed and still has retries left
    RetriesAvailable,
}

impl Condition {
    pub const ALL: [Condition; 7] = [
        Self::AllStepsCompleted,
        Self::DocumentationComplete,
        Self::CancellationRequested,
        Self::TimeoutExceeded,
        Self::PatientAssigned,
        Self::NoBlockedSteps,
        Self::RetriesAvailable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::AllStepsCompleted => "all_steps_completed",
            Self::DocumentationComplete => "documentation_complete",
            Self::CancellationRequested => "cancellation_requested",
            Self::TimeoutExceeded => "timeout_exceeded",
            Self::PatientAssigned => "patient_assigned",
            Self::NoBlockedSteps => "no_blocked_steps",
            Self::RetriesAvailable => "retries_available",
        }
    }

    /// Evaluate against a context. Pure; no I/O.
    pub fn evaluate(&self, ctx: &EvaluationContext<'_>) -> bool {
        match self {
            Self::AllStepsCompleted => {
                !ctx.steps.is_empty() && ctx.steps.iter().all(|s| s.status.is_done())
            }
            Self::DocumentationComplete => ctx.metadata.flag("documentation_complete"),
            Self::CancellationRequested => ctx.metadata.flag("cancellation_requested"),
            Self::TimeoutExceeded => {
                ctx.metadata
                    .timestamp("deadline")
                    .is_some_and(|deadline| deadline < ctx.now)
                    || ctx.steps.iter().any(|s| s.is_overdue(ctx.now))
            }
            Self::PatientAssigned => {
                ctx.metadata.flag("patient_assigned") || ctx.metadata.str("patient_id").is_some()
            }
            Self::NoBlockedSteps => ctx.steps.iter().all(|s| s.status != StepStatus::Blocked),
            Self::RetriesAvailable => ctx
                .steps
                .iter()
                .find(|s| s.matches(ctx.current_step))
                .is_some_and(|s| s.status == StepStatus::Failed && s.has_retries_left()),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| format!("unknown condition: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ctx<'a>(
        actor: &'a Actor,
        steps: &'a [WorkflowStep],
        metadata: &'a WorkflowMetadata,
        current_step: &'a str,
    ) -> EvaluationContext<'a> {
        EvaluationContext {
            workflow_id: Uuid::now_v7(),
            workflow_type: "consultation",
            current_state: ClinicalState::InProgress,
            current_step,
            actor,
            steps,
            metadata,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_parse_known_and_unknown() {
        for condition in Condition::ALL {
            assert_eq!(condition.name().parse::<Condition>().unwrap(), condition);
        }
        assert!("moon_is_full".parse::<Condition>().is_err());
    }

    #[test]
    fn test_all_steps_completed() {
        let actor = Actor::new("u");
        let metadata = WorkflowMetadata::new();
        let steps = vec![
            WorkflowStep::new("a").with_status(StepStatus::Completed),
            WorkflowStep::new("b").with_status(StepStatus::Skipped),
        ];
        assert!(Condition::AllStepsCompleted.evaluate(&ctx(&actor, &steps, &metadata, "a")));

        let open = vec![WorkflowStep::new("a")];
        assert!(!Condition::AllStepsCompleted.evaluate(&ctx(&actor, &open, &metadata, "a")));
        assert!(!Condition::AllStepsCompleted.evaluate(&ctx(&actor, &[], &metadata, "a")));
    }

    #[test]
    fn test_patient_assigned() {
        let actor = Actor::new("u");
        let flagged = WorkflowMetadata::new().with("patient_assigned", true);
        let with_id = WorkflowMetadata::new().with("patient_id", "p-1");
        let empty = WorkflowMetadata::new();

        assert!(Condition::PatientAssigned.evaluate(&ctx(&actor, &[], &flagged, "a")));
        assert!(Condition::PatientAssigned.evaluate(&ctx(&actor, &[], &with_id, "a")));
        assert!(!Condition::PatientAssigned.evaluate(&ctx(&actor, &[], &empty, "a")));
    }

    #[test]
    fn test_timeout_exceeded() {
        let actor = Actor::new("u");
        let past = (Utc::now() - Duration::hours(2)).to_rfc3339();
        let metadata = WorkflowMetadata::new().with("deadline", past);
        assert!(Condition::TimeoutExceeded.evaluate(&ctx(&actor, &[], &metadata, "a")));

        let empty = WorkflowMetadata::new();
        let overdue = vec![WorkflowStep::new("a").with_due_date(Utc::now() - Duration::hours(1))];
        assert!(Condition::TimeoutExceeded.evaluate(&ctx(&actor, &overdue, &empty, "a")));
        assert!(!Condition::TimeoutExceeded.evaluate(&ctx(&actor, &[], &empty, "a")));
    }

    #[test]
    fn test_retries_available_checks_current_step() {
        let actor = Actor::new("u");
        let metadata = WorkflowMetadata::new();
        let steps = vec![WorkflowStep::new("labs")
            .with_status(StepStatus::Failed)
            .with_retries(1, 3)];

        assert!(Condition::RetriesAvailable.evaluate(&ctx(&actor, &steps, &metadata, "labs")));
        assert!(!Condition::RetriesAvailable.evaluate(&ctx(&actor, &steps, &metadata, "other")));
    }
}
