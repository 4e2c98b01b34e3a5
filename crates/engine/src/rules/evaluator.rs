//! Transition legality checks
//!
//! The evaluator is stateless apart from its two collaborators. Every check
//! fails closed: a permission lookup error denies, and a condition name that
//! is not known denies.

use std::sync::Arc;

use tracing::{debug, warn};

use super::condition::{Condition, EvaluationContext};
use super::permissions::PermissionLookup;
use super::registry::{RuleRegistry, TransitionRule};
use crate::workflow::{Actor, ClinicalState};

/// Why a transition was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionDenied {
    /// The edge is not in the registry for the workflow type
    #[error("transition {from}->{to} is not defined for workflow type {workflow_type}")]
    InvalidTransition {
        workflow_type: String,
        from: ClinicalState,
        to: ClinicalState,
    },

    /// The actor lacks one or more required permissions
    #[error("actor {actor} lacks permissions: {}", .missing.join(", "))]
    PermissionDenied { actor: String, missing: Vec<String> },

    /// A required condition does not hold
    #[error("condition {condition} not met")]
    ConditionNotMet { condition: String },
}

/// Error for evaluating a condition by name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown condition: {0}")]
pub struct UnknownCondition(pub String);

/// Decides whether a transition is allowed
#[derive(Clone)]
pub struct TransitionEvaluator {
    registry: Arc<RuleRegistry>,
    permissions: Arc<dyn PermissionLookup>,
}

impl TransitionEvaluator {
    pub fn new(registry: Arc<RuleRegistry>, permissions: Arc<dyn PermissionLookup>) -> Self {
        Self {
            registry,
            permissions,
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Evaluate a condition by name
    pub fn evaluate_condition(
        &self,
        name: &str,
        ctx: &EvaluationContext<'_>,
    ) -> Result<bool, UnknownCondition> {
        let condition: Condition = name
            .parse()
            .map_err(|_| UnknownCondition(name.to_string()))?;
        Ok(condition.evaluate(ctx))
    }

    /// Whether the actor holds every named permission
    ///
    /// Returns `false` if the lookup fails.
    pub async fn has_permission(&self, actor: &Actor, names: &[String]) -> bool {
        self.missing_permissions(actor, names).await.is_empty()
    }

    async fn missing_permissions(&self, actor: &Actor, names: &[String]) -> Vec<String> {
        if names.is_empty() {
            return vec![];
        }

        match self.permissions.permissions_for(actor).await {
            Ok(granted) => names
                .iter()
                .filter(|name| !granted.contains(name.as_str()))
                .cloned()
                .collect(),
            Err(e) => {
                warn!(actor = %actor.id, error = %e, "Permission lookup failed, denying");
                names.to_vec()
            }
        }
    }

    /// Check a transition from `ctx.current_state` to `to`
    ///
    /// Order: edge existence, then permissions, then conditions.
    pub async fn check(
        &self,
        ctx: &EvaluationContext<'_>,
        to: ClinicalState,
    ) -> Result<TransitionRule, TransitionDenied> {
        let rule = self
            .registry
            .find(ctx.workflow_type, ctx.current_state, to)
            .ok_or_else(|| TransitionDenied::InvalidTransition {
                workflow_type: ctx.workflow_type.to_string(),
                from: ctx.current_state,
                to,
            })?;

        let missing = self
            .missing_permissions(ctx.actor, &rule.required_permissions)
            .await;
        if !missing.is_empty() {
            return Err(TransitionDenied::PermissionDenied {
                actor: ctx.actor.id.clone(),
                missing,
            });
        }

        if let Some(failed) = rule.conditions.iter().find(|c| !c.evaluate(ctx)) {
            debug!(workflow_id = %ctx.workflow_id, condition = %failed, "Condition not met");
            return Err(TransitionDenied::ConditionNotMet {
                condition: failed.to_string(),
            });
        }

        Ok(rule.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::rules::permissions::{PermissionLookupError, RolePermissionTable};
    use crate::workflow::{WorkflowMetadata, WorkflowStep};

    struct FailingLookup;

    #[async_trait]
    impl PermissionLookup for FailingLookup {
        async fn permissions_for(
            &self,
            _actor: &Actor,
        ) -> Result<HashSet<String>, PermissionLookupError> {
            Err(PermissionLookupError::Unavailable("timeout".to_string()))
        }
    }

    fn evaluator(lookup: Arc<dyn PermissionLookup>) -> TransitionEvaluator {
        TransitionEvaluator::new(Arc::new(RuleRegistry::builtin().unwrap()), lookup)
    }

    fn ctx<'a>(
        actor: &'a Actor,
        metadata: &'a WorkflowMetadata,
        steps: &'a [WorkflowStep],
        state: ClinicalState,
    ) -> EvaluationContext<'a> {
        EvaluationContext {
            workflow_id: Uuid::now_v7(),
            workflow_type: "consultation",
            current_state: state,
            current_step: "assessment",
            actor,
            steps,
            metadata,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_invalid_edge() {
        let eval = evaluator(Arc::new(RolePermissionTable::clinical_defaults()));
        let actor = Actor::new("dr").with_role("doctor");
        let metadata = WorkflowMetadata::new();

        let result = eval
            .check(
                &ctx(&actor, &metadata, &[], ClinicalState::Pending),
                ClinicalState::Completed,
            )
            .await;
        assert!(matches!(result, Err(TransitionDenied::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_permission_checked_before_conditions() {
        let eval = evaluator(Arc::new(RolePermissionTable::clinical_defaults()));
        let actor = Actor::new("front-desk").with_role("receptionist");
        let metadata = WorkflowMetadata::new();

        let result = eval
            .check(
                &ctx(&actor, &metadata, &[], ClinicalState::Pending),
                ClinicalState::InProgress,
            )
            .await;
        assert_eq!(
            result.unwrap_err(),
            TransitionDenied::PermissionDenied {
                actor: "front-desk".to_string(),
                missing: vec!["start_consultation".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_condition_not_met() {
        let eval = evaluator(Arc::new(RolePermissionTable::clinical_defaults()));
        let actor = Actor::new("dr").with_role("doctor");
        let metadata = WorkflowMetadata::new();

        let result = eval
            .check(
                &ctx(&actor, &metadata, &[], ClinicalState::Pending),
                ClinicalState::InProgress,
            )
            .await;
        assert_eq!(
            result.unwrap_err(),
            TransitionDenied::ConditionNotMet {
                condition: "patient_assigned".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_allowed() {
        let eval = evaluator(Arc::new(RolePermissionTable::clinical_defaults()));
        let actor = Actor::new("dr").with_role("doctor");
        let metadata = WorkflowMetadata::new().with("patient_assigned", true);

        let rule = eval
            .check(
                &ctx(&actor, &metadata, &[], ClinicalState::Pending),
                ClinicalState::InProgress,
            )
            .await
            .unwrap();
        assert_eq!(rule.to, ClinicalState::InProgress);
    }

    #[tokio::test]
    async fn test_lookup_error_fails_closed() {
        let eval = evaluator(Arc::new(FailingLookup));
        let actor = Actor::new("dr").with_role("doctor");

        assert!(!eval.has_permission(&actor, &["start_consultation".to_string()]).await);
        // Nothing required means nothing to look up
        assert!(eval.has_permission(&actor, &[]).await);
    }

    #[test]
    fn test_evaluate_unknown_condition_is_error() {
        let eval = evaluator(Arc::new(RolePermissionTable::new()));
        let actor = Actor::new("dr");
        let metadata = WorkflowMetadata::new().with("documentation_complete", true);
        let context = ctx(&actor, &metadata, &[], ClinicalState::InProgress);

        assert_eq!(
            eval.evaluate_condition("documentation_complete", &context),
            Ok(true)
        );
        assert_eq!(
            eval.evaluate_condition("vibes_ok", &context),
            Err(UnknownCondition("vibes_ok".to_string()))
        );
    }
}
