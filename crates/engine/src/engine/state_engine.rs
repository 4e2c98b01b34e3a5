//! Versioned workflow state engine
//!
//! The `WorkflowStateEngine` is responsible for:
//! - Creating version 1 of a workflow
//! - Committing legal transitions as new immutable versions
//! - Recovering a historical version as a new current version
//! - Read-through caching and integrity checks

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::{event_types, topics, BusMessage, EventBus};
use crate::cache::KeyValueCache;
use crate::clock::Clock;
use crate::persistence::{StateCommit, StoreError, WorkflowStateStore};
use crate::reliability::RetryPolicy;
use crate::rules::{EvaluationContext, TransitionDenied, TransitionEvaluator};
use crate::workflow::{
    transition_labels, Actor, ClinicalState, InitialState, RecoveryInfo, StepStatus,
    WorkflowMetadata, WorkflowState, WorkflowStateHistory, WorkflowSummary,
};

/// Configuration for the state engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TTL of cached current states
    pub cache_ttl: Duration,

    /// Upper bound on `get_history` page size
    pub max_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            max_history_limit: 1000,
        }
    }
}

impl EngineConfig {
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_history_limit(mut self, limit: usize) -> Self {
        self.max_history_limit = limit;
        self
    }
}

/// Errors from state engine operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("transition {from}->{to} is not defined for workflow type {workflow_type}")]
    InvalidTransition {
        workflow_type: String,
        from: ClinicalState,
        to: ClinicalState,
    },

    #[error("actor {actor} lacks permissions: {}", .missing.join(", "))]
    PermissionDenied { actor: String, missing: Vec<String> },

    #[error("condition {condition} not met")]
    ConditionNotMet { condition: String },

    /// Stored checksum does not match the stored content
    #[error("checksum mismatch for workflow {workflow_id} version {version}")]
    IntegrityViolation { workflow_id: Uuid, version: i32 },

    /// Another writer committed first; safe to retry
    #[error("workflow {workflow_id} was modified concurrently (expected version {expected})")]
    ConcurrentModification { workflow_id: Uuid, expected: i32 },

    #[error("workflow {workflow_id} has no version {version}")]
    VersionNotFound { workflow_id: Uuid, version: i32 },

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(message) => Self::Serialization(message),
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TransitionDenied> for EngineError {
    fn from(denied: TransitionDenied) -> Self {
        match denied {
            TransitionDenied::InvalidTransition {
                workflow_type,
                from,
                to,
            } => Self::InvalidTransition {
                workflow_type,
                from,
                to,
            },
            TransitionDenied::PermissionDenied { actor, missing } => {
                Self::PermissionDenied { actor, missing }
            }
            TransitionDenied::ConditionNotMet { condition } => Self::ConditionNotMet { condition },
        }
    }
}

impl EngineError {
    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification { .. } => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Request to move a workflow to a new state
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub workflow_id: Uuid,
    pub to_state: ClinicalState,
    /// Step that becomes current and is marked `in_progress`
    pub to_step: String,
    pub actor: Actor,
    pub reason: Option<String>,
    /// Merged over the current metadata
    pub metadata: Option<WorkflowMetadata>,
}

impl TransitionRequest {
    pub fn new(
        workflow_id: Uuid,
        to_state: ClinicalState,
        to_step: impl Into<String>,
        actor: Actor,
    ) -> Self {
        Self {
            workflow_id,
            to_state,
            to_step: to_step.into(),
            actor,
            reason: None,
            metadata: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: WorkflowMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Cache key for a workflow's current state
pub fn state_cache_key(workflow_id: Uuid) -> String {
    format!("workflow_state:{workflow_id}")
}

/// Workflow state engine
///
/// All collaborators are injected. Writes go through
/// [`WorkflowStateStore::commit_version`], so two writers racing from the
/// same version produce exactly one new version.
///
/// # Example
///
/// ```ignore
/// use carepath_engine::prelude::*;
///
/// let engine = WorkflowStateEngine::new(store, cache, bus, evaluator, clock, EngineConfig::default());
/// let state = engine
///     .create_state(workflow_id, InitialState::new("consultation", "assessment"), &actor)
///     .await?;
/// ```
pub struct WorkflowStateEngine {
    store: Arc<dyn WorkflowStateStore>,
    cache: Arc<dyn KeyValueCache>,
    bus: Arc<dyn EventBus>,
    evaluator: TransitionEvaluator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl WorkflowStateEngine {
    pub fn new(
        store: Arc<dyn WorkflowStateStore>,
        cache: Arc<dyn KeyValueCache>,
        bus: Arc<dyn EventBus>,
        evaluator: TransitionEvaluator,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            evaluator,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create version 1 of a workflow
    #[instrument(skip(self, initial, actor), fields(workflow_type = %initial.workflow_type))]
    pub async fn create_state(
        &self,
        workflow_id: Uuid,
        initial: InitialState,
        actor: &Actor,
    ) -> Result<WorkflowState, EngineError> {
        if !self.evaluator.registry().contains(&initial.workflow_type) {
            return Err(EngineError::UnknownWorkflowType(initial.workflow_type));
        }

        let now = self.clock.now();
        let state = WorkflowState::new_version(
            workflow_id,
            1,
            initial.state,
            initial.current_step,
            initial.steps,
            initial.metadata,
            &actor.id,
            now,
        )?;
        let history = WorkflowStateHistory::new(
            workflow_id,
            state.id,
            None,
            transition_labels::CREATED,
            &actor.id,
            now,
        );
        let summary = WorkflowSummary::for_state(&initial.workflow_type, &state);

        self.store
            .insert_initial(StateCommit {
                state: state.clone(),
                history,
                summary,
            })
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { .. } => EngineError::AlreadyExists(workflow_id),
                other => other.into(),
            })?;

        self.refresh_cache(&state).await;
        self.publish(
            event_types::WORKFLOW_STATE_CREATED,
            json!({
                "workflow_id": workflow_id,
                "workflow_type": initial.workflow_type,
                "state": state.state,
                "version": state.version,
            }),
        )
        .await;

        info!(%workflow_id, "Created workflow state");
        Ok(state)
    }

    /// Current state, served from cache when possible
    ///
    /// A cache hit may trail a concurrent writer by at most the time between
    /// its commit and its cache refresh.
    #[instrument(skip(self))]
    pub async fn get_state(&self, workflow_id: Uuid) -> Result<WorkflowState, EngineError> {
        let key = state_cache_key(workflow_id);
        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<WorkflowState>(&cached) {
                Ok(state) => return Ok(state),
                Err(e) => warn!(%workflow_id, error = %e, "Dropping undecodable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(%workflow_id, error = %e, "Cache read failed, using store"),
        }

        let state = self
            .store
            .latest_state(workflow_id)
            .await?
            .ok_or(EngineError::NotFound(workflow_id))?;
        self.refresh_cache(&state).await;
        Ok(state)
    }

    /// A specific historical version
    #[instrument(skip(self))]
    pub async fn get_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<WorkflowState, EngineError> {
        if let Some(state) = self.store.state_at_version(workflow_id, version).await? {
            return Ok(state);
        }
        match self.store.max_version(workflow_id).await? {
            Some(_) => Err(EngineError::VersionNotFound {
                workflow_id,
                version,
            }),
            None => Err(EngineError::NotFound(workflow_id)),
        }
    }

    /// Commit a transition as a new version
    ///
    /// Fails with the specific denial kind, or with
    /// [`EngineError::ConcurrentModification`] if another writer committed
    /// first. Nothing is written on failure.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, to = %request.to_state))]
    pub async fn transition(&self, request: TransitionRequest) -> Result<WorkflowState, EngineError> {
        let workflow_id = request.workflow_id;

        // 1-2: current state and workflow type, always from the store
        let current = self
            .store
            .latest_state(workflow_id)
            .await?
            .ok_or(EngineError::NotFound(workflow_id))?;
        let workflow_type = self.workflow_type(workflow_id).await?;

        if !current.checksum_matches() {
            warn!(%workflow_id, version = current.version, "Refusing transition from corrupted state");
            return Err(EngineError::IntegrityViolation {
                workflow_id,
                version: current.version,
            });
        }

        // 3: legality
        let now = self.clock.now();
        let ctx = EvaluationContext {
            workflow_id,
            workflow_type: &workflow_type,
            current_state: current.state,
            current_step: &current.current_step,
            actor: &request.actor,
            steps: &current.steps,
            metadata: &current.metadata,
            now,
        };
        self.evaluator.check(&ctx, request.to_state).await?;

        // 4-6: new version content
        let mut steps = current.steps.clone();
        if let Some(step) = steps
            .iter_mut()
            .find(|s| s.matches(&request.to_step) && !s.status.is_done())
        {
            step.status = StepStatus::InProgress;
        }
        let metadata = match &request.metadata {
            Some(delta) => current.metadata.merged(delta),
            None => current.metadata.clone(),
        };

        let next = WorkflowState::new_version(
            workflow_id,
            current.version + 1,
            request.to_state,
            request.to_step.clone(),
            steps,
            metadata,
            &request.actor.id,
            now,
        )?;
        let history = WorkflowStateHistory::new(
            workflow_id,
            next.id,
            Some(current.id),
            WorkflowStateHistory::edge_label(current.state, request.to_state),
            &request.actor.id,
            now,
        )
        .with_reason(request.reason.clone())
        .with_metadata(request.metadata.clone().unwrap_or_default());
        let summary = WorkflowSummary::for_state(&workflow_type, &next);

        // 7: version-guarded commit
        self.commit(current.version, next.clone(), history, summary)
            .await?;

        // 8-9
        self.refresh_cache(&next).await;
        self.publish(
            event_types::WORKFLOW_STATE_CHANGED,
            json!({
                "workflow_id": workflow_id,
                "from_state": current.state,
                "to_state": next.state,
                "version": next.version,
            }),
        )
        .await;

        info!(
            %workflow_id,
            from = %current.state,
            to = %next.state,
            version = next.version,
            "Committed transition"
        );
        Ok(next)
    }

    /// [`transition`](Self::transition), retried on lost version races
    ///
    /// Each attempt re-reads the current state and re-checks legality.
    pub async fn transition_with_retry(
        &self,
        request: TransitionRequest,
        policy: &RetryPolicy,
    ) -> Result<WorkflowState, EngineError> {
        policy
            .retry(
                |e: &EngineError| matches!(e, EngineError::ConcurrentModification { .. }),
                |_| self.transition(request.clone()),
            )
            .await
    }

    /// Re-commit the content of `target_version` as a new current version
    ///
    /// Administrative override: transition rules are not consulted. The new
    /// version is `max + 1` and carries `metadata.recovery`.
    #[instrument(skip(self, actor, reason))]
    pub async fn recover_state(
        &self,
        workflow_id: Uuid,
        target_version: i32,
        actor: &Actor,
        reason: &str,
    ) -> Result<WorkflowState, EngineError> {
        let target = self.get_version(workflow_id, target_version).await?;
        if !target.checksum_matches() {
            warn!(%workflow_id, target_version, "Refusing to recover corrupted version");
            return Err(EngineError::IntegrityViolation {
                workflow_id,
                version: target_version,
            });
        }

        let latest = self
            .store
            .latest_state(workflow_id)
            .await?
            .ok_or(EngineError::NotFound(workflow_id))?;
        let workflow_type = self.workflow_type(workflow_id).await?;
        let now = self.clock.now();

        let info = RecoveryInfo {
            from_version: target_version,
            previous_version: latest.version,
            reason: reason.to_string(),
            recovered_by: actor.id.clone(),
            recovered_at: now,
        };
        let mut metadata = target.metadata.clone();
        metadata.set_recovery(&info)?;

        let recovered = WorkflowState::new_version(
            workflow_id,
            latest.version + 1,
            target.state,
            target.current_step.clone(),
            target.steps.clone(),
            metadata,
            &actor.id,
            now,
        )?;
        let mut history_metadata = WorkflowMetadata::new();
        history_metadata.set_recovery(&info)?;
        let history = WorkflowStateHistory::new(
            workflow_id,
            recovered.id,
            Some(latest.id),
            transition_labels::RECOVERED,
            &actor.id,
            now,
        )
        .with_reason(Some(reason.to_string()))
        .with_metadata(history_metadata);
        let summary = WorkflowSummary::for_state(&workflow_type, &recovered);

        self.commit(latest.version, recovered.clone(), history, summary)
            .await?;

        self.refresh_cache(&recovered).await;
        self.publish(
            event_types::WORKFLOW_STATE_RECOVERED,
            json!({
                "workflow_id": workflow_id,
                "from_version": target_version,
                "previous_version": latest.version,
                "version": recovered.version,
            }),
        )
        .await;

        info!(
            %workflow_id,
            target_version,
            version = recovered.version,
            "Recovered workflow state"
        );
        Ok(recovered)
    }

    /// History entries, newest first
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowStateHistory>, EngineError> {
        let limit = limit.min(self.config.max_history_limit);
        let history = self.store.history(workflow_id, limit).await?;
        if history.is_empty() && self.store.max_version(workflow_id).await?.is_none() {
            return Err(EngineError::NotFound(workflow_id));
        }
        Ok(history)
    }

    /// Recompute the latest version's checksum against the stored one
    ///
    /// A mismatch is reported as `false`, not as an error.
    #[instrument(skip(self))]
    pub async fn validate_integrity(&self, workflow_id: Uuid) -> Result<bool, EngineError> {
        let state = self
            .store
            .latest_state(workflow_id)
            .await?
            .ok_or(EngineError::NotFound(workflow_id))?;

        let expected = state.recompute_checksum()?;
        if expected != state.checksum {
            warn!(
                %workflow_id,
                version = state.version,
                stored = %state.checksum,
                computed = %expected,
                "Workflow state checksum mismatch"
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn workflow_type(&self, workflow_id: Uuid) -> Result<String, EngineError> {
        self.store
            .workflow_summary(workflow_id)
            .await?
            .map(|s| s.workflow_type)
            .ok_or(EngineError::NotFound(workflow_id))
    }

    async fn commit(
        &self,
        expected_version: i32,
        state: WorkflowState,
        history: WorkflowStateHistory,
        summary: WorkflowSummary,
    ) -> Result<(), EngineError> {
        let workflow_id = state.workflow_id;
        self.store
            .commit_version(
                expected_version,
                StateCommit {
                    state,
                    history,
                    summary,
                },
            )
            .await
            .map_err(|e| match e {
                StoreError::ConcurrencyConflict { expected, actual } => {
                    debug!(%workflow_id, expected, actual, "Lost version race");
                    EngineError::ConcurrentModification {
                        workflow_id,
                        expected,
                    }
                }
                StoreError::NotFound { .. } => EngineError::NotFound(workflow_id),
                other => other.into(),
            })
    }

    async fn refresh_cache(&self, state: &WorkflowState) {
        let key = state_cache_key(state.workflow_id);
        let result = match serde_json::to_string(state) {
            Ok(encoded) => self
                .cache
                .set_with_ttl(&key, encoded, self.config.cache_ttl)
                .await,
            Err(e) => {
                warn!(workflow_id = %state.workflow_id, error = %e, "Failed to encode state for cache");
                self.cache.delete(&key).await
            }
        };
        if let Err(e) = result {
            warn!(workflow_id = %state.workflow_id, error = %e, "Cache refresh failed");
        }
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let message = BusMessage::new(event_type, payload);
        if let Err(e) = self.bus.publish(topics::WORKFLOW_EVENTS, message).await {
            warn!(event_type, error = %e, "Failed to publish workflow event");
        }
    }
}
