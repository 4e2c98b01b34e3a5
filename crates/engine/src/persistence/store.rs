//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::conflict::{AuditEntry, ConflictClosure, ConflictRecord, ConflictStatistics, ConflictStatus};
use crate::sync::{EntityType, SyncRecord};
use crate::validation::{QuarantineCounts, QuarantineReview, QuarantineStatus, QuarantinedRecord};
use crate::workflow::{WorkflowState, WorkflowStateHistory, WorkflowSummary};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Row not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    /// Row already exists
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: Uuid },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error, including timeouts
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// I/O failures may succeed on retry; domain outcomes won't
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// One atomic write of a workflow version
///
/// The state row, its history row and the summary row are written
/// together or not at all.
#[derive(Debug, Clone)]
pub struct StateCommit {
    pub state: WorkflowState,
    pub history: WorkflowStateHistory,
    pub summary: WorkflowSummary,
}

/// Result of a create-or-update write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Versioned workflow state persistence
///
/// Implementations must be thread-safe and must reject a commit whose
/// expected version is not the current one.
#[async_trait]
pub trait WorkflowStateStore: Send + Sync + 'static {
    /// Write version 1 of a workflow
    ///
    /// Fails with [`StoreError::AlreadyExists`] if any version exists.
    async fn insert_initial(&self, commit: StateCommit) -> Result<(), StoreError>;

    /// Write a new version on top of `expected_version`
    ///
    /// Fails with [`StoreError::ConcurrencyConflict`] if the latest stored
    /// version differs, in which case nothing is written.
    async fn commit_version(
        &self,
        expected_version: i32,
        commit: StateCommit,
    ) -> Result<(), StoreError>;

    /// Highest version of a workflow
    async fn latest_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>, StoreError>;

    async fn state_at_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowState>, StoreError>;

    async fn max_version(&self, workflow_id: Uuid) -> Result<Option<i32>, StoreError>;

    /// Denormalized summary row
    async fn workflow_summary(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError>;

    /// History entries, newest first
    async fn history(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowStateHistory>, StoreError>;
}

/// One side (authoritative or replica) of the synchronized domain tables
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Records of a type, optionally only those with `updated_at >= since`
    async fn list(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncRecord>, StoreError>;

    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<SyncRecord>, StoreError>;

    /// Create-or-update, safe to repeat
    async fn upsert(&self, record: &SyncRecord) -> Result<UpsertOutcome, StoreError>;

    /// Returns `false` if the record was already absent
    async fn delete(&self, entity_type: EntityType, id: Uuid) -> Result<bool, StoreError>;
}

/// Conflict queue and sync audit log
#[async_trait]
pub trait ConflictStore: Send + Sync + 'static {
    async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError>;

    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError>;

    /// Pending conflict already open for a record, if any
    async fn find_pending_conflict(
        &self,
        entity_type: EntityType,
        record_id: Uuid,
    ) -> Result<Option<ConflictRecord>, StoreError>;

    /// Conflicts oldest first
    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StoreError>;

    /// Take the exclusive right to resolve a pending conflict
    ///
    /// Succeeds when the conflict is pending and unclaimed, its previous
    /// claim expired before `now`, or `claimant` already holds it. Returns
    /// `Ok(None)` otherwise and [`StoreError::NotFound`] if it does not exist.
    async fn claim_conflict(
        &self,
        id: Uuid,
        claimant: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ConflictRecord>, StoreError>;

    /// Drop a claim without closing the conflict; no-op for other claimants
    async fn release_conflict_claim(&self, id: Uuid, claimant: &str) -> Result<(), StoreError>;

    /// Move a pending conflict to a terminal status
    ///
    /// Compare-and-set: returns `Ok(None)` if the conflict is no longer
    /// pending and [`StoreError::NotFound`] if it does not exist.
    async fn close_conflict(
        &self,
        id: Uuid,
        closure: &ConflictClosure,
    ) -> Result<Option<ConflictRecord>, StoreError>;

    async fn conflict_statistics(&self) -> Result<ConflictStatistics, StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;

    /// Audit entries for a conflict, oldest first
    async fn audit_log(&self, conflict_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}

/// Quarantine holding area
#[async_trait]
pub trait QuarantineStore: Send + Sync + 'static {
    async fn insert_quarantined(&self, record: &QuarantinedRecord) -> Result<(), StoreError>;

    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, StoreError>;

    /// Entries newest first
    async fn list_quarantined(
        &self,
        status: Option<QuarantineStatus>,
        limit: usize,
    ) -> Result<Vec<QuarantinedRecord>, StoreError>;

    /// Apply a review to an entry still pending review
    ///
    /// Compare-and-set with the same contract as
    /// [`ConflictStore::close_conflict`].
    async fn review_quarantined(
        &self,
        id: Uuid,
        review: &QuarantineReview,
    ) -> Result<Option<QuarantinedRecord>, StoreError>;

    async fn quarantine_counts(&self) -> Result<QuarantineCounts, StoreError>;
}

/// Per-tenant reconciliation lease and watermark
#[async_trait]
pub trait SyncStateStore: Send + Sync + 'static {
    /// Take the lease if it is free, expired, or already held by `holder`
    async fn try_acquire_lease(
        &self,
        tenant_id: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release the lease if `holder` still owns it
    async fn release_lease(&self, tenant_id: &str, holder: &str) -> Result<(), StoreError>;

    /// Current unexpired lease holder
    async fn lease_holder(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    async fn last_sync_timestamp(&self, tenant_id: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_last_sync_timestamp(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
