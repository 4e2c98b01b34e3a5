//! In-memory store implementations for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::conflict::{AuditEntry, ConflictClosure, ConflictRecord, ConflictStatistics, ConflictStatus};
use crate::sync::{EntityType, SyncRecord};
use crate::validation::{QuarantineCounts, QuarantineReview, QuarantineStatus, QuarantinedRecord};
use crate::workflow::{WorkflowState, WorkflowStateHistory, WorkflowSummary};

/// Versions and history of one workflow
struct WorkflowEntry {
    /// Ascending by version
    versions: Vec<WorkflowState>,
    history: Vec<WorkflowStateHistory>,
    summary: WorkflowSummary,
}

impl WorkflowEntry {
    fn current_version(&self) -> i32 {
        self.versions.last().map(|s| s.version).unwrap_or(0)
    }
}

/// Lease and watermark row for a tenant
#[derive(Default)]
struct SyncStateRow {
    lease_holder: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
}

/// Holder of a conflict's resolution claim
struct ConflictClaim {
    claimant: String,
    expires_at: DateTime<Utc>,
}

/// In-memory implementation of the state, conflict, quarantine and
/// sync-state stores
///
/// Each write holds one lock for its whole critical section, which gives
/// the same all-or-nothing behaviour as the PostgreSQL transaction.
///
/// # Example
///
/// ```
/// use carepath_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryStore {
    workflows: RwLock<HashMap<Uuid, WorkflowEntry>>,
    conflicts: RwLock<HashMap<Uuid, ConflictRecord>>,
    /// Locked after `conflicts` when both are held
    conflict_claims: RwLock<HashMap<Uuid, ConflictClaim>>,
    audit: RwLock<Vec<AuditEntry>>,
    quarantine: RwLock<HashMap<Uuid, QuarantinedRecord>>,
    sync_state: RwLock<HashMap<String, SyncStateRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            conflicts: RwLock::new(HashMap::new()),
            conflict_claims: RwLock::new(HashMap::new()),
            audit: RwLock::new(Vec::new()),
            quarantine: RwLock::new(HashMap::new()),
            sync_state: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// All stored versions of a workflow, ascending
    pub fn versions(&self, workflow_id: Uuid) -> Vec<WorkflowState> {
        self.workflows
            .read()
            .get(&workflow_id)
            .map(|e| e.versions.clone())
            .unwrap_or_default()
    }

    /// Mutate the latest stored version in place, bypassing all checks
    ///
    /// Simulates storage corruption in tests.
    pub fn tamper_latest(&self, workflow_id: Uuid, f: impl FnOnce(&mut WorkflowState)) {
        if let Some(state) = self
            .workflows
            .write()
            .get_mut(&workflow_id)
            .and_then(|e| e.versions.last_mut())
        {
            f(state);
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.conflicts.write().clear();
        self.conflict_claims.write().clear();
        self.audit.write().clear();
        self.quarantine.write().clear();
        self.sync_state.write().clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryStore {
    async fn insert_initial(&self, commit: StateCommit) -> Result<(), StoreError> {
        let workflow_id = commit.state.workflow_id;
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow_id) {
            return Err(StoreError::AlreadyExists {
                entity: "workflow",
                id: workflow_id,
            });
        }

        workflows.insert(
            workflow_id,
            WorkflowEntry {
                versions: vec![commit.state],
                history: vec![commit.history],
                summary: commit.summary,
            },
        );
        Ok(())
    }

    async fn commit_version(
        &self,
        expected_version: i32,
        commit: StateCommit,
    ) -> Result<(), StoreError> {
        let workflow_id = commit.state.workflow_id;
        let mut workflows = self.workflows.write();
        let entry = workflows.get_mut(&workflow_id).ok_or(StoreError::NotFound {
            entity: "workflow",
            id: workflow_id,
        })?;

        let actual = entry.current_version();
        if actual != expected_version || commit.state.version != expected_version + 1 {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual,
            });
        }

        entry.versions.push(commit.state);
        entry.history.push(commit.history);
        entry.summary = commit.summary;
        Ok(())
    }

    async fn latest_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(&workflow_id)
            .and_then(|e| e.versions.last().cloned()))
    }

    async fn state_at_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowState>, StoreError> {
        Ok(self.workflows.read().get(&workflow_id).and_then(|e| {
            e.versions
                .iter()
                .find(|s| s.version == version)
                .cloned()
        }))
    }

    async fn max_version(&self, workflow_id: Uuid) -> Result<Option<i32>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(&workflow_id)
            .map(|e| e.current_version()))
    }

    async fn workflow_summary(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(&workflow_id)
            .map(|e| e.summary.clone()))
    }

    async fn history(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowStateHistory>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(&workflow_id)
            .map(|e| e.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ConflictStore for InMemoryStore {
    async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        let mut conflicts = self.conflicts.write();
        if conflicts.contains_key(&conflict.id) {
            return Err(StoreError::AlreadyExists {
                entity: "conflict",
                id: conflict.id,
            });
        }
        conflicts.insert(conflict.id, conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError> {
        Ok(self.conflicts.read().get(&id).cloned())
    }

    async fn find_pending_conflict(
        &self,
        entity_type: EntityType,
        record_id: Uuid,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        Ok(self
            .conflicts
            .read()
            .values()
            .find(|c| {
                c.status == ConflictStatus::Pending
                    && c.entity_type == entity_type
                    && c.record_id == record_id
            })
            .cloned())
    }

    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let mut conflicts: Vec<ConflictRecord> = self
            .conflicts
            .read()
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| (c.detected_at, c.id));
        conflicts.truncate(limit);
        Ok(conflicts)
    }

    async fn claim_conflict(
        &self,
        id: Uuid,
        claimant: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let conflicts = self.conflicts.read();
        let conflict = conflicts.get(&id).ok_or(StoreError::NotFound {
            entity: "conflict",
            id,
        })?;
        if conflict.status != ConflictStatus::Pending {
            return Ok(None);
        }

        let mut claims = self.conflict_claims.write();
        if let Some(held) = claims.get(&id) {
            if held.claimant != claimant && held.expires_at > now {
                return Ok(None);
            }
        }
        claims.insert(
            id,
            ConflictClaim {
                claimant: claimant.to_string(),
                expires_at,
            },
        );
        Ok(Some(conflict.clone()))
    }

    async fn release_conflict_claim(&self, id: Uuid, claimant: &str) -> Result<(), StoreError> {
        let mut claims = self.conflict_claims.write();
        if claims.get(&id).is_some_and(|held| held.claimant == claimant) {
            claims.remove(&id);
        }
        Ok(())
    }

    async fn close_conflict(
        &self,
        id: Uuid,
        closure: &ConflictClosure,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "conflict",
            id,
        })?;

        if conflict.status != ConflictStatus::Pending {
            return Ok(None);
        }

        conflict.status = closure.status;
        conflict.resolution_strategy = closure.strategy;
        conflict.resolved_at = Some(closure.at);
        conflict.resolved_by = Some(closure.actor.clone());
        conflict.escalation_reason = closure.escalation_reason.clone();
        Ok(Some(conflict.clone()))
    }

    async fn conflict_statistics(&self) -> Result<ConflictStatistics, StoreError> {
        let mut stats = ConflictStatistics::default();
        for conflict in self.conflicts.read().values() {
            stats.add(
                conflict.entity_type,
                conflict.status,
                conflict.resolution_strategy,
                1,
            );
        }
        Ok(stats)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.audit.write().push(entry.clone());
        Ok(())
    }

    async fn audit_log(&self, conflict_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .audit
            .read()
            .iter()
            .filter(|e| e.conflict_id == conflict_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuarantineStore for InMemoryStore {
    async fn insert_quarantined(&self, record: &QuarantinedRecord) -> Result<(), StoreError> {
        self.quarantine.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, StoreError> {
        Ok(self.quarantine.read().get(&id).cloned())
    }

    async fn list_quarantined(
        &self,
        status: Option<QuarantineStatus>,
        limit: usize,
    ) -> Result<Vec<QuarantinedRecord>, StoreError> {
        let mut records: Vec<QuarantinedRecord> = self
            .quarantine
            .read()
            .values()
            .filter(|q| status.is_none_or(|s| q.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.quarantined_at.cmp(&a.quarantined_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn review_quarantined(
        &self,
        id: Uuid,
        review: &QuarantineReview,
    ) -> Result<Option<QuarantinedRecord>, StoreError> {
        let mut quarantine = self.quarantine.write();
        let record = quarantine.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "quarantined record",
            id,
        })?;

        if record.status != QuarantineStatus::PendingReview {
            return Ok(None);
        }

        record.status = review.status;
        record.reviewed_by = Some(review.reviewer.clone());
        record.reviewed_at = Some(review.at);
        record.review_notes = review.notes.clone();
        Ok(Some(record.clone()))
    }

    async fn quarantine_counts(&self) -> Result<QuarantineCounts, StoreError> {
        let mut counts = QuarantineCounts::default();
        for record in self.quarantine.read().values() {
            match record.status {
                QuarantineStatus::PendingReview => counts.pending_review += 1,
                QuarantineStatus::Approved => counts.approved += 1,
                QuarantineStatus::Rejected => counts.rejected += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl SyncStateStore for InMemoryStore {
    async fn try_acquire_lease(
        &self,
        tenant_id: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.sync_state.write();
        let row = rows.entry(tenant_id.to_string()).or_default();

        let free = match (&row.lease_holder, row.lease_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        };
        if !free {
            return Ok(false);
        }

        row.lease_holder = Some(holder.to_string());
        row.lease_expires_at = Some(now + ttl);
        Ok(true)
    }

    async fn release_lease(&self, tenant_id: &str, holder: &str) -> Result<(), StoreError> {
        if let Some(row) = self.sync_state.write().get_mut(tenant_id) {
            if row.lease_holder.as_deref() == Some(holder) {
                row.lease_holder = None;
                row.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn lease_holder(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.sync_state.read().get(tenant_id).and_then(|row| {
            match (&row.lease_holder, row.lease_expires_at) {
                (Some(holder), Some(expires)) if expires > now => Some(holder.clone()),
                _ => None,
            }
        }))
    }

    async fn last_sync_timestamp(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .sync_state
            .read()
            .get(tenant_id)
            .and_then(|row| row.last_sync_at))
    }

    async fn set_last_sync_timestamp(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.sync_state
            .write()
            .entry(tenant_id.to_string())
            .or_default()
            .last_sync_at = Some(at);
        Ok(())
    }
}

/// In-memory [`RecordStore`], one instance per side
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<(EntityType, Uuid), SyncRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a record directly
    pub fn put(&self, record: SyncRecord) {
        self.records
            .write()
            .insert((record.entity_type, record.id), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        let mut records: Vec<SyncRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.entity_type == entity_type)
            .filter(|r| since.is_none_or(|since| r.updated_at >= since))
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.updated_at, r.id));
        Ok(records)
    }

    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<SyncRecord>, StoreError> {
        Ok(self.records.read().get(&(entity_type, id)).cloned())
    }

    async fn upsert(&self, record: &SyncRecord) -> Result<UpsertOutcome, StoreError> {
        let previous = self
            .records
            .write()
            .insert((record.entity_type, record.id), record.clone());
        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        })
    }

    async fn delete(&self, entity_type: EntityType, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&(entity_type, id)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ClinicalState, WorkflowMetadata};
    use serde_json::json;

    fn commit(workflow_id: Uuid, version: i32) -> StateCommit {
        let now = Utc::now();
        let state = WorkflowState::new_version(
            workflow_id,
            version,
            ClinicalState::Pending,
            "assessment".to_string(),
            vec![],
            WorkflowMetadata::new(),
            "tester",
            now,
        )
        .unwrap();
        let history =
            WorkflowStateHistory::new(workflow_id, state.id, None, "created", "tester", now);
        let summary = WorkflowSummary::for_state("consultation", &state);
        StateCommit {
            state,
            history,
            summary,
        }
    }

    #[tokio::test]
    async fn test_insert_initial_twice_fails() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();

        store.insert_initial(commit(workflow_id, 1)).await.unwrap();
        let result = store.insert_initial(commit(workflow_id, 1)).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_commit_version_guard() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        store.insert_initial(commit(workflow_id, 1)).await.unwrap();

        store.commit_version(1, commit(workflow_id, 2)).await.unwrap();

        // Stale writer still believes version 1 is current
        let result = store.commit_version(1, commit(workflow_id, 2)).await;
        assert_eq!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(store.max_version(workflow_id).await.unwrap(), Some(2));
        assert_eq!(store.history(workflow_id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = InMemoryStore::new();
        let workflow_id = Uuid::now_v7();
        store.insert_initial(commit(workflow_id, 1)).await.unwrap();
        let second = commit(workflow_id, 2);
        let second_state_id = second.state.id;
        store.commit_version(1, second).await.unwrap();

        let history = store.history(workflow_id, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state_id, second_state_id);
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(60);

        assert!(store.try_acquire_lease("t1", "a", ttl, now).await.unwrap());
        assert!(!store.try_acquire_lease("t1", "b", ttl, now).await.unwrap());
        // Other tenants are independent
        assert!(store.try_acquire_lease("t2", "b", ttl, now).await.unwrap());

        let later = now + chrono::Duration::seconds(61);
        assert_eq!(store.lease_holder("t1", later).await.unwrap(), None);
        assert!(store.try_acquire_lease("t1", "b", ttl, later).await.unwrap());

        store.release_lease("t1", "a").await.unwrap();
        assert_eq!(
            store.lease_holder("t1", later).await.unwrap(),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn test_record_upsert_is_idempotent() {
        let store = InMemoryRecordStore::new();
        let record = SyncRecord::new(
            EntityType::MedicalRecord,
            Uuid::now_v7(),
            json!({"title": "X-ray"}),
            Utc::now(),
        );

        assert_eq!(store.upsert(&record).await.unwrap(), UpsertOutcome::Created);
        assert_eq!(store.upsert(&record).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.len(), 1);

        assert!(store.delete(record.entity_type, record.id).await.unwrap());
        assert!(!store.delete(record.entity_type, record.id).await.unwrap());
    }
}
