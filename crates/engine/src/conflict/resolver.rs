//! Conflict resolution strategies and the auto-resolve sweep

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::merge::merge_records;
use super::types::{
    AuditEntry, ConflictClosure, ConflictRecord, ConflictStatistics, ConflictStatus,
    ResolutionStrategy,
};
use crate::bus::{event_types, topics, BusMessage, EventBus};
use crate::clock::Clock;
use crate::persistence::{ConflictStore, RecordStore, StoreError};
use crate::sync::{RecordParseError, SyncRecord};
use crate::validation::{DataValidationGate, ValidationIssue};

/// What `replica_wins` does to the authoritative store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaWinsPolicy {
    /// Leave both stores as they are
    #[default]
    KeepReplica,
    /// Copy the replica record over the authoritative one
    WriteBackToAuthoritative,
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolverConfig {
    pub replica_wins_policy: ReplicaWinsPolicy,

    /// Auto-resolve merges when the two sides' timestamps are this close
    #[serde(with = "crate::reliability::duration_millis")]
    pub merge_window: Duration,

    /// Pending conflicts taken per auto-resolve sweep
    pub auto_resolve_batch: usize,

    /// Actor recorded for automatic resolutions
    pub system_actor: String,

    /// A resolver that crashed mid-resolution frees its claim after this long
    #[serde(with = "crate::reliability::duration_millis")]
    pub claim_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            replica_wins_policy: ReplicaWinsPolicy::KeepReplica,
            merge_window: Duration::from_secs(5 * 60),
            auto_resolve_batch: 500,
            system_actor: "auto-resolver".to_string(),
            claim_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl ResolverConfig {
    pub fn with_replica_wins_policy(mut self, policy: ReplicaWinsPolicy) -> Self {
        self.replica_wins_policy = policy;
        self
    }

    pub fn with_merge_window(mut self, window: Duration) -> Self {
        self.merge_window = window;
        self
    }

    pub fn with_auto_resolve_batch(mut self, batch: usize) -> Self {
        self.auto_resolve_batch = batch.max(1);
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub strategy: ResolutionStrategy,
    /// Required for `manual`
    pub manual_data: Option<Value>,
    pub resolved_by: String,
}

impl ResolutionRequest {
    pub fn new(strategy: ResolutionStrategy, resolved_by: impl Into<String>) -> Self {
        Self {
            strategy,
            manual_data: None,
            resolved_by: resolved_by.into(),
        }
    }

    pub fn manual(data: Value, resolved_by: impl Into<String>) -> Self {
        Self {
            strategy: ResolutionStrategy::Manual,
            manual_data: Some(data),
            resolved_by: resolved_by.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub conflict: ConflictRecord,
    /// Record both sides should now hold (the replica's, under `keep_replica`)
    pub resolved_record: SyncRecord,
    pub replica_written: bool,
    pub authoritative_written: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoResolveReport {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Closed or claimed by someone else during the sweep
    pub skipped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("conflict not found: {0}")]
    NotFound(Uuid),

    #[error("conflict {id} is already {status}")]
    ConflictAlreadyResolved { id: Uuid, status: ConflictStatus },

    #[error("conflict {0} is being resolved by another caller")]
    ResolutionInProgress(Uuid),

    #[error("resolution data failed validation ({} error(s))", .0.len())]
    ValidationFailed(Vec<ValidationIssue>),

    #[error("manual resolution of conflict {0} requires data")]
    MissingManualData(Uuid),

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordParseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Applies resolution strategies to pending conflicts
///
/// A resolution first claims the conflict; only the claim holder writes
/// records, and it closes the conflict afterwards. A failure before the
/// close releases the claim and leaves the conflict pending. Record writes
/// are idempotent upserts, so the conflict is safe to resolve again.
pub struct ConflictResolver {
    conflicts: Arc<dyn ConflictStore>,
    authoritative: Arc<dyn RecordStore>,
    replica: Arc<dyn RecordStore>,
    gate: Arc<DataValidationGate>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
}

impl ConflictResolver {
    pub fn new(
        conflicts: Arc<dyn ConflictStore>,
        authoritative: Arc<dyn RecordStore>,
        replica: Arc<dyn RecordStore>,
        gate: Arc<DataValidationGate>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            conflicts,
            authoritative,
            replica,
            gate,
            bus,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    #[instrument(skip(self, request), fields(strategy = %request.strategy, resolved_by = %request.resolved_by))]
    pub async fn resolve(
        &self,
        conflict_id: Uuid,
        request: ResolutionRequest,
    ) -> Result<ResolutionResult, ConflictError> {
        let claimant = claim_token(&request.resolved_by);
        let conflict = self.claim(conflict_id, &claimant).await?;

        match self.apply_resolution(&conflict, &request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.release(conflict_id, &claimant).await;
                Err(e)
            }
        }
    }

    /// Write the resolved record and close the claimed conflict
    async fn apply_resolution(
        &self,
        conflict: &ConflictRecord,
        request: &ResolutionRequest,
    ) -> Result<ResolutionResult, ConflictError> {
        let conflict_id = conflict.id;
        let entity_type = conflict.entity_type;
        let now = self.clock.now();

        // Resolve against what the replica holds now, not the snapshot
        let current_replica = self
            .replica
            .get(entity_type, conflict.record_id)
            .await?
            .unwrap_or_else(|| conflict.replica.clone());

        let (resolved, write_replica, write_authoritative) = match request.strategy {
            ResolutionStrategy::AuthoritativeWins => (
                overlay_authoritative(&current_replica, &conflict.authoritative),
                true,
                false,
            ),
            ResolutionStrategy::ReplicaWins => (
                current_replica.clone(),
                false,
                self.config.replica_wins_policy == ReplicaWinsPolicy::WriteBackToAuthoritative,
            ),
            ResolutionStrategy::Merge => {
                let merged =
                    merge_records(entity_type, &conflict.authoritative.data, &current_replica.data);
                (SyncRecord::from_incoming(entity_type, merged, now)?, true, true)
            }
            ResolutionStrategy::Manual => {
                let data = request
                    .manual_data
                    .clone()
                    .ok_or(ConflictError::MissingManualData(conflict_id))?;
                let record = SyncRecord::new(entity_type, conflict.record_id, data, now);
                let report = self.gate.validate(entity_type, &record.data).await;
                if !report.valid {
                    return Err(ConflictError::ValidationFailed(report.errors));
                }
                (record, true, true)
            }
        };

        if write_replica {
            self.replica.upsert(&resolved).await?;
        }
        if write_authoritative {
            self.authoritative.upsert(&resolved).await?;
        }

        let closure = ConflictClosure {
            status: ConflictStatus::Resolved,
            strategy: Some(request.strategy),
            actor: request.resolved_by.clone(),
            at: now,
            escalation_reason: None,
        };
        let closed = self.close(conflict_id, &closure).await?;

        self.audit(
            &closed,
            "resolved",
            Some(request.strategy),
            &request.resolved_by,
            json!({
                "authoritative": conflict.authoritative.data,
                "replica": current_replica.data,
            }),
            resolved.data.clone(),
        )
        .await;

        self.publish(
            topics::SYNC_RESULTS,
            event_types::CONFLICT_RESOLVED,
            json!({
                "conflict_id": conflict_id,
                "record_id": closed.record_id,
                "entity_type": entity_type,
                "strategy": request.strategy,
                "resolved_by": request.resolved_by,
            }),
        )
        .await;

        info!(%conflict_id, record_id = %closed.record_id, "Conflict resolved");
        Ok(ResolutionResult {
            conflict: closed,
            resolved_record: resolved,
            replica_written: write_replica,
            authoritative_written: write_authoritative,
        })
    }

    /// Hand a conflict to operators instead of resolving it
    #[instrument(skip(self, reason))]
    pub async fn escalate(
        &self,
        conflict_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<ConflictRecord, ConflictError> {
        let claimant = claim_token(actor);
        self.claim(conflict_id, &claimant).await?;

        let closure = ConflictClosure {
            status: ConflictStatus::Escalated,
            strategy: None,
            actor: actor.to_string(),
            at: self.clock.now(),
            escalation_reason: Some(reason.to_string()),
        };
        let escalated = match self.close(conflict_id, &closure).await {
            Ok(escalated) => escalated,
            Err(e) => {
                self.release(conflict_id, &claimant).await;
                return Err(e);
            }
        };

        self.audit(
            &escalated,
            "escalated",
            None,
            actor,
            json!({"status": ConflictStatus::Pending}),
            json!({"status": ConflictStatus::Escalated, "reason": reason}),
        )
        .await;

        self.publish(
            topics::SYNC_ALERTS,
            event_types::CONFLICT_ESCALATED,
            json!({
                "conflict_id": conflict_id,
                "record_id": escalated.record_id,
                "entity_type": escalated.entity_type,
                "differing_fields": escalated.differing_fields,
                "reason": reason,
                "escalated_by": actor,
            }),
        )
        .await;

        warn!(%conflict_id, reason, "Conflict escalated");
        Ok(escalated)
    }

    /// Oldest first
    pub async fn get_pending_conflicts(
        &self,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, ConflictError> {
        Ok(self
            .conflicts
            .list_conflicts(Some(ConflictStatus::Pending), limit)
            .await?)
    }

    pub async fn get_conflict_statistics(&self) -> Result<ConflictStatistics, ConflictError> {
        Ok(self.conflicts.conflict_statistics().await?)
    }

    pub async fn get_audit_log(&self, conflict_id: Uuid) -> Result<Vec<AuditEntry>, ConflictError> {
        Ok(self.conflicts.audit_log(conflict_id).await?)
    }

    /// Resolve one batch of pending conflicts
    ///
    /// Merges when the sides were updated within `merge_window` of each
    /// other, otherwise the authoritative side wins. A failed conflict is
    /// counted and the sweep moves on.
    #[instrument(skip(self))]
    pub async fn auto_resolve(&self) -> Result<AutoResolveReport, ConflictError> {
        let pending = self
            .get_pending_conflicts(self.config.auto_resolve_batch)
            .await?;
        let window = chrono::Duration::from_std(self.config.merge_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let mut report = AutoResolveReport {
            attempted: pending.len(),
            ..Default::default()
        };

        for conflict in pending {
            let strategy = if conflict.timestamp_gap() <= window {
                ResolutionStrategy::Merge
            } else {
                ResolutionStrategy::AuthoritativeWins
            };
            let request = ResolutionRequest::new(strategy, self.config.system_actor.clone());

            match self.resolve(conflict.id, request).await {
                Ok(_) => report.resolved += 1,
                Err(
                    ConflictError::ConflictAlreadyResolved { .. }
                    | ConflictError::ResolutionInProgress(_),
                ) => report.skipped += 1,
                Err(e) => {
                    warn!(conflict_id = %conflict.id, %strategy, error = %e, "Auto-resolve failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            attempted = report.attempted,
            resolved = report.resolved,
            failed = report.failed,
            skipped = report.skipped,
            "Auto-resolve sweep finished"
        );
        Ok(report)
    }

    /// Exclusive claim on a pending conflict; no record is touched before it
    async fn claim(
        &self,
        conflict_id: Uuid,
        claimant: &str,
    ) -> Result<ConflictRecord, ConflictError> {
        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(self.config.claim_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));

        match self
            .conflicts
            .claim_conflict(conflict_id, claimant, expires_at, now)
            .await
        {
            Ok(Some(conflict)) => Ok(conflict),
            Ok(None) => {
                let status = self
                    .conflicts
                    .get_conflict(conflict_id)
                    .await?
                    .map(|c| c.status)
                    .ok_or(ConflictError::NotFound(conflict_id))?;
                debug!(%conflict_id, %status, "Conflict claimed elsewhere");
                if status == ConflictStatus::Pending {
                    Err(ConflictError::ResolutionInProgress(conflict_id))
                } else {
                    Err(ConflictError::ConflictAlreadyResolved {
                        id: conflict_id,
                        status,
                    })
                }
            }
            Err(StoreError::NotFound { .. }) => Err(ConflictError::NotFound(conflict_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, conflict_id: Uuid, claimant: &str) {
        if let Err(e) = self
            .conflicts
            .release_conflict_claim(conflict_id, claimant)
            .await
        {
            warn!(%conflict_id, error = %e, "Failed to release conflict claim");
        }
    }

    /// Compare-and-set from `pending`
    async fn close(
        &self,
        conflict_id: Uuid,
        closure: &ConflictClosure,
    ) -> Result<ConflictRecord, ConflictError> {
        match self.conflicts.close_conflict(conflict_id, closure).await {
            Ok(Some(closed)) => Ok(closed),
            Ok(None) => {
                let status = self
                    .conflicts
                    .get_conflict(conflict_id)
                    .await?
                    .map(|c| c.status)
                    .ok_or(ConflictError::NotFound(conflict_id))?;
                debug!(%conflict_id, %status, "Lost race closing conflict");
                Err(ConflictError::ConflictAlreadyResolved {
                    id: conflict_id,
                    status,
                })
            }
            Err(StoreError::NotFound { .. }) => Err(ConflictError::NotFound(conflict_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn audit(
        &self,
        conflict: &ConflictRecord,
        action: &str,
        strategy: Option<ResolutionStrategy>,
        actor: &str,
        before: Value,
        after: Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::now_v7(),
            conflict_id: conflict.id,
            action: action.to_string(),
            strategy,
            actor: actor.to_string(),
            before,
            after,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.conflicts.append_audit(&entry).await {
            error!(conflict_id = %conflict.id, action, error = %e, "Failed to write sync audit entry");
        }
    }

    async fn publish(&self, topic: &str, event_type: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish(topic, BusMessage::new(event_type, payload))
            .await
        {
            warn!(topic, error = %e, "Failed to publish conflict event");
        }
    }
}

/// Unique per call, so two resolutions by the same actor still exclude each other
fn claim_token(actor: &str) -> String {
    format!("{actor}:{}", Uuid::now_v7())
}

/// Replica record with the authoritative material fields and timestamp
fn overlay_authoritative(replica: &SyncRecord, authoritative: &SyncRecord) -> SyncRecord {
    let mut data = replica.data.clone();
    match (data.as_object_mut(), authoritative.data.as_object()) {
        (Some(target), Some(source)) => {
            for field in authoritative.entity_type.material_fields() {
                match source.get(*field) {
                    Some(value) => {
                        target.insert(field.to_string(), value.clone());
                    }
                    None => {
                        target.remove(*field);
                    }
                }
            }
        }
        _ => data = authoritative.data.clone(),
    }
    SyncRecord::new(
        authoritative.entity_type,
        authoritative.id,
        data,
        authoritative.updated_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::EntityType;
    use chrono::Utc;

    #[test]
    fn test_overlay_keeps_replica_only_fields() {
        let id = Uuid::now_v7();
        let t0 = Utc::now();
        let auth = SyncRecord::new(
            EntityType::Consultation,
            id,
            json!({"status": "completed", "plan": "discharge", "room": "1"}),
            t0 + chrono::Duration::minutes(10),
        );
        let replica = SyncRecord::new(
            EntityType::Consultation,
            id,
            json!({"status": "in-progress", "diagnosis": "flu", "room": "2"}),
            t0,
        );

        let resolved = overlay_authoritative(&replica, &auth);
        assert_eq!(resolved.field("status"), Some(&json!("completed")));
        assert_eq!(resolved.field("plan"), Some(&json!("discharge")));
        assert_eq!(resolved.field("diagnosis"), None);
        assert_eq!(resolved.field("room"), Some(&json!("2")));
        assert_eq!(resolved.updated_at, auth.updated_at);
    }
}
