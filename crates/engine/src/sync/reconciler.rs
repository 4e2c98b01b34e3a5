//! Authoritative-to-replica reconciliation

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::diff::{classify, diff, Classification, DetectedConflict};
use super::entity::{EntityType, RecordParseError, SyncRecord};
use crate::clock::Clock;
use crate::conflict::ConflictRecord;
use crate::persistence::{ConflictStore, RecordStore, StoreError, SyncStateStore, UpsertOutcome};
use crate::validation::{DataValidationGate, ValidationError};

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcilerConfig {
    /// Lease and watermark row key
    pub tenant_id: String,

    /// Identifies this process in the lease row
    pub holder_id: String,

    /// A crashed run's lease frees itself after this long
    ///
    /// The lease is renewed before each entity type, so this must outlast
    /// the slowest single entity type rather than the whole run.
    #[serde(with = "crate::reliability::duration_millis")]
    pub lease_ttl: Duration,

    pub entity_types: Vec<EntityType>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            holder_id: format!("reconciler-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(300),
            entity_types: EntityType::ALL.to_vec(),
        }
    }
}

impl ReconcilerConfig {
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_holder_id(mut self, holder_id: impl Into<String>) -> Self {
        self.holder_id = holder_id.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_entity_types(mut self, entity_types: Vec<EntityType>) -> Self {
        self.entity_types = entity_types;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Aggregate result of one reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    /// Lower bound used for incremental runs
    pub since: Option<DateTime<Utc>>,
    /// Records created or updated on the replica
    pub synced_records: usize,
    /// Newly recorded conflicts (already pending ones are not counted)
    pub conflicts: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub lease_holder: Option<String>,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub pending_conflicts: u64,
    pub last_report: Option<SyncReport>,
}

/// Result of applying one inbound change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "id", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Created,
    Updated,
    Unchanged,
    /// Pending conflict id, new or already open
    Conflict(Uuid),
    /// Quarantine entry id
    Quarantined(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync already in progress for tenant {tenant_id}")]
    SyncInProgress { tenant_id: String },

    #[error("sync lease for tenant {tenant_id} was lost mid-run")]
    LeaseLost { tenant_id: String },

    #[error("invalid record: {0}")]
    InvalidRecord(#[from] RecordParseError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Keeps the replica consistent with the authoritative store
///
/// Runs are serialized per tenant through a lease row in the sync-state
/// store, so a second run anywhere in the deployment is rejected while one
/// is in flight. A run renews its lease between entity types and stops if
/// another holder took it over in the meantime.
pub struct SyncReconciler {
    authoritative: Arc<dyn RecordStore>,
    replica: Arc<dyn RecordStore>,
    conflicts: Arc<dyn ConflictStore>,
    sync_state: Arc<dyn SyncStateStore>,
    gate: Arc<DataValidationGate>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    last_report: RwLock<Option<SyncReport>>,
}

impl SyncReconciler {
    pub fn new(
        authoritative: Arc<dyn RecordStore>,
        replica: Arc<dyn RecordStore>,
        conflicts: Arc<dyn ConflictStore>,
        sync_state: Arc<dyn SyncStateStore>,
        gate: Arc<DataValidationGate>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            authoritative,
            replica,
            conflicts,
            sync_state,
            gate,
            clock,
            config,
            last_report: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile every record of every configured entity type
    pub async fn run_full(&self) -> Result<SyncReport, SyncError> {
        self.run(SyncMode::Full, None).await
    }

    /// Reconcile records updated at or after `since`
    ///
    /// Without `since` the persisted watermark is used; with neither, every
    /// record is considered.
    pub async fn run_incremental(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, SyncError> {
        let since = match since {
            Some(since) => Some(since),
            None => {
                self.sync_state
                    .last_sync_timestamp(&self.config.tenant_id)
                    .await?
            }
        };
        self.run(SyncMode::Incremental, since).await
    }

    #[instrument(skip(self), fields(tenant_id = %self.config.tenant_id))]
    async fn run(
        &self,
        mode: SyncMode,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncReport, SyncError> {
        let started_at = self.clock.now();
        // One token per run so overlapping runs in this process also collide
        let holder = format!("{}:{}", self.config.holder_id, Uuid::now_v7());
        let ttl = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let acquired = self
            .sync_state
            .try_acquire_lease(&self.config.tenant_id, &holder, ttl, started_at)
            .await?;
        if !acquired {
            warn!(%mode, "Reconciliation rejected, another run holds the lease");
            return Err(SyncError::SyncInProgress {
                tenant_id: self.config.tenant_id.clone(),
            });
        }

        let result = self.reconcile_all(since, started_at, &holder, ttl).await;

        if let Err(e) = self
            .sync_state
            .release_lease(&self.config.tenant_id, &holder)
            .await
        {
            warn!(error = %e, "Failed to release sync lease, it will expire");
        }

        let (synced_records, conflicts) = result?;

        // Watermark is the start time so changes made during the run are
        // picked up next time
        self.sync_state
            .set_last_sync_timestamp(&self.config.tenant_id, started_at)
            .await?;

        let report = SyncReport {
            mode,
            since,
            synced_records,
            conflicts,
            started_at,
            finished_at: self.clock.now(),
        };
        info!(
            %mode,
            synced_records,
            conflicts,
            "Reconciliation complete"
        );
        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    async fn reconcile_all(
        &self,
        since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        holder: &str,
        ttl: chrono::Duration,
    ) -> Result<(usize, usize), SyncError> {
        let mut synced = 0;
        let mut conflicts = 0;

        for (i, entity_type) in self.config.entity_types.iter().enumerate() {
            if i > 0 {
                self.renew_lease(holder, ttl).await?;
            }

            let report = diff(
                self.authoritative.as_ref(),
                self.replica.as_ref(),
                *entity_type,
                since,
            )
            .await?;

            for record in report.to_create.iter().chain(report.to_update.iter()) {
                self.replica.upsert(record).await?;
                synced += 1;
            }

            for detected in report.conflicts {
                if self.record_conflict(detected, now).await?.1 {
                    conflicts += 1;
                }
            }

            debug!(
                %entity_type,
                created = report.to_create.len(),
                updated = report.to_update.len(),
                unchanged = report.unchanged,
                "Reconciled entity type"
            );
        }

        Ok((synced, conflicts))
    }

    /// Push the lease expiry out from the current time
    async fn renew_lease(&self, holder: &str, ttl: chrono::Duration) -> Result<(), SyncError> {
        let renewed = self
            .sync_state
            .try_acquire_lease(&self.config.tenant_id, holder, ttl, self.clock.now())
            .await?;
        if !renewed {
            warn!("Sync lease taken over by another holder, aborting run");
            return Err(SyncError::LeaseLost {
                tenant_id: self.config.tenant_id.clone(),
            });
        }
        Ok(())
    }

    /// Persist a conflict unless one is already pending for the record
    ///
    /// Returns the pending conflict's id and whether it was newly created.
    async fn record_conflict(
        &self,
        detected: DetectedConflict,
        now: DateTime<Utc>,
    ) -> Result<(Uuid, bool), StoreError> {
        let entity_type = detected.authoritative.entity_type;
        let record_id = detected.authoritative.id;

        if let Some(existing) = self
            .conflicts
            .find_pending_conflict(entity_type, record_id)
            .await?
        {
            debug!(%record_id, conflict_id = %existing.id, "Conflict already pending");
            return Ok((existing.id, false));
        }

        let conflict = ConflictRecord::detected(
            detected.authoritative,
            detected.replica,
            detected.differing_fields,
            now,
        );
        match self.conflicts.insert_conflict(&conflict).await {
            Ok(()) => {
                info!(
                    conflict_id = %conflict.id,
                    %entity_type,
                    %record_id,
                    fields = ?conflict.differing_fields,
                    "Conflict detected"
                );
                Ok((conflict.id, true))
            }
            // Another writer recorded it between our check and insert
            Err(StoreError::AlreadyExists { .. }) => {
                let existing = self
                    .conflicts
                    .find_pending_conflict(entity_type, record_id)
                    .await?;
                Ok((existing.map(|c| c.id).unwrap_or(conflict.id), false))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %self.config.tenant_id))]
    pub async fn get_sync_status(&self) -> Result<SyncStatus, SyncError> {
        let now = self.clock.now();
        let lease_holder = self
            .sync_state
            .lease_holder(&self.config.tenant_id, now)
            .await?;
        let last_sync_timestamp = self
            .sync_state
            .last_sync_timestamp(&self.config.tenant_id)
            .await?;
        let pending_conflicts = self.conflicts.conflict_statistics().await?.pending;

        Ok(SyncStatus {
            is_syncing: lease_holder.is_some(),
            lease_holder,
            last_sync_timestamp,
            pending_conflicts,
            last_report: self.last_report.read().clone(),
        })
    }

    /// Apply one authoritative change to the replica
    ///
    /// Invalid data is quarantined instead of applied. Creation is
    /// create-or-update so a record appearing concurrently is not an error.
    #[instrument(skip(self, data))]
    pub async fn handle_incoming_change(
        &self,
        entity_type: EntityType,
        data: Value,
    ) -> Result<ChangeOutcome, SyncError> {
        let report = self.gate.validate(entity_type, &data).await;
        if !report.valid {
            let quarantine_id = self.gate.quarantine(entity_type, data, report.errors).await?;
            return Ok(ChangeOutcome::Quarantined(quarantine_id));
        }

        let now = self.clock.now();
        let record = SyncRecord::from_incoming(entity_type, data, now)?;
        let existing = self.replica.get(entity_type, record.id).await?;

        let outcome = match classify(&record, existing.as_ref()) {
            Classification::Unchanged => ChangeOutcome::Unchanged,
            Classification::Create | Classification::Update => {
                match self.replica.upsert(&record).await? {
                    UpsertOutcome::Created => ChangeOutcome::Created,
                    UpsertOutcome::Updated => ChangeOutcome::Updated,
                }
            }
            Classification::Conflict(differing_fields) => {
                let Some(replica) = existing else {
                    return Ok(ChangeOutcome::Unchanged);
                };
                let detected = DetectedConflict {
                    authoritative: record.clone(),
                    replica,
                    differing_fields,
                };
                let (conflict_id, _) = self.record_conflict(detected, now).await?;
                ChangeOutcome::Conflict(conflict_id)
            }
        };

        debug!(record_id = %record.id, ?outcome, "Applied incoming change");
        Ok(outcome)
    }

    /// Remove a record from the replica; `false` if it was already gone
    #[instrument(skip(self))]
    pub async fn handle_incoming_deletion(
        &self,
        entity_type: EntityType,
        id: Uuid,
    ) -> Result<bool, SyncError> {
        let deleted = self.replica.delete(entity_type, id).await?;
        debug!(%id, deleted, "Applied incoming deletion");
        Ok(deleted)
    }
}
