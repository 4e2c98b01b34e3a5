//! PostgreSQL store implementations
//!
//! - Version-guarded commits: `SELECT ... FOR UPDATE` on the summary row plus
//!   a `UNIQUE (workflow_id, version)` constraint
//! - Compare-and-set status changes for conflicts and quarantine entries
//! - Per-tenant sync lease as an upsert with an expiry predicate

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::conflict::{
    AuditEntry, ConflictClosure, ConflictRecord, ConflictStatistics, ConflictStatus, ConflictType,
    ResolutionStrategy,
};
use crate::sync::{EntityType, SyncRecord};
use crate::validation::{
    QuarantineCounts, QuarantineReview, QuarantineStatus, QuarantinedRecord, ValidationIssue,
};
use crate::workflow::{ClinicalState, WorkflowState, WorkflowStateHistory, WorkflowSummary};

/// PostgreSQL implementation of the state, conflict, quarantine and
/// sync-state stores
///
/// # Example
///
/// ```ignore
/// use carepath_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/carepath").await?;
/// let store = PostgresStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error("begin transaction"))
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse().map_err(StoreError::Serialization)
}

/// Insert the state and history rows of a commit
///
/// A unique violation on `(workflow_id, version)` maps to `on_duplicate`.
async fn insert_state_rows(
    tx: &mut Transaction<'static, Postgres>,
    commit: &StateCommit,
    on_duplicate: StoreError,
) -> Result<(), StoreError> {
    let state = &commit.state;
    let history = &commit.history;
    let steps = serde_json::to_value(&state.steps)?;
    let metadata = serde_json::to_value(&state.metadata)?;
    let history_metadata = serde_json::to_value(&history.metadata)?;

    sqlx::query(&format!(
        "INSERT INTO workflow_states ({STATE_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
    ))
    .bind(state.id)
    .bind(state.workflow_id)
    .bind(state.version)
    .bind(state.state.as_str())
    .bind(&state.current_step)
    .bind(&steps)
    .bind(&metadata)
    .bind(&state.created_by)
    .bind(state.created_at)
    .bind(&state.checksum)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            on_duplicate
        } else {
            db_error("insert workflow state")(e)
        }
    })?;

    sqlx::query(
        r#"
        INSERT INTO workflow_state_history
            (id, workflow_id, state_id, previous_state_id, transition, reason,
             metadata, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(history.id)
    .bind(history.workflow_id)
    .bind(history.state_id)
    .bind(history.previous_state_id)
    .bind(&history.transition)
    .bind(&history.reason)
    .bind(&history_metadata)
    .bind(&history.created_by)
    .bind(history.created_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error("insert state history"))?;

    Ok(())
}

/// Payload stored in `clinical_workflows.data` so the row reads like any
/// other synchronized record
fn summary_data(summary: &WorkflowSummary) -> serde_json::Value {
    serde_json::json!({
        "id": summary.workflow_id,
        "workflow_type": summary.workflow_type,
        "status": summary.state,
        "current_step": summary.current_step,
        "version": summary.version,
        "updated_at": summary.updated_at.to_rfc3339(),
    })
}

fn state_from_row(row: &PgRow) -> Result<WorkflowState, StoreError> {
    let state: String = row.get("state");
    let steps: serde_json::Value = row.get("steps");
    let metadata: serde_json::Value = row.get("metadata");

    Ok(WorkflowState {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        state: parse_column::<ClinicalState>(&state)?,
        current_step: row.get("current_step"),
        steps: serde_json::from_value(steps)?,
        metadata: serde_json::from_value(metadata)?,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        checksum: row.get("checksum"),
    })
}

fn conflict_from_row(row: &PgRow) -> Result<ConflictRecord, StoreError> {
    let record_id: Uuid = row.get("record_id");
    let entity_type: EntityType = parse_column(row.get::<&str, _>("entity_type"))?;
    let strategy: Option<String> = row.get("resolution_strategy");

    Ok(ConflictRecord {
        id: row.get("id"),
        record_id,
        entity_type,
        conflict_type: parse_column::<ConflictType>(row.get::<&str, _>("conflict_type"))?,
        differing_fields: row.get("differing_fields"),
        authoritative: SyncRecord {
            id: record_id,
            entity_type,
            data: row.get("authoritative_data"),
            updated_at: row.get("authoritative_updated_at"),
        },
        replica: SyncRecord {
            id: record_id,
            entity_type,
            data: row.get("replica_data"),
            updated_at: row.get("replica_updated_at"),
        },
        detected_at: row.get("detected_at"),
        status: parse_column::<ConflictStatus>(row.get::<&str, _>("status"))?,
        resolution_strategy: strategy
            .as_deref()
            .map(parse_column::<ResolutionStrategy>)
            .transpose()?,
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
        escalation_reason: row.get("escalation_reason"),
    })
}

fn quarantined_from_row(row: &PgRow) -> Result<QuarantinedRecord, StoreError> {
    let errors: serde_json::Value = row.get("validation_errors");
    Ok(QuarantinedRecord {
        id: row.get("id"),
        record_id: row.get("record_id"),
        entity_type: parse_column(row.get::<&str, _>("entity_type"))?,
        data: row.get("data"),
        validation_errors: serde_json::from_value::<Vec<ValidationIssue>>(errors)?,
        quarantined_at: row.get("quarantined_at"),
        status: parse_column::<QuarantineStatus>(row.get::<&str, _>("status"))?,
        reviewed_by: row.get("reviewed_by"),
        reviewed_at: row.get("reviewed_at"),
        review_notes: row.get("review_notes"),
    })
}

const CONFLICT_COLUMNS: &str = "id, record_id, entity_type, conflict_type, differing_fields, \
     authoritative_data, authoritative_updated_at, replica_data, replica_updated_at, \
     detected_at, status, resolution_strategy, resolved_at, resolved_by, escalation_reason";

const QUARANTINE_COLUMNS: &str = "id, record_id, entity_type, data, validation_errors, \
     quarantined_at, status, reviewed_by, reviewed_at, review_notes";

const STATE_COLUMNS: &str = "id, workflow_id, version, state, current_step, steps, metadata, \
     created_by, created_at, checksum";

#[async_trait]
impl WorkflowStateStore for PostgresStore {
    #[instrument(skip(self, commit), fields(workflow_id = %commit.state.workflow_id))]
    async fn insert_initial(&self, commit: StateCommit) -> Result<(), StoreError> {
        let workflow_id = commit.state.workflow_id;
        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO clinical_workflows
                (id, workflow_type, status, current_step, version, data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(&commit.summary.workflow_type)
        .bind(commit.summary.state.as_str())
        .bind(&commit.summary.current_step)
        .bind(commit.summary.version)
        .bind(summary_data(&commit.summary))
        .bind(commit.summary.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("insert workflow summary"))?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                entity: "workflow",
                id: workflow_id,
            });
        }

        insert_state_rows(
            &mut tx,
            &commit,
            StoreError::AlreadyExists {
                entity: "workflow",
                id: workflow_id,
            },
        )
        .await?;

        tx.commit().await.map_err(db_error("commit initial state"))?;

        debug!(%workflow_id, "created workflow state");
        Ok(())
    }

    #[instrument(skip(self, commit), fields(workflow_id = %commit.state.workflow_id))]
    async fn commit_version(
        &self,
        expected_version: i32,
        commit: StateCommit,
    ) -> Result<(), StoreError> {
        let workflow_id = commit.state.workflow_id;
        let mut tx = self.begin().await?;

        // Lock the summary row so concurrent writers serialize here
        let row = sqlx::query(
            r#"
            SELECT version FROM clinical_workflows WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock workflow summary"))?
        .ok_or(StoreError::NotFound {
            entity: "workflow",
            id: workflow_id,
        })?;

        let actual: i32 = row.get::<Option<i32>, _>("version").unwrap_or(0);
        if actual != expected_version || commit.state.version != expected_version + 1 {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual,
            });
        }

        insert_state_rows(
            &mut tx,
            &commit,
            StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual: commit.state.version,
            },
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE clinical_workflows
            SET status = $2, current_step = $3, version = $4, data = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(commit.summary.state.as_str())
        .bind(&commit.summary.current_step)
        .bind(commit.summary.version)
        .bind(summary_data(&commit.summary))
        .bind(commit.summary.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("update workflow summary"))?;

        tx.commit().await.map_err(db_error("commit state version"))?;

        debug!(%workflow_id, version = commit.state.version, "committed state version");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM workflow_states \
             WHERE workflow_id = $1 ORDER BY version DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load latest state"))?;

        row.as_ref().map(state_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn state_at_version(
        &self,
        workflow_id: Uuid,
        version: i32,
    ) -> Result<Option<WorkflowState>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM workflow_states WHERE workflow_id = $1 AND version = $2"
        ))
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load state version"))?;

        row.as_ref().map(state_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn max_version(&self, workflow_id: Uuid) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(version) AS max_version FROM workflow_states WHERE workflow_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("load max version"))?;

        Ok(row.get("max_version"))
    }

    #[instrument(skip(self))]
    async fn workflow_summary(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, status, current_step, version, updated_at
            FROM clinical_workflows
            WHERE id = $1 AND workflow_type IS NOT NULL
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load workflow summary"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: Option<String> = row.get("status");
        Ok(Some(WorkflowSummary {
            workflow_id: row.get("id"),
            workflow_type: row.get::<Option<String>, _>("workflow_type").unwrap_or_default(),
            state: parse_column(status.as_deref().unwrap_or_default())?,
            current_step: row.get::<Option<String>, _>("current_step").unwrap_or_default(),
            version: row.get::<Option<i32>, _>("version").unwrap_or(0),
            updated_at: row.get("updated_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn history(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowStateHistory>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT h.id, h.workflow_id, h.state_id, h.previous_state_id, h.transition,
                   h.reason, h.metadata, h.created_by, h.created_at
            FROM workflow_state_history h
            JOIN workflow_states s ON s.id = h.state_id
            WHERE h.workflow_id = $1
            ORDER BY s.version DESC
            LIMIT $2
            "#,
        )
        .bind(workflow_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load history"))?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            let metadata: serde_json::Value = row.get("metadata");
            history.push(WorkflowStateHistory {
                id: row.get("id"),
                workflow_id: row.get("workflow_id"),
                state_id: row.get("state_id"),
                previous_state_id: row.get("previous_state_id"),
                transition: row.get("transition"),
                reason: row.get("reason"),
                metadata: serde_json::from_value(metadata)?,
                created_by: row.get("created_by"),
                created_at: row.get("created_at"),
            });
        }
        Ok(history)
    }
}

#[async_trait]
impl ConflictStore for PostgresStore {
    #[instrument(skip(self, conflict), fields(conflict_id = %conflict.id))]
    async fn insert_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(conflict.id)
        .bind(conflict.record_id)
        .bind(conflict.entity_type.as_str())
        .bind(conflict.conflict_type.as_str())
        .bind(&conflict.differing_fields)
        .bind(&conflict.authoritative.data)
        .bind(conflict.authoritative.updated_at)
        .bind(&conflict.replica.data)
        .bind(conflict.replica.updated_at)
        .bind(conflict.detected_at)
        .bind(conflict.status.as_str())
        .bind(conflict.resolution_strategy.map(|s| s.as_str()))
        .bind(conflict.resolved_at)
        .bind(&conflict.resolved_by)
        .bind(&conflict.escalation_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists {
                    entity: "conflict",
                    id: conflict.record_id,
                }
            } else {
                db_error("insert conflict")(e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_conflict(&self, id: Uuid) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load conflict"))?;

        row.as_ref().map(conflict_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_pending_conflict(
        &self,
        entity_type: EntityType,
        record_id: Uuid,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts \
             WHERE entity_type = $1 AND record_id = $2 AND status = 'pending'"
        ))
        .bind(entity_type.as_str())
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find pending conflict"))?;

        row.as_ref().map(conflict_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: usize,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY detected_at, id LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list conflicts"))?;

        rows.iter().map(conflict_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_conflict(
        &self,
        id: Uuid,
        claimant: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE sync_conflicts \
             SET claimed_by = $2, claim_expires_at = $3 \
             WHERE id = $1 AND status = 'pending' \
               AND (claimed_by IS NULL OR claimed_by = $2 OR claim_expires_at <= $4) \
             RETURNING {CONFLICT_COLUMNS}"
        ))
        .bind(id)
        .bind(claimant)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("claim conflict"))?;

        match row {
            Some(row) => conflict_from_row(&row).map(Some),
            None => match self.get_conflict(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound {
                    entity: "conflict",
                    id,
                }),
            },
        }
    }

    #[instrument(skip(self))]
    async fn release_conflict_claim(&self, id: Uuid, claimant: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_conflicts SET claimed_by = NULL, claim_expires_at = NULL \
             WHERE id = $1 AND claimed_by = $2",
        )
        .bind(id)
        .bind(claimant)
        .execute(&self.pool)
        .await
        .map_err(db_error("release conflict claim"))?;
        Ok(())
    }

    #[instrument(skip(self, closure))]
    async fn close_conflict(
        &self,
        id: Uuid,
        closure: &ConflictClosure,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE sync_conflicts \
             SET status = $2, resolution_strategy = $3, resolved_at = $4, resolved_by = $5, \
                 escalation_reason = $6, claimed_by = NULL, claim_expires_at = NULL \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {CONFLICT_COLUMNS}"
        ))
        .bind(id)
        .bind(closure.status.as_str())
        .bind(closure.strategy.map(|s| s.as_str()))
        .bind(closure.at)
        .bind(&closure.actor)
        .bind(&closure.escalation_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("close conflict"))?;

        match row {
            Some(row) => conflict_from_row(&row).map(Some),
            None => match self.get_conflict(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound {
                    entity: "conflict",
                    id,
                }),
            },
        }
    }

    #[instrument(skip(self))]
    async fn conflict_statistics(&self) -> Result<ConflictStatistics, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, status, resolution_strategy, COUNT(*) AS count
            FROM sync_conflicts
            GROUP BY entity_type, status, resolution_strategy
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load conflict statistics"))?;

        let mut stats = ConflictStatistics::default();
        for row in rows {
            let strategy: Option<String> = row.get("resolution_strategy");
            stats.add(
                parse_column(row.get::<&str, _>("entity_type"))?,
                parse_column(row.get::<&str, _>("status"))?,
                strategy.as_deref().map(parse_column).transpose()?,
                row.get::<i64, _>("count") as u64,
            );
        }
        Ok(stats)
    }

    #[instrument(skip(self, entry), fields(conflict_id = %entry.conflict_id))]
    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_audit_log
                (id, conflict_id, action, strategy, actor, before_data, after_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.conflict_id)
        .bind(&entry.action)
        .bind(entry.strategy.map(|s| s.as_str()))
        .bind(&entry.actor)
        .bind(&entry.before)
        .bind(&entry.after)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("append audit entry"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn audit_log(&self, conflict_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, conflict_id, action, strategy, actor, before_data, after_data, created_at
            FROM sync_audit_log
            WHERE conflict_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(conflict_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load audit log"))?;

        rows.iter()
            .map(|row| {
                let strategy: Option<String> = row.get("strategy");
                Ok(AuditEntry {
                    id: row.get("id"),
                    conflict_id: row.get("conflict_id"),
                    action: row.get("action"),
                    strategy: strategy.as_deref().map(parse_column).transpose()?,
                    actor: row.get("actor"),
                    before: row.get("before_data"),
                    after: row.get("after_data"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl QuarantineStore for PostgresStore {
    #[instrument(skip(self, record), fields(quarantine_id = %record.id))]
    async fn insert_quarantined(&self, record: &QuarantinedRecord) -> Result<(), StoreError> {
        let errors = serde_json::to_value(&record.validation_errors)?;
        sqlx::query(&format!(
            "INSERT INTO data_quarantine ({QUARANTINE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(record.id)
        .bind(record.record_id)
        .bind(record.entity_type.as_str())
        .bind(&record.data)
        .bind(&errors)
        .bind(record.quarantined_at)
        .bind(record.status.as_str())
        .bind(&record.reviewed_by)
        .bind(record.reviewed_at)
        .bind(&record.review_notes)
        .execute(&self.pool)
        .await
        .map_err(db_error("insert quarantined record"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_quarantined(&self, id: Uuid) -> Result<Option<QuarantinedRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM data_quarantine WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load quarantined record"))?;

        row.as_ref().map(quarantined_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_quarantined(
        &self,
        status: Option<QuarantineStatus>,
        limit: usize,
    ) -> Result<Vec<QuarantinedRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM data_quarantine \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY quarantined_at DESC, id DESC LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list quarantined records"))?;

        rows.iter().map(quarantined_from_row).collect()
    }

    #[instrument(skip(self, review))]
    async fn review_quarantined(
        &self,
        id: Uuid,
        review: &QuarantineReview,
    ) -> Result<Option<QuarantinedRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE data_quarantine \
             SET status = $2, reviewed_by = $3, reviewed_at = $4, review_notes = $5 \
             WHERE id = $1 AND status = 'pending_review' \
             RETURNING {QUARANTINE_COLUMNS}"
        ))
        .bind(id)
        .bind(review.status.as_str())
        .bind(&review.reviewer)
        .bind(review.at)
        .bind(&review.notes)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("review quarantined record"))?;

        match row {
            Some(row) => quarantined_from_row(&row).map(Some),
            None => match self.get_quarantined(id).await? {
                Some(_) => Ok(None),
                None => Err(StoreError::NotFound {
                    entity: "quarantined record",
                    id,
                }),
            },
        }
    }

    #[instrument(skip(self))]
    async fn quarantine_counts(&self) -> Result<QuarantineCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM data_quarantine GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("count quarantined records"))?;

        let mut counts = QuarantineCounts::default();
        for row in rows {
            let count = row.get::<i64, _>("count") as u64;
            match parse_column::<QuarantineStatus>(row.get::<&str, _>("status"))? {
                QuarantineStatus::PendingReview => counts.pending_review = count,
                QuarantineStatus::Approved => counts.approved = count,
                QuarantineStatus::Rejected => counts.rejected = count,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl SyncStateStore for PostgresStore {
    #[instrument(skip(self))]
    async fn try_acquire_lease(
        &self,
        tenant_id: &str,
        holder: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sync_state (tenant_id, lease_holder, lease_expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO UPDATE SET
                lease_holder = EXCLUDED.lease_holder,
                lease_expires_at = EXCLUDED.lease_expires_at
            WHERE sync_state.lease_holder IS NULL
               OR sync_state.lease_holder = EXCLUDED.lease_holder
               OR sync_state.lease_expires_at IS NULL
               OR sync_state.lease_expires_at <= $4
            RETURNING tenant_id
            "#,
        )
        .bind(tenant_id)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("acquire sync lease"))?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, tenant_id: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_state
            SET lease_holder = NULL, lease_expires_at = NULL
            WHERE tenant_id = $1 AND lease_holder = $2
            "#,
        )
        .bind(tenant_id)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(db_error("release sync lease"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn lease_holder(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT lease_holder FROM sync_state
            WHERE tenant_id = $1 AND lease_expires_at > $2
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load sync lease"))?;

        Ok(row.and_then(|r| r.get("lease_holder")))
    }

    #[instrument(skip(self))]
    async fn last_sync_timestamp(
        &self,
        tenant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_sync_at FROM sync_state WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load sync watermark"))?;

        Ok(row.and_then(|r| r.get("last_sync_at")))
    }

    #[instrument(skip(self))]
    async fn set_last_sync_timestamp(
        &self,
        tenant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (tenant_id, last_sync_at)
            VALUES ($1, $2)
            ON CONFLICT (tenant_id) DO UPDATE SET last_sync_at = EXCLUDED.last_sync_at
            "#,
        )
        .bind(tenant_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("store sync watermark"))?;

        Ok(())
    }
}

/// PostgreSQL [`RecordStore`] over the `(id, data, updated_at)` domain tables
///
/// One instance per side; the authoritative and replica stores usually
/// point at different databases.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(entity_type: EntityType, row: &PgRow) -> SyncRecord {
    SyncRecord {
        id: row.get("id"),
        entity_type,
        data: row.get("data"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self))]
    async fn list(
        &self,
        entity_type: EntityType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT id, data, updated_at FROM {} \
             WHERE ($1::timestamptz IS NULL OR updated_at >= $1) \
             ORDER BY updated_at, id",
            entity_type.table_name()
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list records"))?;

        Ok(rows
            .iter()
            .map(|row| record_from_row(entity_type, row))
            .collect())
    }

    #[instrument(skip(self))]
    async fn get(&self, entity_type: EntityType, id: Uuid) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT id, data, updated_at FROM {} WHERE id = $1",
            entity_type.table_name()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("load record"))?;

        Ok(row.map(|row| record_from_row(entity_type, &row)))
    }

    #[instrument(skip(self, record), fields(entity_type = %record.entity_type, record_id = %record.id))]
    async fn upsert(&self, record: &SyncRecord) -> Result<UpsertOutcome, StoreError> {
        // xmax is zero only for freshly inserted tuples
        let row = sqlx::query(&format!(
            "INSERT INTO {} (id, data, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at \
             RETURNING (xmax = 0) AS inserted",
            record.entity_type.table_name()
        ))
        .bind(record.id)
        .bind(&record.data)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("upsert record"))?;

        Ok(if row.get::<bool, _>("inserted") {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, entity_type: EntityType, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            entity_type.table_name()
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_error("delete record"))?;

        Ok(result.rows_affected() > 0)
    }
}
