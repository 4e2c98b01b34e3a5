//! Validation gate and quarantine workflow

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::references::{check_references, ReferenceDirectory};
use super::report::{
    QuarantineCounts, QuarantineReview, QuarantineStatus, QuarantinedRecord, ValidationIssue,
    ValidationReport,
};
use super::{privacy, rules};
use crate::bus::{event_types, topics, BusMessage, EventBus};
use crate::clock::Clock;
use crate::persistence::{QuarantineStore, RecordStore, StoreError, UpsertOutcome};
use crate::sync::{EntityType, SyncRecord};

/// Errors from quarantine operations
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("quarantined record not found: {0}")]
    NotFound(Uuid),

    /// Re-validation on approval still fails
    #[error("record is still invalid ({} error(s))", .0.len())]
    StillInvalid(Vec<ValidationIssue>),

    #[error("quarantined record {id} was already reviewed ({status})")]
    AlreadyReviewed { id: Uuid, status: QuarantineStatus },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one record in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Applied { record_id: Uuid, created: bool },
    Quarantined { quarantine_id: Uuid, errors: Vec<ValidationIssue> },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub index: usize,
    pub warnings: Vec<ValidationIssue>,
    pub outcome: BatchItemOutcome,
}

/// Per-record results of [`DataValidationGate::validate_batch`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub applied: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

/// Gate counters plus quarantine totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQualityMetrics {
    pub records_validated: u64,
    pub records_valid: u64,
    pub records_invalid: u64,
    pub warnings_raised: u64,
    /// `records_valid / records_validated`, 1.0 before any validation
    pub validity_rate: f64,
    pub quarantine: QuarantineCounts,
}

#[derive(Default)]
struct GateCounters {
    validated: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    warnings: AtomicU64,
}

/// Guards entry into the system of record
///
/// Valid records are upserted into `records`; invalid ones are held in
/// quarantine until a reviewer approves or rejects them.
pub struct DataValidationGate {
    references: Arc<dyn ReferenceDirectory>,
    quarantine: Arc<dyn QuarantineStore>,
    records: Arc<dyn RecordStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    counters: GateCounters,
}

impl DataValidationGate {
    pub fn new(
        references: Arc<dyn ReferenceDirectory>,
        quarantine: Arc<dyn QuarantineStore>,
        records: Arc<dyn RecordStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            references,
            quarantine,
            records,
            bus,
            clock,
            counters: GateCounters::default(),
        }
    }

    /// Run required, domain, referential and privacy checks in that order
    #[instrument(skip(self, data))]
    pub async fn validate(&self, entity_type: EntityType, data: &Value) -> ValidationReport {
        let report = match data.as_object() {
            None => ValidationReport::from_issues(
                vec![ValidationIssue::new(
                    "$",
                    "invalid_type",
                    "record must be a JSON object",
                )],
                vec![],
            ),
            Some(object) => {
                let mut errors = rules::check_required(entity_type, object);
                errors.extend(rules::check_domain(entity_type, object));
                errors.extend(check_references(self.references.as_ref(), object).await);
                ValidationReport::from_issues(errors, privacy::scan(data))
            }
        };

        self.counters.validated.fetch_add(1, Ordering::Relaxed);
        if report.valid {
            self.counters.valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .warnings
            .fetch_add(report.warnings.len() as u64, Ordering::Relaxed);

        report
    }

    /// Validate each record, apply the valid ones and quarantine the rest
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn validate_batch(&self, entity_type: EntityType, records: Vec<Value>) -> BatchReport {
        let mut batch = BatchReport::default();

        for (index, data) in records.into_iter().enumerate() {
            let report = self.validate(entity_type, &data).await;
            let outcome = if report.valid {
                match self.apply(entity_type, data).await {
                    Ok((record_id, upsert)) => BatchItemOutcome::Applied {
                        record_id,
                        created: upsert == UpsertOutcome::Created,
                    },
                    Err(e) => BatchItemOutcome::Failed {
                        message: e.to_string(),
                    },
                }
            } else {
                match self.quarantine(entity_type, data, report.errors.clone()).await {
                    Ok(quarantine_id) => BatchItemOutcome::Quarantined {
                        quarantine_id,
                        errors: report.errors,
                    },
                    Err(e) => BatchItemOutcome::Failed {
                        message: e.to_string(),
                    },
                }
            };

            match &outcome {
                BatchItemOutcome::Applied { .. } => batch.applied += 1,
                BatchItemOutcome::Quarantined { .. } => batch.quarantined += 1,
                BatchItemOutcome::Failed { message } => {
                    warn!(index, error = %message, "Batch record failed");
                    batch.failed += 1;
                }
            }
            batch.items.push(BatchItem {
                index,
                warnings: report.warnings,
                outcome,
            });
        }

        info!(
            %entity_type,
            applied = batch.applied,
            quarantined = batch.quarantined,
            failed = batch.failed,
            "Validated batch"
        );
        batch
    }

    /// Hold a record for review, verbatim
    #[instrument(skip(self, data, errors))]
    pub async fn quarantine(
        &self,
        entity_type: EntityType,
        data: Value,
        errors: Vec<ValidationIssue>,
    ) -> Result<Uuid, ValidationError> {
        let record = QuarantinedRecord {
            id: Uuid::now_v7(),
            record_id: data
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            entity_type,
            data,
            validation_errors: errors,
            quarantined_at: self.clock.now(),
            status: QuarantineStatus::PendingReview,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
        };
        self.quarantine.insert_quarantined(&record).await?;

        let message = BusMessage::new(
            event_types::RECORD_QUARANTINED,
            json!({
                "quarantine_id": record.id,
                "entity_type": entity_type,
                "record_id": record.record_id,
                "error_count": record.validation_errors.len(),
            }),
        );
        if let Err(e) = self.bus.publish(topics::SYNC_ALERTS, message).await {
            warn!(quarantine_id = %record.id, error = %e, "Failed to publish quarantine alert");
        }

        info!(quarantine_id = %record.id, %entity_type, "Quarantined record");
        Ok(record.id)
    }

    /// Re-validate and, if now valid, apply the record and mark it approved
    #[instrument(skip(self, notes))]
    pub async fn approve(
        &self,
        quarantine_id: Uuid,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<QuarantinedRecord, ValidationError> {
        let entry = self.pending_entry(quarantine_id).await?;

        let report = self.validate(entry.entity_type, &entry.data).await;
        if !report.valid {
            return Err(ValidationError::StillInvalid(report.errors));
        }

        self.apply(entry.entity_type, entry.data.clone()).await?;
        self.review(quarantine_id, QuarantineStatus::Approved, reviewer, notes)
            .await
    }

    /// Mark a record rejected; it is never applied
    #[instrument(skip(self, reason))]
    pub async fn reject(
        &self,
        quarantine_id: Uuid,
        reviewer: &str,
        reason: &str,
    ) -> Result<QuarantinedRecord, ValidationError> {
        self.pending_entry(quarantine_id).await?;
        self.review(
            quarantine_id,
            QuarantineStatus::Rejected,
            reviewer,
            Some(reason.to_string()),
        )
        .await
    }

    pub async fn get_quarantined(
        &self,
        status: Option<QuarantineStatus>,
        limit: usize,
    ) -> Result<Vec<QuarantinedRecord>, ValidationError> {
        Ok(self.quarantine.list_quarantined(status, limit).await?)
    }

    pub async fn get_data_quality_metrics(&self) -> Result<DataQualityMetrics, ValidationError> {
        let validated = self.counters.validated.load(Ordering::Relaxed);
        let valid = self.counters.valid.load(Ordering::Relaxed);
        Ok(DataQualityMetrics {
            records_validated: validated,
            records_valid: valid,
            records_invalid: self.counters.invalid.load(Ordering::Relaxed),
            warnings_raised: self.counters.warnings.load(Ordering::Relaxed),
            validity_rate: if validated == 0 {
                1.0
            } else {
                valid as f64 / validated as f64
            },
            quarantine: self.quarantine.quarantine_counts().await?,
        })
    }

    async fn pending_entry(&self, quarantine_id: Uuid) -> Result<QuarantinedRecord, ValidationError> {
        let entry = self
            .quarantine
            .get_quarantined(quarantine_id)
            .await?
            .ok_or(ValidationError::NotFound(quarantine_id))?;
        if entry.status != QuarantineStatus::PendingReview {
            return Err(ValidationError::AlreadyReviewed {
                id: quarantine_id,
                status: entry.status,
            });
        }
        Ok(entry)
    }

    async fn review(
        &self,
        quarantine_id: Uuid,
        status: QuarantineStatus,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<QuarantinedRecord, ValidationError> {
        let review = QuarantineReview {
            status,
            reviewer: reviewer.to_string(),
            at: self.clock.now(),
            notes,
        };
        match self.quarantine.review_quarantined(quarantine_id, &review).await {
            Ok(Some(entry)) => {
                info!(%quarantine_id, %status, reviewer, "Reviewed quarantined record");
                Ok(entry)
            }
            // Lost the race to another reviewer
            Ok(None) => {
                let current = self
                    .quarantine
                    .get_quarantined(quarantine_id)
                    .await?
                    .ok_or(ValidationError::NotFound(quarantine_id))?;
                Err(ValidationError::AlreadyReviewed {
                    id: quarantine_id,
                    status: current.status,
                })
            }
            Err(StoreError::NotFound { .. }) => Err(ValidationError::NotFound(quarantine_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent upsert into the system of record
    async fn apply(
        &self,
        entity_type: EntityType,
        data: Value,
    ) -> Result<(Uuid, UpsertOutcome), StoreError> {
        let record = SyncRecord::from_incoming(entity_type, data, self.clock.now())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let outcome = self.records.upsert(&record).await?;
        Ok((record.id, outcome))
    }
}
