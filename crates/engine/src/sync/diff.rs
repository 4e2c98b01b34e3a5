//! Record classification between the two stores

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityType, SyncRecord};
use crate::persistence::{RecordStore, StoreError};

/// A materially divergent pair where the authoritative side is newer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedConflict {
    pub authoritative: SyncRecord,
    pub replica: SyncRecord,
    pub differing_fields: Vec<String>,
}

/// Classification of one entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffReport {
    /// Authoritative records absent from the replica
    pub to_create: Vec<SyncRecord>,
    /// Authoritative records to copy over the replica's version
    pub to_update: Vec<SyncRecord>,
    pub conflicts: Vec<DetectedConflict>,
    pub unchanged: usize,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.conflicts.is_empty()
    }
}

/// How one authoritative record relates to its replica counterpart
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Create,
    Unchanged,
    Update,
    Conflict(Vec<String>),
}

/// Classify a single pair
///
/// Identical payloads are unchanged. A material difference with a newer
/// authoritative `updated_at` is a conflict; any other difference is a
/// routine update.
pub fn classify(authoritative: &SyncRecord, replica: Option<&SyncRecord>) -> Classification {
    let Some(replica) = replica else {
        return Classification::Create;
    };
    if authoritative.data == replica.data {
        return Classification::Unchanged;
    }

    let differing = authoritative.material_differences(replica);
    if !differing.is_empty() && authoritative.updated_at > replica.updated_at {
        Classification::Conflict(differing)
    } else {
        Classification::Update
    }
}

/// Diff two record sets already loaded from the stores
pub fn diff_records(authoritative: Vec<SyncRecord>, replica: Vec<SyncRecord>) -> DiffReport {
    let replica: HashMap<Uuid, SyncRecord> = replica.into_iter().map(|r| (r.id, r)).collect();
    let mut report = DiffReport::default();

    for record in authoritative {
        let counterpart = replica.get(&record.id);
        match classify(&record, counterpart) {
            Classification::Create => report.to_create.push(record),
            Classification::Unchanged => report.unchanged += 1,
            Classification::Update => report.to_update.push(record),
            Classification::Conflict(differing_fields) => {
                if let Some(replica) = counterpart {
                    report.conflicts.push(DetectedConflict {
                        authoritative: record,
                        replica: replica.clone(),
                        differing_fields,
                    });
                }
            }
        }
    }

    report
}

/// Load both sides of one entity type and classify every authoritative record
///
/// With `since`, only authoritative records updated at or after it are
/// considered; the replica side is always loaded in full so that a stale
/// counterpart is still found.
pub async fn diff(
    authoritative: &dyn RecordStore,
    replica: &dyn RecordStore,
    entity_type: EntityType,
    since: Option<DateTime<Utc>>,
) -> Result<DiffReport, StoreError> {
    let (auth_records, replica_records) = futures::try_join!(
        authoritative.list(entity_type, since),
        replica.list(entity_type, None),
    )?;
    Ok(diff_records(auth_records, replica_records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn consultation(id: Uuid, status: &str, at: DateTime<Utc>) -> SyncRecord {
        SyncRecord::new(
            EntityType::Consultation,
            id,
            json!({"status": status, "plan": "rest"}),
            at,
        )
    }

    #[test]
    fn test_newer_authoritative_material_change_is_conflict() {
        let id = Uuid::now_v7();
        let t0 = Utc::now();
        let auth = consultation(id, "completed", t0 + Duration::minutes(10));
        let replica = consultation(id, "in-progress", t0);

        assert_eq!(
            classify(&auth, Some(&replica)),
            Classification::Conflict(vec!["status".to_string()])
        );
    }

    #[test]
    fn test_non_material_change_is_update() {
        let id = Uuid::now_v7();
        let t0 = Utc::now();
        let auth = SyncRecord::new(
            EntityType::Consultation,
            id,
            json!({"status": "completed", "room": "2"}),
            t0 + Duration::minutes(1),
        );
        let replica = SyncRecord::new(
            EntityType::Consultation,
            id,
            json!({"status": "completed", "room": "1"}),
            t0,
        );
        assert_eq!(classify(&auth, Some(&replica)), Classification::Update);
    }

    #[test]
    fn test_older_authoritative_is_update() {
        let id = Uuid::now_v7();
        let t0 = Utc::now();
        let auth = consultation(id, "completed", t0);
        let replica = consultation(id, "cancelled", t0 + Duration::minutes(3));
        assert_eq!(classify(&auth, Some(&replica)), Classification::Update);
    }

    #[test]
    fn test_diff_records_buckets() {
        let t0 = Utc::now();
        let same = consultation(Uuid::now_v7(), "scheduled", t0);
        let missing = consultation(Uuid::now_v7(), "scheduled", t0);
        let report = diff_records(vec![same.clone(), missing.clone()], vec![same]);

        assert_eq!(report.to_create, vec![missing]);
        assert_eq!(report.unchanged, 1);
        assert!(report.conflicts.is_empty());
    }
}
