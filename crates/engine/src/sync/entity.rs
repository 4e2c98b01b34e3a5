//! Synchronized record types

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Domain record types kept in sync between the stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Consultation,
    ClinicalWorkflow,
    MedicalRecord,
    ClinicalDecisionSupport,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        Self::Consultation,
        Self::ClinicalWorkflow,
        Self::MedicalRecord,
        Self::ClinicalDecisionSupport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consultation => "consultation",
            Self::ClinicalWorkflow => "clinical_workflow",
            Self::MedicalRecord => "medical_record",
            Self::ClinicalDecisionSupport => "clinical_decision_support",
        }
    }

    /// Table holding records of this type
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Consultation => "consultations",
            Self::ClinicalWorkflow => "clinical_workflows",
            Self::MedicalRecord => "medical_records",
            Self::ClinicalDecisionSupport => "clinical_decision_support",
        }
    }

    /// Fields whose divergence counts as a conflict
    pub fn material_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Consultation => &["status", "assessment", "plan", "diagnosis"],
            Self::ClinicalWorkflow => &["status", "current_step"],
            Self::MedicalRecord => &["title", "record_type", "content"],
            Self::ClinicalDecisionSupport => &["recommendation", "severity", "status"],
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s || e.table_name() == s)
            .ok_or_else(|| format!("unknown entity type: {s}"))
    }
}

/// Error parsing a payload into a [`SyncRecord`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordParseError {
    #[error("record payload must be a JSON object")]
    NotAnObject,
    #[error("record field {0} is missing or invalid")]
    InvalidField(&'static str),
}

/// A domain record as seen by the sync layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// Parse a payload carrying `id` and `updated_at`
    pub fn from_payload(entity_type: EntityType, data: Value) -> Result<Self, RecordParseError> {
        let object = data.as_object().ok_or(RecordParseError::NotAnObject)?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(RecordParseError::InvalidField("id"))?;
        let updated_at = object
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or(RecordParseError::InvalidField("updated_at"))?;

        Ok(Self {
            id,
            entity_type,
            data,
            updated_at,
        })
    }

    /// Parse an inbound payload, stamping `updated_at = now` when it has none
    pub fn from_incoming(
        entity_type: EntityType,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Self, RecordParseError> {
        match Self::from_payload(entity_type, data.clone()) {
            Ok(record) => Ok(record),
            Err(RecordParseError::InvalidField("updated_at")) => {
                let id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .ok_or(RecordParseError::InvalidField("id"))?;
                Ok(Self::new(entity_type, id, data, now))
            }
            Err(e) => Err(e),
        }
    }

    /// Build a record, stamping `id` and `updated_at` into the payload
    pub fn new(entity_type: EntityType, id: Uuid, mut data: Value, updated_at: DateTime<Utc>) -> Self {
        if let Some(object) = data.as_object_mut() {
            object.insert("id".to_string(), Value::String(id.to_string()));
            object.insert(
                "updated_at".to_string(),
                Value::String(updated_at.to_rfc3339()),
            );
        }
        Self {
            id,
            entity_type,
            data,
            updated_at,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    /// Material fields whose values differ between the two records
    pub fn material_differences(&self, other: &SyncRecord) -> Vec<String> {
        self.entity_type
            .material_fields()
            .iter()
            .filter(|field| self.field(field) != other.field(field))
            .map(|field| field.to_string())
            .collect()
    }
}
