//! Required-field and domain checks per entity type

use serde_json::{Map, Value};
use uuid::Uuid;

use super::report::ValidationIssue;
use crate::sync::EntityType;
use crate::workflow::ClinicalState;

pub const CONSULTATION_TYPES: &[&str] = &[
    "initial",
    "follow_up",
    "emergency",
    "routine",
    "specialist",
    "telemedicine",
];

/// Both spellings occur in upstream data
pub const CONSULTATION_STATUSES: &[&str] = &[
    "scheduled",
    "in-progress",
    "in_progress",
    "completed",
    "cancelled",
    "no_show",
];

pub const WORKFLOW_TYPES: &[&str] = &["consultation", "diagnosis", "treatment", "follow_up"];

pub const RECORD_TYPES: &[&str] = &[
    "lab_result",
    "imaging",
    "prescription",
    "clinical_note",
    "discharge_summary",
    "referral",
    "vaccination",
];

pub const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];

pub const DECISION_STATUSES: &[&str] = &["active", "acknowledged", "dismissed", "resolved"];

/// Physiological range for one vital sign
#[derive(Debug, Clone, Copy)]
pub struct VitalRange {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
}

pub const VITAL_RANGES: &[VitalRange] = &[
    VitalRange { name: "heart_rate", min: 20.0, max: 250.0 },
    VitalRange { name: "systolic_bp", min: 50.0, max: 250.0 },
    VitalRange { name: "diastolic_bp", min: 30.0, max: 150.0 },
    VitalRange { name: "temperature", min: 30.0, max: 45.0 },
    VitalRange { name: "respiratory_rate", min: 5.0, max: 60.0 },
    VitalRange { name: "oxygen_saturation", min: 50.0, max: 100.0 },
];

pub fn required_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Consultation => &["id", "patient_id", "provider_id", "consultation_type", "status"],
        EntityType::ClinicalWorkflow => &["id", "workflow_type", "status"],
        EntityType::MedicalRecord => &["id", "patient_id", "title", "record_type"],
        EntityType::ClinicalDecisionSupport => &["id", "patient_id", "recommendation", "severity"],
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

/// Missing, null and blank-string fields
pub fn check_required(entity_type: EntityType, object: &Map<String, Value>) -> Vec<ValidationIssue> {
    required_fields(entity_type)
        .iter()
        .filter(|field| is_blank(object.get(**field)))
        .map(|field| ValidationIssue::new(*field, "required", format!("{field} is required")))
        .collect()
}

fn check_enum(
    object: &Map<String, Value>,
    field: &str,
    allowed: &[&str],
    issues: &mut Vec<ValidationIssue>,
) {
    match object.get(field) {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) if s.trim().is_empty() => {}
        Some(Value::String(s)) if allowed.contains(&s.as_str()) => {}
        Some(other) => issues.push(ValidationIssue::new(
            field,
            "invalid_value",
            format!("{field} must be one of {}, got {other}", allowed.join(", ")),
        )),
    }
}

fn check_timestamp(object: &Map<String, Value>, field: &str, issues: &mut Vec<ValidationIssue>) {
    if let Some(value) = object.get(field).filter(|v| !v.is_null()) {
        let parses = value
            .as_str()
            .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok());
        if !parses {
            issues.push(ValidationIssue::new(
                field,
                "invalid_format",
                format!("{field} must be an RFC 3339 timestamp"),
            ));
        }
    }
}

fn check_vitals(object: &Map<String, Value>, issues: &mut Vec<ValidationIssue>) {
    let Some((key, Value::Object(vitals))) = ["vital_signs", "vitals"]
        .iter()
        .find_map(|k| object.get(*k).map(|v| (*k, v)))
    else {
        return;
    };

    for range in VITAL_RANGES {
        let Some(value) = vitals.get(range.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let path = format!("{key}.{}", range.name);
        match value.as_f64() {
            Some(n) if (range.min..=range.max).contains(&n) => {}
            Some(n) => issues.push(ValidationIssue::new(
                path,
                "out_of_range",
                format!(
                    "{} {n} outside physiological range {}-{}",
                    range.name, range.min, range.max
                ),
            )),
            None => issues.push(ValidationIssue::new(
                path,
                "invalid_type",
                format!("{} must be numeric", range.name),
            )),
        }
    }
}

/// Enum, format and range checks
pub fn check_domain(entity_type: EntityType, object: &Map<String, Value>) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Some(id) = object.get("id").and_then(Value::as_str) {
        if !id.trim().is_empty() && Uuid::parse_str(id).is_err() {
            issues.push(ValidationIssue::new("id", "invalid_format", "id must be a UUID"));
        }
    } else if object.get("id").is_some_and(|v| !v.is_null()) {
        issues.push(ValidationIssue::new("id", "invalid_format", "id must be a UUID"));
    }
    check_timestamp(object, "updated_at", &mut issues);

    match entity_type {
        EntityType::Consultation => {
            check_enum(object, "consultation_type", CONSULTATION_TYPES, &mut issues);
            check_enum(object, "status", CONSULTATION_STATUSES, &mut issues);
            check_vitals(object, &mut issues);
        }
        EntityType::ClinicalWorkflow => {
            check_enum(object, "workflow_type", WORKFLOW_TYPES, &mut issues);
            let states: Vec<&str> = ClinicalState::ALL.iter().map(|s| s.as_str()).collect();
            check_enum(object, "status", &states, &mut issues);
        }
        EntityType::MedicalRecord => {
            check_enum(object, "record_type", RECORD_TYPES, &mut issues);
        }
        EntityType::ClinicalDecisionSupport => {
            check_enum(object, "severity", SEVERITIES, &mut issues);
            check_enum(object, "status", DECISION_STATUSES, &mut issues);
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_title_is_single_error() {
        let record = object(json!({
            "id": Uuid::now_v7().to_string(),
            "patient_id": "p-1",
            "record_type": "lab_result",
        }));
        let issues = check_required(EntityType::MedicalRecord, &record);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "title");
        assert_eq!(issues[0].code, "required");
    }

    #[test]
    fn test_blank_string_counts_as_missing() {
        let record = object(json!({"id": "x", "workflow_type": "  ", "status": "pending"}));
        let issues = check_required(EntityType::ClinicalWorkflow, &record);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "workflow_type");
    }

    #[test]
    fn test_consultation_status_spellings() {
        for status in ["in-progress", "in_progress"] {
            let record = object(json!({"status": status, "consultation_type": "routine"}));
            assert!(check_domain(EntityType::Consultation, &record).is_empty());
        }
        let record = object(json!({"status": "paused"}));
        assert_eq!(check_domain(EntityType::Consultation, &record)[0].code, "invalid_value");
    }

    #[test]
    fn test_vital_ranges() {
        let record = object(json!({
            "vital_signs": {"heart_rate": 300, "temperature": 37.2, "oxygen_saturation": "high"}
        }));
        let issues = check_domain(EntityType::Consultation, &record);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].field, "vital_signs.heart_rate");
        assert_eq!(issues[0].code, "out_of_range");
        assert_eq!(issues[1].code, "invalid_type");
    }

    #[test]
    fn test_bad_id_and_timestamp() {
        let record = object(json!({"id": "not-a-uuid", "updated_at": "yesterday"}));
        let codes: Vec<_> = check_domain(EntityType::MedicalRecord, &record)
            .into_iter()
            .map(|i| i.field)
            .collect();
        assert_eq!(codes, vec!["id", "updated_at"]);
    }
}
