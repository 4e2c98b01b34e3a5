//! Field-level merge of two divergent records

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::sync::EntityType;

/// Array fields whose items are unioned
pub const UNION_FIELDS: &[&str] = &["tags", "symptoms", "attachments", "alerts"];

/// Free-text fields concatenated when both sides diverge
pub fn concat_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Consultation => &["notes", "assessment"],
        EntityType::MedicalRecord => &["notes", "content"],
        EntityType::ClinicalDecisionSupport => &["notes", "rationale"],
        EntityType::ClinicalWorkflow => &["notes"],
    }
}

const CONCAT_SEPARATOR: &str = "\n---\n";

/// Merge replica fields into the authoritative record
///
/// Text fields in the entity's concat list are joined, union fields keep
/// every distinct item, `*_at` timestamps take the later value and every
/// other field takes the authoritative value. Fields only the replica has
/// are kept.
pub fn merge_records(entity_type: EntityType, authoritative: &Value, replica: &Value) -> Value {
    let (Some(auth), Some(rep)) = (authoritative.as_object(), replica.as_object()) else {
        return authoritative.clone();
    };

    let mut merged: Map<String, Value> = auth.clone();
    let concat = concat_fields(entity_type);

    for (key, rep_value) in rep {
        let Some(auth_value) = auth.get(key) else {
            merged.insert(key.clone(), rep_value.clone());
            continue;
        };
        if auth_value == rep_value {
            continue;
        }

        let value = if concat.contains(&key.as_str()) {
            concat_text(auth_value, rep_value)
        } else if UNION_FIELDS.contains(&key.as_str()) {
            union_arrays(auth_value, rep_value)
        } else if key.ends_with("_at") {
            later_timestamp(auth_value, rep_value)
        } else {
            auth_value.clone()
        };
        merged.insert(key.clone(), value);
    }

    Value::Object(merged)
}

fn concat_text(auth: &Value, replica: &Value) -> Value {
    match (auth.as_str(), replica.as_str()) {
        (Some(a), Some(r)) if a.trim().is_empty() => Value::String(r.to_string()),
        (Some(a), Some(r)) if r.trim().is_empty() || a.contains(r) => Value::String(a.to_string()),
        (Some(a), Some(r)) if r.contains(a) => Value::String(r.to_string()),
        (Some(a), Some(r)) => Value::String(format!("{a}{CONCAT_SEPARATOR}{r}")),
        (None, Some(_)) if auth.is_null() => replica.clone(),
        _ => auth.clone(),
    }
}

fn union_arrays(auth: &Value, replica: &Value) -> Value {
    match (auth.as_array(), replica.as_array()) {
        (Some(a), Some(r)) => {
            let mut items = a.clone();
            for item in r {
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
            Value::Array(items)
        }
        (None, Some(_)) if auth.is_null() => replica.clone(),
        _ => auth.clone(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn later_timestamp(auth: &Value, replica: &Value) -> Value {
    match (parse_timestamp(auth), parse_timestamp(replica)) {
        (Some(a), Some(r)) if r > a => replica.clone(),
        (None, Some(_)) => replica.clone(),
        _ => auth.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consultation_merge() {
        let auth = json!({
            "status": "completed",
            "notes": "BP stable",
            "tags": ["cardio"],
            "updated_at": "2024-03-01T10:00:00Z",
            "plan": "discharge"
        });
        let replica = json!({
            "status": "in-progress",
            "notes": "patient reports dizziness",
            "tags": ["cardio", "neuro"],
            "updated_at": "2024-03-01T10:03:00Z",
            "room": "4B"
        });

        let merged = merge_records(EntityType::Consultation, &auth, &replica);
        assert_eq!(merged["status"], "completed");
        assert_eq!(merged["notes"], "BP stable\n---\npatient reports dizziness");
        assert_eq!(merged["tags"], json!(["cardio", "neuro"]));
        assert_eq!(merged["updated_at"], "2024-03-01T10:03:00Z");
        assert_eq!(merged["plan"], "discharge");
        assert_eq!(merged["room"], "4B");
    }

    #[test]
    fn test_concat_only_for_listed_fields() {
        let auth = json!({"content": "v2", "title": "CBC"});
        let replica = json!({"content": "v1", "title": "Full blood count"});

        let merged = merge_records(EntityType::MedicalRecord, &auth, &replica);
        assert_eq!(merged["content"], "v2\n---\nv1");
        assert_eq!(merged["title"], "CBC");

        let merged = merge_records(EntityType::ClinicalWorkflow, &auth, &replica);
        assert_eq!(merged["content"], "v2");
    }

    #[test]
    fn test_blank_side_is_not_concatenated() {
        let merged = merge_records(
            EntityType::Consultation,
            &json!({"assessment": ""}),
            &json!({"assessment": "viral infection"}),
        );
        assert_eq!(merged["assessment"], "viral infection");
    }

    #[test]
    fn test_text_contained_in_other_side_is_not_repeated() {
        // Replica appended to the authoritative note
        let merged = merge_records(
            EntityType::Consultation,
            &json!({"notes": "BP stable"}),
            &json!({"notes": "BP stable; patient reports dizziness"}),
        );
        assert_eq!(merged["notes"], "BP stable; patient reports dizziness");

        // Authoritative appended to the replica note
        let merged = merge_records(
            EntityType::Consultation,
            &json!({"notes": "BP stable; patient reports dizziness"}),
            &json!({"notes": "BP stable"}),
        );
        assert_eq!(merged["notes"], "BP stable; patient reports dizziness");
    }
}
