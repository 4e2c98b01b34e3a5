//! Leaked-identifier detection
//!
//! Matches are warnings only. Identifier and timestamp fields are skipped.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::report::ValidationIssue;

static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid SSN pattern"));

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?1[-. ]?)?\(?\b\d{3}\)?[-. ]?\d{3}[-. ]\d{4}\b").expect("valid phone pattern")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid email pattern")
});

fn skipped(key: &str) -> bool {
    key == "id" || key.ends_with("_id") || key.ends_with("_at")
}

/// Scan every string leaf for SSN, phone and email patterns
pub fn scan(data: &Value) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    walk(data, String::new(), &mut issues);
    issues
}

fn walk(value: &Value, path: String, issues: &mut Vec<ValidationIssue>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if skipped(key) {
                    continue;
                }
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                walk(child, child_path, issues);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, format!("{path}[{i}]"), issues);
            }
        }
        Value::String(text) => check_text(text, &path, issues),
        _ => {}
    }
}

fn check_text(text: &str, path: &str, issues: &mut Vec<ValidationIssue>) {
    if SSN.is_match(text) {
        issues.push(ValidationIssue::new(
            path,
            "possible_ssn",
            "text looks like it contains a social security number",
        ));
    }
    if PHONE.is_match(text) {
        issues.push(ValidationIssue::new(
            path,
            "possible_phone",
            "text looks like it contains a phone number",
        ));
    }
    if EMAIL.is_match(text) {
        issues.push(ValidationIssue::new(
            path,
            "possible_email",
            "text looks like it contains an email address",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn codes(data: Value) -> Vec<String> {
        scan(&data).into_iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_detects_identifiers() {
        assert_eq!(codes(json!({"notes": "SSN 123-45-6789"})), vec!["possible_ssn"]);
        assert_eq!(codes(json!({"notes": "call (555) 123-4567"})), vec!["possible_phone"]);
        assert_eq!(codes(json!({"notes": "mail jane.doe@example.org"})), vec!["possible_email"]);
    }

    #[test]
    fn test_nested_paths() {
        let issues = scan(&json!({"attachments": [{"caption": "555-123-4567"}]}));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "attachments[0].caption");
    }

    #[test]
    fn test_ignores_ids_and_timestamps() {
        assert!(codes(json!({
            "id": "0190f0c4-1234-7abc-8def-123456789012",
            "patient_id": "123-45-6789",
            "updated_at": "2024-03-01T10:00:00Z",
            "notes": "blood pressure 120/80, recheck in 2 weeks"
        }))
        .is_empty());
    }
}
