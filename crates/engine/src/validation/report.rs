//! Validation results and quarantine records

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::EntityType;

/// A single validation finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path of the offending field
    pub field: String,
    /// Machine-readable code (e.g. `required`, `out_of_range`)
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.code)
    }
}

/// Outcome of validating one record
///
/// Warnings never make a record invalid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn from_issues(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Quarantine review status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    PendingReview,
    Approved,
    Rejected,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for QuarantineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuarantineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown quarantine status: {other}")),
        }
    }
}

/// A record held back for human review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub id: Uuid,
    /// Parsed from the payload's `id`, when it has a valid one
    pub record_id: Option<Uuid>,
    pub entity_type: EntityType,
    /// Payload exactly as received
    pub data: serde_json::Value,
    pub validation_errors: Vec<ValidationIssue>,
    pub quarantined_at: DateTime<Utc>,
    pub status: QuarantineStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
}

/// Review decision applied to a pending quarantine entry
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantineReview {
    pub status: QuarantineStatus,
    pub reviewer: String,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Quarantine entries per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineCounts {
    pub pending_review: u64,
    pub approved: u64,
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_validity_ignores_warnings() {
        let report = ValidationReport::from_issues(
            vec![],
            vec![ValidationIssue::new("notes", "possible_ssn", "looks like an SSN")],
        );
        assert!(report.valid);

        let report = ValidationReport::from_issues(
            vec![ValidationIssue::new("title", "required", "title is required")],
            vec![],
        );
        assert!(!report.valid);
    }

    #[test]
    fn test_quarantine_status_roundtrip() {
        for status in [
            QuarantineStatus::PendingReview,
            QuarantineStatus::Approved,
            QuarantineStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<QuarantineStatus>().unwrap(), status);
        }
    }
}
