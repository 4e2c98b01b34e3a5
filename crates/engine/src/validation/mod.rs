//! Inbound record validation and quarantine
//!
//! Records pass through [`DataValidationGate`] before reaching the system of
//! record. Checks run in order: required fields, domain rules, references,
//! then the privacy scan (which only warns).

mod gate;
pub mod privacy;
mod references;
mod report;
pub mod rules;

pub use gate::{
    BatchItem, BatchItemOutcome, BatchReport, DataQualityMetrics, DataValidationGate,
    ValidationError,
};
pub use references::{
    check_references, InMemoryReferenceDirectory, PostgresReferenceDirectory, ReferenceDirectory,
    ReferenceKind, ReferenceLookupError,
};
pub use report::{
    QuarantineCounts, QuarantineReview, QuarantineStatus, QuarantinedRecord, ValidationIssue,
    ValidationReport,
};
