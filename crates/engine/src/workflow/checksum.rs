//! State checksums
//!
//! The checksum is a SHA-256 over the canonical JSON of the semantic content
//! of a state. Object keys serialize in sorted order, so the same content
//! always hashes to the same value regardless of insertion order.

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{ClinicalState, WorkflowMetadata, WorkflowStep};

#[derive(Serialize)]
struct ChecksumContent<'a> {
    state: ClinicalState,
    current_step: &'a str,
    steps: &'a [WorkflowStep],
    metadata: &'a WorkflowMetadata,
}

/// Compute the hex-encoded checksum of a state's content
pub fn compute_checksum(
    state: ClinicalState,
    current_step: &str,
    steps: &[WorkflowStep],
    metadata: &WorkflowMetadata,
) -> Result<String, serde_json::Error> {
    let content = ChecksumContent {
        state,
        current_step,
        steps,
        metadata,
    };
    // Round-trip through Value so nested maps are key-sorted
    let canonical = serde_json::to_string(&serde_json::to_value(&content)?)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}
