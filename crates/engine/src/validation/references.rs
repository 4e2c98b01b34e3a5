//! Referential checks against patient, provider and hospital directories

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{error, warn};

use super::report::ValidationIssue;

/// Kind of referenced entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Patient,
    Provider,
    Hospital,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [Self::Patient, Self::Provider, Self::Hospital];

    /// Payload field holding the reference
    pub fn field(&self) -> &'static str {
        match self {
            Self::Patient => "patient_id",
            Self::Provider => "provider_id",
            Self::Hospital => "hospital_id",
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Patient => "patients",
            Self::Provider => "providers",
            Self::Hospital => "hospitals",
        }
    }
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Patient => write!(f, "patient"),
            Self::Provider => write!(f, "provider"),
            Self::Hospital => write!(f, "hospital"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("reference lookup failed: {0}")]
pub struct ReferenceLookupError(pub String);

/// Existence lookups for referenced entities
#[async_trait]
pub trait ReferenceDirectory: Send + Sync + 'static {
    async fn exists(&self, kind: ReferenceKind, id: &str) -> Result<bool, ReferenceLookupError>;
}

/// In-memory directory
#[derive(Default)]
pub struct InMemoryReferenceDirectory {
    known: RwLock<HashSet<(ReferenceKind, String)>>,
}

impl InMemoryReferenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, kind: ReferenceKind, id: impl Into<String>) -> Self {
        self.insert(kind, id);
        self
    }

    pub fn insert(&self, kind: ReferenceKind, id: impl Into<String>) {
        self.known.write().insert((kind, id.into()));
    }
}

#[async_trait]
impl ReferenceDirectory for InMemoryReferenceDirectory {
    async fn exists(&self, kind: ReferenceKind, id: &str) -> Result<bool, ReferenceLookupError> {
        Ok(self.known.read().contains(&(kind, id.to_string())))
    }
}

/// Directory backed by the CRUD service's `patients`, `providers` and
/// `hospitals` tables
#[derive(Clone)]
pub struct PostgresReferenceDirectory {
    pool: PgPool,
}

impl PostgresReferenceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReferenceDirectory for PostgresReferenceDirectory {
    async fn exists(&self, kind: ReferenceKind, id: &str) -> Result<bool, ReferenceLookupError> {
        let found: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE id::text = $1)",
            kind.table_name()
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to look up {}: {}", kind, e);
            ReferenceLookupError(e.to_string())
        })?;
        Ok(found)
    }
}

/// Check every reference field present in the payload
///
/// Lookups run concurrently. A failed lookup is an error, never a pass.
pub async fn check_references(
    directory: &dyn ReferenceDirectory,
    object: &Map<String, Value>,
) -> Vec<ValidationIssue> {
    let targets: Vec<(ReferenceKind, &str)> = ReferenceKind::ALL
        .into_iter()
        .filter_map(|kind| {
            object
                .get(kind.field())
                .and_then(Value::as_str)
                .filter(|id| !id.trim().is_empty())
                .map(|id| (kind, id))
        })
        .collect();

    let lookups = targets
        .iter()
        .map(|(kind, id)| directory.exists(*kind, id));
    let results = join_all(lookups).await;

    targets
        .into_iter()
        .zip(results)
        .filter_map(|((kind, id), result)| match result {
            Ok(true) => None,
            Ok(false) => Some(ValidationIssue::new(
                kind.field(),
                "unknown_reference",
                format!("{kind} {id} does not exist"),
            )),
            Err(e) => {
                warn!(%kind, id, error = %e, "Reference lookup failed");
                Some(ValidationIssue::new(
                    kind.field(),
                    "reference_lookup_failed",
                    format!("could not verify {kind} {id}"),
                ))
            }
        })
        .collect()
}
