//! Conflict records and resolution types

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sync::{EntityType, SyncRecord};

/// Conflict lifecycle status
///
/// `resolved` and `escalated` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Escalated,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "escalated" => Ok(Self::Escalated),
            other => Err(format!("unknown conflict status: {other}")),
        }
    }
}

/// How a conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    AuthoritativeWins,
    ReplicaWins,
    Merge,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthoritativeWins => "authoritative_wins",
            Self::ReplicaWins => "replica_wins",
            Self::Merge => "merge",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authoritative_wins" => Ok(Self::AuthoritativeWins),
            "replica_wins" => Ok(Self::ReplicaWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// Kind of divergence detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Material fields differ and the authoritative side is newer
    DataMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataMismatch => "data_mismatch",
        }
    }
}

impl FromStr for ConflictType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "data_mismatch" => Ok(Self::DataMismatch),
            other => Err(format!("unknown conflict type: {other}")),
        }
    }
}

/// A detected divergence between the authoritative and replica stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub record_id: Uuid,
    pub entity_type: EntityType,
    pub conflict_type: ConflictType,
    pub differing_fields: Vec<String>,
    pub authoritative: SyncRecord,
    pub replica: SyncRecord,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<ResolutionStrategy>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub escalation_reason: Option<String>,
}

impl ConflictRecord {
    /// New pending conflict
    pub fn detected(
        authoritative: SyncRecord,
        replica: SyncRecord,
        differing_fields: Vec<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            record_id: authoritative.id,
            entity_type: authoritative.entity_type,
            conflict_type: ConflictType::DataMismatch,
            differing_fields,
            authoritative,
            replica,
            detected_at,
            status: ConflictStatus::Pending,
            resolution_strategy: None,
            resolved_at: None,
            resolved_by: None,
            escalation_reason: None,
        }
    }

    /// Gap between the two sides' `updated_at`
    pub fn timestamp_gap(&self) -> chrono::Duration {
        (self.authoritative.updated_at - self.replica.updated_at).abs()
    }
}

/// Terminal status change applied to a pending conflict
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictClosure {
    pub status: ConflictStatus,
    pub strategy: Option<ResolutionStrategy>,
    pub actor: String,
    pub at: DateTime<Utc>,
    pub escalation_reason: Option<String>,
}

/// Sync audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub conflict_id: Uuid,
    pub action: String,
    pub strategy: Option<ResolutionStrategy>,
    pub actor: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Aggregate conflict counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictStatistics {
    pub total: u64,
    pub pending: u64,
    pub resolved: u64,
    pub escalated: u64,
    pub by_entity_type: BTreeMap<String, u64>,
    pub by_strategy: BTreeMap<String, u64>,
}

impl ConflictStatistics {
    /// Fold one conflict into the counts
    pub fn add(
        &mut self,
        entity_type: EntityType,
        status: ConflictStatus,
        strategy: Option<ResolutionStrategy>,
        count: u64,
    ) {
        self.total += count;
        match status {
            ConflictStatus::Pending => self.pending += count,
            ConflictStatus::Resolved => self.resolved += count,
            ConflictStatus::Escalated => self.escalated += count,
        }
        *self
            .by_entity_type
            .entry(entity_type.as_str().to_string())
            .or_default() += count;
        if let Some(strategy) = strategy {
            *self
                .by_strategy
                .entry(strategy.as_str().to_string())
                .or_default() += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        for strategy in [
            ResolutionStrategy::AuthoritativeWins,
            ResolutionStrategy::ReplicaWins,
            ResolutionStrategy::Merge,
            ResolutionStrategy::Manual,
        ] {
            assert_eq!(strategy.as_str().parse::<ResolutionStrategy>().unwrap(), strategy);
        }
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_statistics_add() {
        let mut stats = ConflictStatistics::default();
        stats.add(EntityType::Consultation, ConflictStatus::Pending, None, 2);
        stats.add(
            EntityType::MedicalRecord,
            ConflictStatus::Resolved,
            Some(ResolutionStrategy::Merge),
            1,
        );

        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.by_entity_type["consultation"], 2);
        assert_eq!(stats.by_strategy["merge"], 1);
    }
}
