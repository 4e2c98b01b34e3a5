//! Workflow metadata
//!
//! Metadata is free-form at the storage boundary (a JSON object column) but
//! business logic only touches it through the typed accessors below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which recovery provenance is stored
pub const RECOVERY_KEY: &str = "recovery";

/// Provenance recorded on a state produced by `recover_state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryInfo {
    /// Version whose content was restored
    pub from_version: i32,
    /// Latest version at the time of recovery
    pub previous_version: i32,
    pub reason: String,
    pub recovered_by: String,
    pub recovered_at: DateTime<Utc>,
}

/// Workflow metadata object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowMetadata(Map<String, Value>);

impl WorkflowMetadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Set a value, returning self for chaining
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Boolean flag; absent or non-boolean values read as `false`
    pub fn flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Non-empty string value
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// RFC 3339 timestamp value
    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.str(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Shallow merge: keys from `other` replace existing keys
    pub fn merged(&self, other: &WorkflowMetadata) -> WorkflowMetadata {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            merged.insert(key.clone(), value.clone());
        }
        WorkflowMetadata(merged)
    }

    /// Recovery provenance, if this state was produced by a recovery
    pub fn recovery(&self) -> Option<RecoveryInfo> {
        self.0
            .get(RECOVERY_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_recovery(&mut self, info: &RecoveryInfo) -> Result<(), serde_json::Error> {
        self.0
            .insert(RECOVERY_KEY.to_string(), serde_json::to_value(info)?);
        Ok(())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for WorkflowMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
