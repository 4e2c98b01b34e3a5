// Worker configuration
// Decision: Environment only; `.env` is loaded by main before this runs

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be true or false, got {value:?}")]
    InvalidFlag { key: &'static str, value: String },
}

/// Configuration for the worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// System of record; also holds workflow state, conflicts and quarantine
    pub database_url: String,
    /// Replica store the reconciler brings in line with the system of record
    pub replica_database_url: String,
    pub tenant_id: String,
    pub worker_id: String,
    pub sync_interval: Duration,
    pub lease_ttl: Duration,
    /// Sweep pending conflicts after each scheduled reconciliation
    pub auto_resolve: bool,
}

impl WorkerConfig {
    pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
    pub const DEFAULT_LEASE_SECS: u64 = 600;

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let replica_database_url =
            var("REPLICA_DATABASE_URL").ok_or(ConfigError::Missing("REPLICA_DATABASE_URL"))?;

        let secs = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match var(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::InvalidNumber { key, value: raw }),
                },
            }
        };

        let flag = |key: &'static str, default: bool| -> Result<bool, ConfigError> {
            match var(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => Err(ConfigError::InvalidFlag { key, value: raw }),
                },
            }
        };

        Ok(Self {
            database_url,
            replica_database_url,
            tenant_id: var("TENANT_ID").unwrap_or_else(|| "default".to_string()),
            worker_id: var("WORKER_ID").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            sync_interval: Duration::from_secs(secs(
                "SYNC_INTERVAL_SECS",
                Self::DEFAULT_SYNC_INTERVAL_SECS,
            )?),
            lease_ttl: Duration::from_secs(secs("SYNC_LEASE_SECS", Self::DEFAULT_LEASE_SECS)?),
            auto_resolve: flag("AUTO_RESOLVE", true)?,
        })
    }
}
