// CarePath worker
//
// Hosts the reconciliation scheduler and the sync command consumer on top
// of the PostgreSQL stores from carepath-engine.

pub mod config;
mod service;
pub mod telemetry;

pub use config::{ConfigError, WorkerConfig};
pub use service::SyncWorker;
