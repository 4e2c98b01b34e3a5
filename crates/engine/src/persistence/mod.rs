//! Persistence layer
//!
//! This module provides:
//! - [`WorkflowStateStore`], [`RecordStore`], [`ConflictStore`],
//!   [`QuarantineStore`] and [`SyncStateStore`] traits
//! - [`InMemoryStore`] / [`InMemoryRecordStore`] for testing
//! - [`PostgresStore`] / [`PostgresRecordStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryRecordStore, InMemoryStore};
pub use postgres::{PostgresRecordStore, PostgresStore};
pub use store::{
    ConflictStore, QuarantineStore, RecordStore, StateCommit, StoreError, SyncStateStore,
    UpsertOutcome, WorkflowStateStore,
};
