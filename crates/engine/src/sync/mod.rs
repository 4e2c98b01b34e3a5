//! Cross-store reconciliation
//!
//! The authoritative store is the source of truth; the replica is brought
//! in line by full or incremental [`SyncReconciler`] runs and by per-record
//! bus events. Divergences that can't be applied blindly become conflicts
//! for the resolver.

mod commands;
mod diff;
mod entity;
mod reconciler;
mod scheduler;

pub use commands::{CommandError, SyncCommand, SyncCommandHandler};
pub use diff::{classify, diff, diff_records, Classification, DetectedConflict, DiffReport};
pub use entity::{EntityType, RecordParseError, SyncRecord};
pub use reconciler::{
    ChangeOutcome, ReconcilerConfig, SyncError, SyncMode, SyncReconciler, SyncReport, SyncStatus,
};
pub use scheduler::SyncScheduler;
