//! Conflict records and their resolution
//!
//! Conflicts are created by the reconciler and closed only by
//! [`ConflictResolver`]; `resolved` and `escalated` are terminal.

mod merge;
mod resolver;
mod types;

pub use merge::{concat_fields, merge_records, UNION_FIELDS};
pub use resolver::{
    AutoResolveReport, ConflictError, ConflictResolver, ReplicaWinsPolicy, ResolutionRequest,
    ResolutionResult, ResolverConfig,
};
pub use types::{
    AuditEntry, ConflictClosure, ConflictRecord, ConflictStatistics, ConflictStatus, ConflictType,
    ResolutionStrategy,
};
