//! # Clinical State Engine
//!
//! Versioned clinical workflow state and cross-store reconciliation.
//!
//! ## Features
//!
//! - **Immutable state versions**: every transition writes a new checksummed version plus a history entry
//! - **Declarative transition rules**: per-workflow-type edges with named conditions and permissions
//! - **Reconciliation**: authoritative/replica diffing with lease-guarded full and incremental runs
//! - **Conflict resolution**: authoritative wins, replica wins, field-level merge or manual data
//! - **Validation gate**: required, domain, referential and privacy checks with a quarantine queue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowStateEngine                        │
//! │  (TransitionEvaluator + RuleRegistry, version-guarded commit)│
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkflowStateStore                        │
//! │  (PostgreSQL: workflow_states, history, clinical_workflows) │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────┐
//! │  SyncReconciler  │──▶│ ConflictResolver │   │ Validation   │
//! │ (diff, lease)    │   │ (strategies)     │   │ Gate         │
//! └──────────────────┘   └──────────────────┘   └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use carepath_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let evaluator = TransitionEvaluator::new(
//!     Arc::new(RuleRegistry::builtin()?),
//!     Arc::new(RolePermissionTable::clinical_defaults()),
//! );
//! let engine = WorkflowStateEngine::new(
//!     store,
//!     Arc::new(InMemoryCache::new()),
//!     Arc::new(InMemoryEventBus::new()),
//!     evaluator,
//!     Arc::new(SystemClock),
//!     EngineConfig::default(),
//! );
//!
//! let actor = Actor::new("dr-house").with_role("physician");
//! let state = engine
//!     .create_state(workflow_id, InitialState::new("consultation", "intake"), &actor)
//!     .await?;
//! ```

pub mod bus;
pub mod cache;
pub mod clock;
pub mod conflict;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod rules;
pub mod sync;
pub mod validation;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{BusMessage, EventBus, InMemoryEventBus};
    pub use crate::cache::{InMemoryCache, KeyValueCache};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::conflict::{
        ConflictError, ConflictRecord, ConflictResolver, ConflictStatus, ResolutionRequest,
        ResolutionStrategy, ResolverConfig,
    };
    pub use crate::engine::{EngineConfig, EngineError, TransitionRequest, WorkflowStateEngine};
    pub use crate::persistence::{
        InMemoryRecordStore, InMemoryStore, PostgresRecordStore, PostgresStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::rules::{RolePermissionTable, RuleRegistry, TransitionEvaluator};
    pub use crate::sync::{
        EntityType, ReconcilerConfig, SyncError, SyncReconciler, SyncRecord, SyncReport,
    };
    pub use crate::validation::{DataValidationGate, ValidationError, ValidationReport};
    pub use crate::workflow::{
        Actor, ClinicalState, InitialState, WorkflowMetadata, WorkflowState, WorkflowStep,
    };
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use conflict::{ConflictResolver, ResolverConfig};
pub use engine::{EngineConfig, EngineError, TransitionRequest, WorkflowStateEngine};
pub use persistence::{
    InMemoryRecordStore, InMemoryStore, PostgresRecordStore, PostgresStore, StoreError,
};
pub use reliability::RetryPolicy;
pub use rules::{RuleRegistry, TransitionEvaluator};
pub use sync::{SyncReconciler, SyncScheduler};
pub use validation::DataValidationGate;
pub use workflow::{ClinicalState, WorkflowState};
