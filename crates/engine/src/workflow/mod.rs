//! Clinical workflow state types
//!
//! This module contains the value types the state engine persists:
//! - [`WorkflowState`] immutable, checksummed version of a workflow
//! - [`WorkflowStep`] step snapshot embedded in a state
//! - [`WorkflowMetadata`] typed wrapper around the metadata object
//! - [`WorkflowStateHistory`] append-only audit entry

mod checksum;
mod history;
mod metadata;
mod state;
mod step;

pub use checksum::compute_checksum;
pub use history::{transition_labels, WorkflowStateHistory};
pub use metadata::{RecoveryInfo, WorkflowMetadata};
pub use state::{Actor, ClinicalState, InitialState, WorkflowState, WorkflowSummary};
pub use step::{StepStatus, WorkflowStep};
