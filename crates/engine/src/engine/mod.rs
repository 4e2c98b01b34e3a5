//! Workflow state engine
//!
//! This module provides:
//! - [`WorkflowStateEngine`] versioned create / transition / recover
//! - [`EngineConfig`] cache and paging settings

mod state_engine;

pub use state_engine::{
    state_cache_key, EngineConfig, EngineError, TransitionRequest, WorkflowStateEngine,
};
