//! Transition rules and their evaluation
//!
//! - [`RuleRegistry`] immutable catalog of legal transitions per workflow type
//! - [`Condition`] named, pure predicates over an [`EvaluationContext`]
//! - [`PermissionLookup`] role to permission resolution
//! - [`TransitionEvaluator`] combines the three and fails closed

mod condition;
mod evaluator;
mod permissions;
mod registry;

pub use condition::{Condition, EvaluationContext};
pub use evaluator::{TransitionDenied, TransitionEvaluator, UnknownCondition};
pub use permissions::{
    PermissionLookup, PermissionLookupError, RolePermissionTable, KNOWN_PERMISSIONS,
};
pub use registry::{RuleConfig, RuleConfigError, RuleRegistry, TransitionRule};
