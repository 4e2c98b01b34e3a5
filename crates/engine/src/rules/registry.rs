//! Transition rule registry
//!
//! The registry maps workflow type names to the transitions that are legal
//! for that type. It is loaded once at startup and never mutated. Loading
//! fails fast on rules that name unknown conditions or permissions, on
//! duplicate edges, and on states that cannot be reached from `pending`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::condition::Condition;
use super::permissions::KNOWN_PERMISSIONS;
use crate::workflow::ClinicalState;

/// Built-in rules (embedded in binary)
const DEFAULT_TRANSITION_RULES: &str = include_str!("../../config/transition_rules.toml");

/// A legal edge in a workflow type's state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRule {
    pub from: ClinicalState,
    pub to: ClinicalState,
    pub conditions: Vec<Condition>,
    pub required_permissions: Vec<String>,
}

/// Rule as written in the TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Immutable catalog of transition rules per workflow type
pub struct RuleRegistry {
    rules: HashMap<String, Vec<TransitionRule>>,
}

impl RuleRegistry {
    /// Load rules from a TOML file, or the built-in defaults
    ///
    /// If `path` is provided it must exist; a missing file is an error
    /// rather than a silent fallback.
    pub fn load(path: Option<&Path>) -> Result<Self, RuleConfigError> {
        match path {
            Some(path) => {
                tracing::info!("Loading transition rules from: {}", path.display());
                let source = std::fs::read_to_string(path).map_err(|e| RuleConfigError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Self::from_toml(&source)
            }
            None => {
                tracing::info!("No rules path specified, using built-in transition rules");
                Self::builtin()
            }
        }
    }

    /// Built-in rules
    pub fn builtin() -> Result<Self, RuleConfigError> {
        Self::from_toml(DEFAULT_TRANSITION_RULES)
    }

    /// Parse and validate rules from a TOML string
    pub fn from_toml(source: &str) -> Result<Self, RuleConfigError> {
        let raw: HashMap<String, Vec<RuleConfig>> =
            toml::from_str(source).map_err(|e| RuleConfigError::Parse(e.to_string()))?;
        Self::from_config(raw)
    }

    /// Validate raw rule configs
    pub fn from_config(raw: HashMap<String, Vec<RuleConfig>>) -> Result<Self, RuleConfigError> {
        let known_permissions: HashSet<&str> = KNOWN_PERMISSIONS.iter().copied().collect();
        let mut rules = HashMap::with_capacity(raw.len());

        for (workflow_type, configs) in raw {
            if configs.is_empty() {
                return Err(RuleConfigError::Empty(workflow_type));
            }

            let mut parsed = Vec::with_capacity(configs.len());
            let mut seen = HashSet::new();
            for config in configs {
                let from = parse_state(&workflow_type, &config.from)?;
                let to = parse_state(&workflow_type, &config.to)?;
                let edge = format!("{from}->{to}");

                if !seen.insert((from, to)) {
                    return Err(RuleConfigError::DuplicateTransition {
                        workflow_type: workflow_type.clone(),
                        edge,
                    });
                }

                let conditions = config
                    .conditions
                    .iter()
                    .map(|name| {
                        name.parse::<Condition>()
                            .map_err(|_| RuleConfigError::UnknownCondition {
                                workflow_type: workflow_type.clone(),
                                edge: edge.clone(),
                                name: name.clone(),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;

                if let Some(name) = config
                    .permissions
                    .iter()
                    .find(|p| !known_permissions.contains(p.as_str()))
                {
                    return Err(RuleConfigError::UnknownPermission {
                        workflow_type: workflow_type.clone(),
                        edge,
                        name: name.clone(),
                    });
                }

                parsed.push(TransitionRule {
                    from,
                    to,
                    conditions,
                    required_permissions: config.permissions,
                });
            }

            check_reachability(&workflow_type, &parsed)?;
            rules.insert(workflow_type, parsed);
        }

        Ok(Self { rules })
    }

    /// Find the rule for an edge
    pub fn find(
        &self,
        workflow_type: &str,
        from: ClinicalState,
        to: ClinicalState,
    ) -> Option<&TransitionRule> {
        self.rules
            .get(workflow_type)?
            .iter()
            .find(|r| r.from == from && r.to == to)
    }

    /// All rules for a workflow type
    pub fn rules_for(&self, workflow_type: &str) -> Option<&[TransitionRule]> {
        self.rules.get(workflow_type).map(Vec::as_slice)
    }

    /// States reachable in one step from `from`
    pub fn targets_from(&self, workflow_type: &str, from: ClinicalState) -> Vec<ClinicalState> {
        self.rules_for(workflow_type)
            .unwrap_or_default()
            .iter()
            .filter(|r| r.from == from)
            .map(|r| r.to)
            .collect()
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.rules.contains_key(workflow_type)
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: BTreeSet<_> = self.rules.keys().collect();
        f.debug_struct("RuleRegistry")
            .field("workflow_types", &types)
            .finish()
    }
}

fn parse_state(workflow_type: &str, name: &str) -> Result<ClinicalState, RuleConfigError> {
    name.parse().map_err(|_| RuleConfigError::UnknownState {
        workflow_type: workflow_type.to_string(),
        name: name.to_string(),
    })
}

/// Every state a rule leaves from must be reachable from `pending`
fn check_reachability(workflow_type: &str, rules: &[TransitionRule]) -> Result<(), RuleConfigError> {
    let mut reachable = HashSet::from([ClinicalState::Pending]);
    let mut queue = VecDeque::from([ClinicalState::Pending]);

    while let Some(state) = queue.pop_front() {
        for rule in rules.iter().filter(|r| r.from == state) {
            if reachable.insert(rule.to) {
                queue.push_back(rule.to);
            }
        }
    }

    match rules.iter().find(|r| !reachable.contains(&r.from)) {
        Some(rule) => Err(RuleConfigError::UnreachableState {
            workflow_type: workflow_type.to_string(),
            state: rule.from,
        }),
        None => Ok(()),
    }
}

/// Errors from loading rules
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleConfigError {
    #[error("failed to read rules file {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse transition rules: {0}")]
    Parse(String),

    #[error("workflow type {0} has no transitions")]
    Empty(String),

    #[error("workflow type {workflow_type}: unknown state {name}")]
    UnknownState { workflow_type: String, name: String },

    #[error("workflow type {workflow_type}: duplicate transition {edge}")]
    DuplicateTransition { workflow_type: String, edge: String },

    #[error("workflow type {workflow_type}: transition {edge} references unknown condition {name}")]
    UnknownCondition {
        workflow_type: String,
        edge: String,
        name: String,
    },

    #[error("workflow type {workflow_type}: transition {edge} references unknown permission {name}")]
    UnknownPermission {
        workflow_type: String,
        edge: String,
        name: String,
    },

    #[error("workflow type {workflow_type}: state {state} is not reachable from pending")]
    UnreachableState {
        workflow_type: String,
        state: ClinicalState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_load() {
        let registry = RuleRegistry::builtin().expect("built-in rules should be valid");

        for workflow_type in ["consultation", "diagnosis", "treatment", "follow_up"] {
            assert!(registry.contains(workflow_type), "missing {workflow_type}");
        }

        let rule = registry
            .find(
                "consultation",
                ClinicalState::Pending,
                ClinicalState::InProgress,
            )
            .unwrap();
        assert_eq!(rule.conditions, vec![Condition::PatientAssigned]);
        assert_eq!(rule.required_permissions, vec!["start_consultation"]);
    }

    #[test]
    fn test_unlisted_edge_is_absent() {
        let registry = RuleRegistry::builtin().unwrap();
        assert!(registry
            .find("consultation", ClinicalState::Pending, ClinicalState::Completed)
            .is_none());
        assert!(registry
            .find("unknown", ClinicalState::Pending, ClinicalState::InProgress)
            .is_none());
    }

    #[test]
    fn test_unknown_condition_rejected() {
        let source = r#"
            [[consultation]]
            from = "pending"
            to = "in_progress"
            conditions = ["stars_aligned"]
        "#;
        let err = RuleRegistry::from_toml(source).unwrap_err();
        assert!(matches!(err, RuleConfigError::UnknownCondition { ref name, .. } if name == "stars_aligned"));
    }

    #[test]
    fn test_unknown_permission_rejected() {
        let source = r#"
            [[consultation]]
            from = "pending"
            to = "in_progress"
            permissions = ["launch_rockets"]
        "#;
        let err = RuleRegistry::from_toml(source).unwrap_err();
        assert!(matches!(err, RuleConfigError::UnknownPermission { .. }));
    }

    #[test]
    fn test_unreachable_state_rejected() {
        let source = r#"
            [[consultation]]
            from = "pending"
            to = "in_progress"

            [[consultation]]
            from = "on_hold"
            to = "completed"
        "#;
        let err = RuleRegistry::from_toml(source).unwrap_err();
        assert_eq!(
            err,
            RuleConfigError::UnreachableState {
                workflow_type: "consultation".to_string(),
                state: ClinicalState::OnHold,
            }
        );
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let source = r#"
            [[consultation]]
            from = "pending"
            to = "in_progress"

            [[consultation]]
            from = "pending"
            to = "in_progress"
        "#;
        assert!(matches!(
            RuleRegistry::from_toml(source),
            Err(RuleConfigError::DuplicateTransition { .. })
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let source = r#"
            [[consultation]]
            from = "pending"
            to = "archived"
        "#;
        assert!(matches!(
            RuleRegistry::from_toml(source),
            Err(RuleConfigError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_targets_from() {
        let registry = RuleRegistry::builtin().unwrap();
        let mut targets = registry.targets_from("consultation", ClinicalState::Pending);
        targets.sort();
        assert_eq!(
            targets,
            vec![ClinicalState::InProgress, ClinicalState::Cancelled]
        );
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = RuleRegistry::load(Some(Path::new("/nonexistent/rules.toml"))).unwrap_err();
        assert!(matches!(err, RuleConfigError::Io { .. }));
    }

    #[test]
    fn test_registry_debug() {
        let registry = RuleRegistry::builtin().unwrap();
        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("consultation"));
    }
}
