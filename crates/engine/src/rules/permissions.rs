//! Permission lookup
//!
//! Permissions are resolved through roles. The lookup is an external
//! collaborator; [`RolePermissionTable`] is the in-process implementation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::workflow::Actor;

/// Permission names transition rules may reference
pub const KNOWN_PERMISSIONS: &[&str] = &[
    "start_consultation",
    "complete_consultation",
    "start_workflow",
    "complete_workflow",
    "hold_workflow",
    "resume_workflow",
    "cancel_workflow",
    "fail_workflow",
    "reopen_workflow",
];

/// Error type for permission lookups
#[derive(Debug, thiserror::Error)]
pub enum PermissionLookupError {
    #[error("permission lookup unavailable: {0}")]
    Unavailable(String),
}

/// Role to permission resolution
#[async_trait]
pub trait PermissionLookup: Send + Sync + 'static {
    /// All permissions granted to the actor
    async fn permissions_for(&self, actor: &Actor) -> Result<HashSet<String>, PermissionLookupError>;
}

/// Static role table
#[derive(Debug, Clone, Default)]
pub struct RolePermissionTable {
    roles: HashMap<String, HashSet<String>>,
}

impl RolePermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant permissions to a role
    pub fn grant<I, S>(mut self, role: &str, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles
            .entry(role.to_string())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Default clinical roles
    pub fn clinical_defaults() -> Self {
        Self::new()
            .grant("doctor", KNOWN_PERMISSIONS.iter().copied())
            .grant(
                "nurse",
                [
                    "start_workflow",
                    "complete_workflow",
                    "hold_workflow",
                    "resume_workflow",
                ],
            )
            .grant("receptionist", ["cancel_workflow", "hold_workflow"])
            .grant("admin", KNOWN_PERMISSIONS.iter().copied())
    }
}

#[async_trait]
impl PermissionLookup for RolePermissionTable {
    async fn permissions_for(&self, actor: &Actor) -> Result<HashSet<String>, PermissionLookupError> {
        Ok(actor
            .roles
            .iter()
            .filter_map(|role| self.roles.get(role))
            .flatten()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permissions_union_over_roles() {
        let table = RolePermissionTable::new()
            .grant("a", ["p1"])
            .grant("b", ["p2"]);
        let actor = Actor::new("u").with_role("a").with_role("b").with_role("ghost");

        let perms = table.permissions_for(&actor).await.unwrap();
        assert_eq!(perms.len(), 2);
        assert!(perms.contains("p1") && perms.contains("p2"));
    }

    #[tokio::test]
    async fn test_clinical_defaults() {
        let table = RolePermissionTable::clinical_defaults();
        let nurse = Actor::new("n").with_role("nurse");
        let perms = table.permissions_for(&nurse).await.unwrap();
        assert!(!perms.contains("start_consultation"));
        assert!(perms.contains("hold_workflow"));
    }
}
