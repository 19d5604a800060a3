//! Role resolution for actors.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Resolves the roles an actor holds.
///
/// Implementations usually query the host's user store; results are cached
/// by [`AccessControl`](super::AccessControl).
pub trait RoleProvider: Send + Sync {
    /// Roles held by `actor_id`.
    fn roles_for(&self, actor_id: &str) -> Vec<String>;
}

/// In-memory role assignments.
#[derive(Debug, Default)]
pub struct StaticRoleProvider {
    assignments: RwLock<HashMap<String, BTreeSet<String>>>,
    lookups: AtomicU64,
}

impl StaticRoleProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a role to an actor.
    pub fn assign(&self, actor_id: impl Into<String>, role: impl Into<String>) {
        self.assignments
            .write()
            .entry(actor_id.into())
            .or_default()
            .insert(role.into());
    }

    /// Remove a role from an actor.
    pub fn unassign(&self, actor_id: &str, role: &str) -> bool {
        self.assignments
            .write()
            .get_mut(actor_id)
            .is_some_and(|roles| roles.remove(role))
    }

    /// Number of times roles were resolved.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl RoleProvider for StaticRoleProvider {
    fn roles_for(&self, actor_id: &str) -> Vec<String> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.assignments
            .read()
            .get(actor_id)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_and_unassign() {
        let provider = StaticRoleProvider::new();
        provider.assign("alice", "editor");
        provider.assign("alice", "author");
        assert_eq!(provider.roles_for("alice"), vec!["author", "editor"]);
        assert!(provider.roles_for("bob").is_empty());

        assert!(provider.unassign("alice", "author"));
        assert!(!provider.unassign("alice", "author"));
        assert_eq!(provider.roles_for("alice"), vec!["editor"]);
        assert_eq!(provider.lookups(), 3);
    }
}
