//! Permission grants, wildcard matching and the permission registry.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::context::SecurityContext;
use crate::operation::OperationDescriptor;

/// A granted permission, possibly covering many names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Grant {
    /// Every permission (`*`).
    All,
    /// One exact permission name.
    Exact(String),
    /// Names starting with a prefix (`content.*`).
    Prefix(String),
    /// Names ending with a suffix (`*.read`).
    Suffix(String),
}

impl Grant {
    /// Parse a grant string.
    ///
    /// - `*` grants everything
    /// - `content.*` grants names starting with `content.`
    /// - `*.read` grants names ending with `.read`
    /// - anything else is an exact name
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Grant::All
        } else if let Some(prefix) = s.strip_suffix('*') {
            Grant::Prefix(prefix.to_string())
        } else if let Some(suffix) = s.strip_prefix('*') {
            Grant::Suffix(suffix.to_string())
        } else {
            Grant::Exact(s.to_string())
        }
    }

    /// Whether this grant covers a permission name.
    pub fn matches(&self, permission: &str) -> bool {
        match self {
            Grant::All => true,
            Grant::Exact(name) => name == permission,
            Grant::Prefix(prefix) => permission.starts_with(prefix.as_str()),
            Grant::Suffix(suffix) => permission.ends_with(suffix.as_str()),
        }
    }

    /// Whether the grant contains a wildcard.
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Grant::Exact(_))
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::All => write!(f, "*"),
            Grant::Exact(name) => write!(f, "{}", name),
            Grant::Prefix(prefix) => write!(f, "{}*", prefix),
            Grant::Suffix(suffix) => write!(f, "*{}", suffix),
        }
    }
}

/// A set of grants with exact-name fast path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    exact: BTreeSet<String>,
    wildcards: BTreeSet<Grant>,
}

impl PermissionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse grants from strings.
    pub fn from_strings<S: AsRef<str>>(grants: &[S]) -> Self {
        let mut set = Self::new();
        for grant in grants {
            set.add(Grant::parse(grant.as_ref()));
        }
        set
    }

    /// Add a grant.
    pub fn add(&mut self, grant: Grant) {
        match grant {
            Grant::Exact(name) => {
                self.exact.insert(name);
            }
            other => {
                self.wildcards.insert(other);
            }
        }
    }

    /// Remove a grant.
    pub fn remove(&mut self, grant: &Grant) -> bool {
        match grant {
            Grant::Exact(name) => self.exact.remove(name),
            other => self.wildcards.remove(other),
        }
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: &PermissionSet) {
        self.exact.extend(other.exact.iter().cloned());
        self.wildcards.extend(other.wildcards.iter().cloned());
    }

    /// Whether any grant covers `permission`.
    pub fn covers(&self, permission: &str) -> bool {
        self.exact.contains(permission) || self.wildcards.iter().any(|g| g.matches(permission))
    }

    /// Whether the set holds no grants.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }

    /// Number of grants.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    /// All grants as strings.
    pub fn to_strings(&self) -> Vec<String> {
        self.exact
            .iter()
            .cloned()
            .chain(self.wildcards.iter().map(|g| g.to_string()))
            .collect()
    }
}

/// Decides whether a held, context-scoped permission applies to this call.
///
/// Typical validators compare request attributes (owner id, tenant) with
/// fields of the operation payload.
pub trait ContextualValidator: Send + Sync {
    /// Whether the permission applies.
    fn validate(&self, context: &SecurityContext, operation: &OperationDescriptor) -> bool;
}

impl<F> ContextualValidator for F
where
    F: Fn(&SecurityContext, &OperationDescriptor) -> bool + Send + Sync,
{
    fn validate(&self, context: &SecurityContext, operation: &OperationDescriptor) -> bool {
        self(context, operation)
    }
}

/// How a declared permission is checked once held.
#[derive(Clone)]
pub enum PermissionPolicy {
    /// Holding the permission is sufficient.
    Unconditional,
    /// Holding it is necessary; the validator decides per call.
    Contextual(Arc<dyn ContextualValidator>),
}

impl fmt::Debug for PermissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionPolicy::Unconditional => write!(f, "Unconditional"),
            PermissionPolicy::Contextual(_) => write!(f, "Contextual(..)"),
        }
    }
}

/// Registry of every permission an operation may require.
///
/// Permissions are denied unless declared here, even when a wildcard
/// grant would otherwise cover them.
#[derive(Debug, Default)]
pub struct PermissionRegistry {
    policies: RwLock<HashMap<String, PermissionPolicy>>,
}

impl PermissionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a permission that applies whenever it is held.
    pub fn declare(&self, permission: impl Into<String>) {
        self.policies
            .write()
            .insert(permission.into(), PermissionPolicy::Unconditional);
    }

    /// Declare a permission gated by a contextual validator.
    pub fn declare_contextual(
        &self,
        permission: impl Into<String>,
        validator: Arc<dyn ContextualValidator>,
    ) {
        self.policies
            .write()
            .insert(permission.into(), PermissionPolicy::Contextual(validator));
    }

    /// Remove a declaration.
    pub fn undeclare(&self, permission: &str) -> bool {
        self.policies.write().remove(permission).is_some()
    }

    /// Policy for a permission, if declared.
    pub fn policy(&self, permission: &str) -> Option<PermissionPolicy> {
        self.policies.read().get(permission).cloned()
    }

    /// Whether a permission is declared.
    pub fn is_declared(&self, permission: &str) -> bool {
        self.policies.read().contains_key(permission)
    }

    /// Declared permission names, sorted.
    pub fn declared(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_parse_and_match() {
        assert!(Grant::parse("*").matches("anything.at.all"));

        let prefix = Grant::parse("content.*");
        assert_eq!(prefix, Grant::Prefix("content.".into()));
        assert!(prefix.matches("content.edit"));
        assert!(!prefix.matches("media.upload"));

        let suffix = Grant::parse("*.read");
        assert!(suffix.matches("content.read"));
        assert!(!suffix.matches("content.write"));

        let exact = Grant::parse("content.publish");
        assert!(exact.matches("content.publish"));
        assert!(!exact.matches("content.publish.all"));
        assert!(!exact.is_wildcard());
    }

    #[test]
    fn test_grant_display_round_trips() {
        for s in ["*", "content.*", "*.read", "media.upload"] {
            assert_eq!(Grant::parse(s).to_string(), s);
        }
    }

    #[test]
    fn test_permission_set() {
        let mut set = PermissionSet::from_strings(&["content.edit", "media.*"]);
        assert!(set.covers("content.edit"));
        assert!(set.covers("media.delete"));
        assert!(!set.covers("content.delete"));
        assert_eq!(set.len(), 2);

        assert!(set.remove(&Grant::parse("media.*")));
        assert!(!set.covers("media.delete"));
    }

    #[test]
    fn test_registry_declarations() {
        let registry = PermissionRegistry::new();
        registry.declare("content.edit");
        registry.declare_contextual(
            "content.edit_own",
            Arc::new(|ctx: &SecurityContext, _op: &OperationDescriptor| {
                ctx.attribute("owner_id") == Some(ctx.actor_id())
            }),
        );

        assert!(registry.is_declared("content.edit"));
        assert!(matches!(
            registry.policy("content.edit_own"),
            Some(PermissionPolicy::Contextual(_))
        ));
        assert!(registry.policy("content.delete").is_none());
        assert_eq!(registry.declared(), vec!["content.edit", "content.edit_own"]);

        assert!(registry.undeclare("content.edit"));
        assert!(!registry.is_declared("content.edit"));
    }
}
