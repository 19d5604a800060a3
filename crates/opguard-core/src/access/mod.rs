//! Access control.
//!
//! Actors hold roles, roles expand to permission grants, and each permission
//! an operation requires must be both granted and declared in the
//! [`PermissionRegistry`]. Rate limiting and the lockout list live here too,
//! since both are consulted before any state is touched.

mod permission;
mod rate_limit;
mod roles;

pub use permission::{
    ContextualValidator, Grant, PermissionPolicy, PermissionRegistry, PermissionSet,
};
pub use rate_limit::RateLimiter;
pub use roles::{RoleProvider, StaticRoleProvider};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{AccessConfig, RateLimitConfig, RateLimitRule};
use crate::context::SecurityContext;
use crate::operation::OperationDescriptor;

/// Role definition: direct grants plus inherited roles.
#[derive(Debug, Clone, Default)]
pub struct RoleDefinition {
    /// Grants held directly.
    pub grants: PermissionSet,
    /// Roles whose grants are inherited.
    pub inherits: BTreeSet<String>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// Whether every required permission is satisfied.
    pub allowed: bool,
    /// Required permissions that were not satisfied, sorted.
    pub missing: Vec<String>,
    /// Reason recorded in the audit trail when denied.
    pub reason: Option<String>,
}

impl AuthorizationDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            missing: Vec::new(),
            reason: None,
        }
    }

    fn deny(missing: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            missing,
            reason: Some(reason.into()),
        }
    }

    /// Whether access is granted.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Lockout entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lockout {
    /// Why the actor was locked out.
    pub reason: String,
    /// When the lockout started (micros).
    pub since: u64,
}

#[derive(Debug, Clone)]
struct CachedRoles {
    roles: Arc<Vec<String>>,
    fetched_at: u64,
}

/// Access control statistics.
#[derive(Debug, Default)]
pub struct AccessStats {
    role_cache_hits: AtomicU64,
    role_cache_misses: AtomicU64,
    permission_cache_hits: AtomicU64,
    permission_cache_misses: AtomicU64,
    denials: AtomicU64,
}

impl AccessStats {
    /// Actor role lookups served from cache.
    pub fn role_cache_hits(&self) -> u64 {
        self.role_cache_hits.load(Ordering::Relaxed)
    }

    /// Actor role lookups that reached the provider.
    pub fn role_cache_misses(&self) -> u64 {
        self.role_cache_misses.load(Ordering::Relaxed)
    }

    /// Role expansions served from cache.
    pub fn permission_cache_hits(&self) -> u64 {
        self.permission_cache_hits.load(Ordering::Relaxed)
    }

    /// Role expansions computed.
    pub fn permission_cache_misses(&self) -> u64 {
        self.permission_cache_misses.load(Ordering::Relaxed)
    }

    /// Authorization checks that denied access.
    pub fn denials(&self) -> u64 {
        self.denials.load(Ordering::Relaxed)
    }
}

/// Answers whether a context may run an operation.
pub struct AccessControl {
    config: AccessConfig,
    clock: SharedClock,
    provider: Arc<dyn RoleProvider>,
    registry: Arc<PermissionRegistry>,
    limiter: RateLimiter,
    roles: RwLock<HashMap<String, RoleDefinition>>,
    expanded: DashMap<String, Arc<PermissionSet>>,
    actor_roles: DashMap<String, CachedRoles>,
    lockouts: DashMap<String, Lockout>,
    stats: AccessStats,
}

impl AccessControl {
    /// Create access control.
    pub fn new(
        config: AccessConfig,
        rate_limit: RateLimitConfig,
        provider: Arc<dyn RoleProvider>,
        registry: Arc<PermissionRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            limiter: RateLimiter::new(rate_limit, clock.clone()),
            clock,
            provider,
            registry,
            roles: RwLock::new(HashMap::new()),
            expanded: DashMap::new(),
            actor_roles: DashMap::new(),
            lockouts: DashMap::new(),
            stats: AccessStats::default(),
        }
    }

    /// The permission registry.
    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// Statistics.
    pub fn stats(&self) -> &AccessStats {
        &self.stats
    }

    // Role edits clear `expanded` before releasing the roles write lock, and
    // expansions are inserted under the read lock, so a stale expansion can
    // never be cached after an edit.

    /// Define or replace a role with the given grants.
    pub fn define_role<S: AsRef<str>>(&self, role: impl Into<String>, grants: &[S]) {
        let mut roles = self.roles.write();
        roles.insert(
            role.into(),
            RoleDefinition {
                grants: PermissionSet::from_strings(grants),
                inherits: BTreeSet::new(),
            },
        );
        self.expanded.clear();
    }

    /// Make `role` inherit every grant of `parent`.
    pub fn inherit(&self, role: &str, parent: impl Into<String>) {
        let mut roles = self.roles.write();
        roles
            .entry(role.to_string())
            .or_default()
            .inherits
            .insert(parent.into());
        self.expanded.clear();
    }

    /// Add a grant to a role.
    pub fn grant(&self, role: &str, grant: &str) {
        let mut roles = self.roles.write();
        roles
            .entry(role.to_string())
            .or_default()
            .grants
            .add(Grant::parse(grant));
        self.expanded.clear();
        drop(roles);
        debug!(role, grant, "permission granted");
    }

    /// Remove a grant from a role.
    pub fn revoke(&self, role: &str, grant: &str) -> bool {
        let mut roles = self.roles.write();
        let removed = roles
            .get_mut(role)
            .is_some_and(|def| def.grants.remove(&Grant::parse(grant)));
        if removed {
            self.expanded.clear();
        }
        drop(roles);
        if removed {
            debug!(role, grant, "permission revoked");
        }
        removed
    }

    /// Forget cached roles of an actor.
    pub fn invalidate_actor(&self, actor_id: &str) {
        self.actor_roles.remove(actor_id);
    }

    /// Roles held by an actor, sorted.
    pub fn actor_roles(&self, actor_id: &str) -> Arc<Vec<String>> {
        let now = self.clock.now_micros();
        let ttl = self.config.role_cache_ttl_ms.saturating_mul(1_000);

        if let Some(cached) = self.actor_roles.get(actor_id) {
            if now.saturating_sub(cached.fetched_at) < ttl {
                self.stats.role_cache_hits.fetch_add(1, Ordering::Relaxed);
                return cached.roles.clone();
            }
        }

        self.stats.role_cache_misses.fetch_add(1, Ordering::Relaxed);
        let mut roles = self.provider.roles_for(actor_id);
        roles.sort();
        roles.dedup();
        let roles = Arc::new(roles);
        if ttl > 0 {
            self.actor_roles.insert(
                actor_id.to_string(),
                CachedRoles {
                    roles: roles.clone(),
                    fetched_at: now,
                },
            );
        }
        roles
    }

    /// Grants of a role including inherited ones.
    pub fn role_permissions(&self, role: &str) -> Arc<PermissionSet> {
        if let Some(set) = self.expanded.get(role) {
            self.stats
                .permission_cache_hits
                .fetch_add(1, Ordering::Relaxed);
            return set.clone();
        }

        self.stats
            .permission_cache_misses
            .fetch_add(1, Ordering::Relaxed);
        let roles = self.roles.read();
        let set = Arc::new(Self::expand(&roles, role));
        self.expanded.insert(role.to_string(), set.clone());
        set
    }

    fn expand(roles: &HashMap<String, RoleDefinition>, role: &str) -> PermissionSet {
        let mut set = PermissionSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![role.to_string()];

        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(def) = roles.get(&name) {
                set.extend(&def.grants);
                pending.extend(def.inherits.iter().cloned());
            }
        }
        set
    }

    /// Effective grants of the context's actor.
    pub fn permissions_for(&self, context: &SecurityContext) -> PermissionSet {
        let mut set = PermissionSet::new();
        for role in self.actor_roles(context.actor_id()).iter() {
            set.extend(&self.role_permissions(role));
        }
        set
    }

    /// Check every permission the operation requires.
    ///
    /// A permission is satisfied when a grant covers it, it is declared in
    /// the registry, and its contextual validator (if any) accepts the call.
    pub fn authorize(
        &self,
        context: &SecurityContext,
        operation: &OperationDescriptor,
    ) -> AuthorizationDecision {
        let required = operation.required_permissions();

        if let Some(lockout) = self.lockouts.get(context.actor_id()) {
            self.stats.denials.fetch_add(1, Ordering::Relaxed);
            return AuthorizationDecision::deny(
                required.iter().cloned().collect(),
                format!("actor is locked out: {}", lockout.reason),
            );
        }
        if required.is_empty() {
            return AuthorizationDecision::allow();
        }

        let held = self.permissions_for(context);
        let mut missing = Vec::new();
        let mut reasons = Vec::new();

        for permission in required {
            let Some(policy) = self.registry.policy(permission) else {
                missing.push(permission.clone());
                reasons.push(format!("{} is not declared", permission));
                continue;
            };
            if !held.covers(permission) {
                missing.push(permission.clone());
                reasons.push(format!("{} is not granted", permission));
                continue;
            }
            if let PermissionPolicy::Contextual(validator) = policy {
                if !validator.validate(context, operation) {
                    missing.push(permission.clone());
                    reasons.push(format!("{} does not apply in this context", permission));
                }
            }
        }

        if missing.is_empty() {
            AuthorizationDecision::allow()
        } else {
            self.stats.denials.fetch_add(1, Ordering::Relaxed);
            AuthorizationDecision::deny(missing, reasons.join("; "))
        }
    }

    /// Record an attempt against the `(actor or origin, kind)` bucket.
    ///
    /// Returns `false` when the bucket is exhausted for the current window.
    pub fn check_rate_limit(&self, context: &SecurityContext, kind: &str) -> bool {
        let subject = if context.is_anonymous() {
            context.origin()
        } else {
            context.actor_id()
        };
        let allowed = self.limiter.try_acquire(subject, kind);
        if !allowed {
            warn!(subject, kind, "rate limit exceeded");
        }
        allowed
    }

    /// Rate limit rule for an operation kind.
    pub fn rate_limit_rule(&self, kind: &str) -> RateLimitRule {
        self.limiter.rule_for(kind)
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Digest identifying the authorization scope of the context's actor.
    ///
    /// Actors holding the same role set share a scope, so cached results
    /// never cross authorization boundaries.
    pub fn security_scope(&self, context: &SecurityContext) -> String {
        let roles = self.actor_roles(context.actor_id());
        let mut hasher = Sha256::new();
        for role in roles.iter() {
            hasher.update((role.len() as u64).to_be_bytes());
            hasher.update(role.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Deny every future authorization for an actor.
    pub fn lock_out(&self, actor_id: impl Into<String>, reason: impl Into<String>) {
        let actor_id = actor_id.into();
        let reason = reason.into();
        warn!(actor = %actor_id, reason = %reason, "actor locked out");
        self.lockouts.insert(
            actor_id,
            Lockout {
                reason,
                since: self.clock.now_micros(),
            },
        );
    }

    /// Lift a lockout.
    pub fn lift_lockout(&self, actor_id: &str) -> bool {
        self.lockouts.remove(actor_id).is_some()
    }

    /// Lockout of an actor, if any.
    pub fn lockout(&self, actor_id: &str) -> Option<Lockout> {
        self.lockouts.get(actor_id).map(|l| l.clone())
    }

    /// Whether an actor is locked out.
    pub fn is_locked_out(&self, actor_id: &str) -> bool {
        self.lockouts.contains_key(actor_id)
    }
}
