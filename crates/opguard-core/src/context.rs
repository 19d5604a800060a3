//! Security context that flows through every critical operation.
//!
//! A context is built once per external request and shared by reference
//! across all framework calls made on behalf of that request. It is never
//! mutated after construction; nested operations derive a child context.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock::current_timestamp;

/// Actor id used for work initiated by the system itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Actor id used for unauthenticated requests.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Counter for generating unique correlation ids.
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation id from the current timestamp and a counter.
fn generate_correlation_id() -> String {
    let ts = current_timestamp();
    let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    hex::encode(id)
}

/// Identity, origin and session of one external request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    actor_id: String,
    origin: String,
    session_id: String,
    correlation_id: String,
    timestamp: u64,
    attributes: BTreeMap<String, String>,
}

impl SecurityContext {
    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context for work initiated by the system (jobs, maintenance).
    pub fn system(origin: impl Into<String>) -> Self {
        ContextBuilder::default()
            .actor(SYSTEM_ACTOR)
            .origin(origin)
            .session("system")
            .build()
    }

    /// Actor id, or [`SYSTEM_ACTOR`].
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Network origin of the request.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Correlation id tying audit entries of this request together.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Creation time in microseconds since Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Request attributes used by contextual permission validators.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// All request attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Whether the actor is the system actor.
    pub fn is_system(&self) -> bool {
        self.actor_id == SYSTEM_ACTOR
    }

    /// Whether the actor is anonymous (or missing).
    pub fn is_anonymous(&self) -> bool {
        self.actor_id.is_empty() || self.actor_id == ANONYMOUS_ACTOR
    }

    /// Check that identity fields are present.
    ///
    /// Returns the reason when the context is malformed.
    pub fn validate_shape(&self) -> Result<(), String> {
        let mut missing = Vec::new();
        if self.actor_id.trim().is_empty() {
            missing.push("actor_id");
        }
        if self.session_id.trim().is_empty() {
            missing.push("session_id");
        }
        if self.correlation_id.trim().is_empty() {
            missing.push("correlation_id");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing {}", missing.join(", ")))
        }
    }

    /// Derive the context of a nested operation.
    ///
    /// Identity is inherited; the correlation id becomes `{parent}.{seq}`.
    pub fn child(&self, seq: u32) -> Self {
        Self {
            correlation_id: format!("{}.{}", self.correlation_id, seq),
            ..self.clone()
        }
    }

    /// Serializable copy for the audit trail.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            actor_id: self.actor_id.clone(),
            origin: self.origin.clone(),
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            timestamp: self.timestamp,
            attributes: self.attributes.clone(),
        }
    }
}

/// Audit copy of a [`SecurityContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    /// Actor id.
    pub actor_id: String,
    /// Network origin.
    pub origin: String,
    /// Session id.
    pub session_id: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Context creation time (micros).
    pub timestamp: u64,
    /// Request attributes (redacted before persistence).
    pub attributes: BTreeMap<String, String>,
}

/// Builder assembling a [`SecurityContext`] from the ambient request.
#[derive(Debug, Default, Clone)]
pub struct ContextBuilder {
    actor_id: Option<String>,
    origin: Option<String>,
    session_id: Option<String>,
    correlation_id: Option<String>,
    timestamp: Option<u64>,
    attributes: BTreeMap<String, String>,
}

impl ContextBuilder {
    /// Set the actor id.
    pub fn actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Set the network origin.
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the session id.
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Use an upstream correlation id instead of generating one.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Override the creation timestamp (micros).
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a request attribute.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Build the context.
    ///
    /// Missing actor defaults to [`ANONYMOUS_ACTOR`], missing origin to
    /// `"unknown"` and a missing correlation id is generated. The session is
    /// left empty when not supplied so the executor rejects the context.
    pub fn build(self) -> SecurityContext {
        SecurityContext {
            actor_id: self.actor_id.unwrap_or_else(|| ANONYMOUS_ACTOR.to_string()),
            origin: self.origin.unwrap_or_else(|| "unknown".to_string()),
            session_id: self.session_id.unwrap_or_default(),
            correlation_id: self.correlation_id.unwrap_or_else(generate_correlation_id),
            timestamp: self.timestamp.unwrap_or_else(current_timestamp),
            attributes: self.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> SecurityContext {
        SecurityContext::builder()
            .actor("alice")
            .origin("10.0.0.7")
            .session("sess-1")
            .correlation_id("corr-1")
            .attribute("owner_id", "alice")
            .build()
    }

    #[test]
    fn test_builder_fields() {
        let ctx = editor();
        assert_eq!(ctx.actor_id(), "alice");
        assert_eq!(ctx.origin(), "10.0.0.7");
        assert_eq!(ctx.session_id(), "sess-1");
        assert_eq!(ctx.correlation_id(), "corr-1");
        assert_eq!(ctx.attribute("owner_id"), Some("alice"));
        assert!(ctx.validate_shape().is_ok());
        assert!(!ctx.is_anonymous());
    }

    #[test]
    fn test_generated_correlation_ids_are_unique() {
        let a = SecurityContext::builder().session("s").build();
        let b = SecurityContext::builder().session("s").build();
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert_eq!(a.correlation_id().len(), 32);
        assert!(a.is_anonymous());
    }

    #[test]
    fn test_missing_session_is_malformed() {
        let ctx = SecurityContext::builder().actor("bob").build();
        let reason = ctx.validate_shape().unwrap_err();
        assert!(reason.contains("session_id"));
    }

    #[test]
    fn test_blank_actor_is_malformed() {
        let ctx = SecurityContext::builder().actor("  ").session("s").build();
        assert!(ctx.validate_shape().unwrap_err().contains("actor_id"));
    }

    #[test]
    fn test_child_context() {
        let ctx = editor();
        let child = ctx.child(2);
        assert_eq!(child.correlation_id(), "corr-1.2");
        assert_eq!(child.actor_id(), "alice");
        assert_eq!(child.session_id(), "sess-1");
    }

    #[test]
    fn test_system_context() {
        let ctx = SecurityContext::system("scheduler");
        assert!(ctx.is_system());
        assert!(ctx.validate_shape().is_ok());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(editor().snapshot()).unwrap();
        assert_eq!(json["actorId"], "alice");
        assert_eq!(json["correlationId"], "corr-1");
    }
}
