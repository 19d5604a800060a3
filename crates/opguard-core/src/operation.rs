//! Operations submitted to the executor.
//!
//! An operation is a command object: an [`OperationDescriptor`] the kernel
//! can introspect (kind, payload, rules, permissions, cacheability) plus a
//! body that runs inside an [`ExecutionScope`].

use std::collections::BTreeSet;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::cache::Fingerprint;
use crate::error::{SecurityFailure, StoreError};
use crate::executor::ExecutionScope;
use crate::validation::{RuleSet, Violation};

/// Operation payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Errors raised by operation bodies.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Business failure reported by the body.
    #[error("operation failed: {0}")]
    Failed(String),

    /// State store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The invocation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The kind's hard deadline passed.
    #[error("deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded {
        /// Time elapsed when the deadline was noticed.
        elapsed_ms: u64,
    },

    /// A nested critical operation failed.
    #[error("nested operation failed: {0}")]
    Nested(#[from] SecurityFailure),
}

impl OperationError {
    /// Shorthand for [`OperationError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        OperationError::Failed(message.into())
    }
}

/// What the kernel knows about an operation.
#[derive(Debug, Clone, Default)]
pub struct OperationDescriptor {
    kind: String,
    payload: Payload,
    rules: RuleSet,
    result_rules: RuleSet,
    required: BTreeSet<String>,
    cacheable: bool,
    tags: BTreeSet<String>,
}

impl OperationDescriptor {
    /// Describe an operation of `kind` with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the input rules.
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Set the rules the result must satisfy.
    pub fn with_result_rules(mut self, rules: RuleSet) -> Self {
        self.result_rules = rules;
        self
    }

    /// Require a permission.
    pub fn require(mut self, permission: impl Into<String>) -> Self {
        self.required.insert(permission.into());
        self
    }

    /// Mark the result as cacheable.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Attach a cache invalidation tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Operation kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Input rules.
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Result rules.
    pub fn result_rules(&self) -> &RuleSet {
        &self.result_rules
    }

    /// Required permissions.
    pub fn required_permissions(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Whether the result may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Cache invalidation tags.
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Cache fingerprint, for cacheable operations only.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.cacheable
            .then(|| Fingerprint::new(self.kind.clone(), &self.payload))
    }
}

/// A unit of critical work.
pub trait Operation {
    /// Kind, payload, rules and permissions.
    fn descriptor(&self) -> &OperationDescriptor;

    /// Run the body. State changes go through `scope`.
    fn execute(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, OperationError>;

    /// Business-rule check of the produced result.
    fn verify(&self, _result: &Value) -> Result<(), Vec<Violation>> {
        Ok(())
    }
}

type Verifier = Box<dyn Fn(&Value) -> Result<(), Vec<Violation>> + Send + Sync>;

/// Operation backed by a closure.
pub struct FnOperation<F> {
    descriptor: OperationDescriptor,
    body: F,
    verifier: Option<Verifier>,
}

impl<F> FnOperation<F>
where
    F: Fn(&mut ExecutionScope<'_>) -> Result<Value, OperationError>,
{
    /// Wrap a closure.
    pub fn new(descriptor: OperationDescriptor, body: F) -> Self {
        Self {
            descriptor,
            body,
            verifier: None,
        }
    }

    /// Attach a result verifier.
    pub fn with_verifier<V>(mut self, verifier: V) -> Self
    where
        V: Fn(&Value) -> Result<(), Vec<Violation>> + Send + Sync + 'static,
    {
        self.verifier = Some(Box::new(verifier));
        self
    }
}

impl<F> Operation for FnOperation<F>
where
    F: Fn(&mut ExecutionScope<'_>) -> Result<Value, OperationError>,
{
    fn descriptor(&self) -> &OperationDescriptor {
        &self.descriptor
    }

    fn execute(&self, scope: &mut ExecutionScope<'_>) -> Result<Value, OperationError> {
        (self.body)(scope)
    }

    fn verify(&self, result: &Value) -> Result<(), Vec<Violation>> {
        match &self.verifier {
            Some(verifier) => verifier(result),
            None => Ok(()),
        }
    }
}

impl<F> fmt::Debug for FnOperation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("descriptor", &self.descriptor)
            .field("verifier", &self.verifier.is_some())
            .finish_non_exhaustive()
    }
}
