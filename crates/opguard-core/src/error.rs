//! Core error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::Violation;

/// Failure taxonomy shared by the executor, the audit trail and callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The security context is malformed.
    InvalidContext,
    /// The context lacks a required permission.
    Unauthorized,
    /// The (actor, kind) bucket is exhausted for the current window.
    RateLimited,
    /// Operation input violated its declared rules.
    ValidationFailed,
    /// The operation body, or the commit that follows it, failed.
    ExecutionFailed,
    /// The produced result failed post-execution verification.
    ResultInvalid,
    /// A monitored metric exceeded its ceiling (side-channel event).
    ThresholdViolation,
    /// Compensations could not be fully applied (side-channel event).
    RestoreFailed,
    /// The monitor refused admission.
    TooManyConcurrentOperations,
}

impl FailureKind {
    /// Stable name used in audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InvalidContext => "InvalidContext",
            FailureKind::Unauthorized => "Unauthorized",
            FailureKind::RateLimited => "RateLimited",
            FailureKind::ValidationFailed => "ValidationFailed",
            FailureKind::ExecutionFailed => "ExecutionFailed",
            FailureKind::ResultInvalid => "ResultInvalid",
            FailureKind::ThresholdViolation => "ThresholdViolation",
            FailureKind::RestoreFailed => "RestoreFailed",
            FailureKind::TooManyConcurrentOperations => "TooManyConcurrentOperations",
        }
    }

    /// Whether this kind can be returned from `Executor::execute`.
    pub fn is_caller_visible(&self) -> bool {
        !matches!(
            self,
            FailureKind::ThresholdViolation | FailureKind::RestoreFailed
        )
    }

    /// Access and integrity violations escalate to the emergency protocol.
    pub fn is_security_critical(&self) -> bool {
        matches!(self, FailureKind::Unauthorized | FailureKind::ResultInvalid)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing detail attached to a [`SecurityFailure`].
///
/// Only actionable information is carried here. Internal causes of execution
/// and integrity failures stay in the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDetail {
    /// Which part of the context is malformed.
    Context(String),
    /// Permissions the context does not hold.
    MissingPermissions(Vec<String>),
    /// Rate limit that was hit.
    RateLimited {
        /// Attempts allowed per window.
        max_attempts: u32,
        /// Window length in milliseconds.
        window_ms: u64,
    },
    /// Rule violations on the input.
    Violations(Vec<Violation>),
    /// Concurrency ceiling that refused admission.
    ConcurrencyLimit {
        /// Configured ceiling.
        limit: usize,
    },
    /// No detail beyond kind and correlation id.
    Opaque,
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureDetail::Context(reason) => write!(f, ": {}", reason),
            FailureDetail::MissingPermissions(perms) => {
                write!(f, ": missing permissions [{}]", perms.join(", "))
            }
            FailureDetail::RateLimited {
                max_attempts,
                window_ms,
            } => write!(f, ": limit of {} attempts per {}ms", max_attempts, window_ms),
            FailureDetail::Violations(violations) => {
                let fields: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                write!(f, ": {}", fields.join("; "))
            }
            FailureDetail::ConcurrencyLimit { limit } => {
                write!(f, ": {} operations already in flight", limit)
            }
            FailureDetail::Opaque => Ok(()),
        }
    }
}

/// The single error type returned from the executor.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} (correlation id {correlation_id}){detail}")]
pub struct SecurityFailure {
    /// Failure kind.
    pub kind: FailureKind,
    /// Correlation id for support lookup in the audit trail.
    pub correlation_id: String,
    /// Actionable detail, if any.
    pub detail: FailureDetail,
}

impl SecurityFailure {
    /// Create a new failure.
    pub fn new(
        kind: FailureKind,
        correlation_id: impl Into<String>,
        detail: FailureDetail,
    ) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.into(),
            detail,
        }
    }

    /// Rule violations, if this is a validation failure.
    pub fn violations(&self) -> &[Violation] {
        match &self.detail {
            FailureDetail::Violations(v) => v,
            _ => &[],
        }
    }

    /// Missing permissions, if this is an authorization failure.
    pub fn missing_permissions(&self) -> &[String] {
        match &self.detail {
            FailureDetail::MissingPermissions(p) => p,
            _ => &[],
        }
    }
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A key read by the transaction changed before commit.
    #[error("transaction conflict on key '{key}'")]
    Conflict {
        /// Key whose value changed.
        key: String,
    },

    /// Transaction misuse or failure.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
