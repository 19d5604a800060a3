//! opguard core - critical operation execution.
//!
//! Mutating operations are funnelled through one [`Executor`] that checks
//! the caller's context, permissions, rate limit and input, takes a backup
//! point, runs the operation in a transaction under monitoring, verifies
//! the result, commits or rolls back, and writes an audit trail. Results of
//! cacheable operations are memoized under security-scoped keys.

pub mod access;
pub mod audit;
pub mod backup;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod emergency;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod operation;
pub mod storage;
pub mod validation;

pub use access::{
    AccessControl, AuthorizationDecision, ContextualValidator, Grant, PermissionPolicy,
    PermissionRegistry, PermissionSet, RoleProvider, StaticRoleProvider,
};
pub use audit::{
    AuditCategory, AuditEntry, AuditLogger, AuditOutcome, AuditRecord, AuditSink,
    JsonLinesAuditSink, MemoryAuditSink, NullAuditSink, TracingAuditSink,
};
pub use backup::{BackupError, BackupPoint, BackupService, Compensation, StoreBackupService};
pub use cache::{CacheKey, CachePolicy, Fingerprint, ResultCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GuardConfig;
pub use context::{ContextBuilder, SecurityContext};
pub use emergency::{
    EmergencyProtocol, Incident, IncidentReason, LockoutEmergencyProtocol,
    LoggingEmergencyProtocol, RecordingEmergencyProtocol,
};
pub use error::{ConfigError, FailureDetail, FailureKind, SecurityFailure, StoreError};
pub use executor::{
    BuildError, CancellationToken, ExecutionScope, Executor, ExecutorBuilder, InvocationState,
    OperationResult,
};
pub use metrics::{
    new_shared_registry, MetricSample, MetricsRegistry, MetricsSink, SharedMetricsRegistry,
};
pub use monitor::{Metrics, OperationMonitor, ResourceUsage, ThresholdLevel};
pub use operation::{FnOperation, Operation, OperationDescriptor, OperationError, Payload};
pub use storage::{StateStore, StoreConfig, Transaction, TransactionGuard};
pub use validation::{Constraint, RuleSet, ValidationService, ValueType, Violation};
