//! The critical operation executor.
//!
//! [`Executor::execute`] is the single entry point. It runs the pre-checks
//! (context shape, authorization, rate limit, input rules), consults the
//! result cache for cacheable operations, takes a backup point, opens the
//! invocation's transaction, runs the body under the monitor, verifies the
//! result and commits. Any failure after the backup point rolls back,
//! restores and audits. Exactly one outcome entry is written per
//! invocation.

mod cancel;
mod scope;
mod state;

pub use cancel::CancellationToken;
pub use scope::ExecutionScope;
pub use state::{InvocationState, Lifecycle};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::access::{AccessControl, PermissionRegistry, RoleProvider, StaticRoleProvider};
use crate::audit::{AuditLogger, AuditSink, TracingAuditSink};
use crate::backup::{BackupError, BackupPoint, BackupService, StoreBackupService};
use crate::cache::ResultCache;
use crate::clock::{system_clock, SharedClock};
use crate::config::GuardConfig;
use crate::context::SecurityContext;
use crate::emergency::{EmergencyProtocol, Incident, IncidentReason, LoggingEmergencyProtocol};
use crate::error::{ConfigError, FailureDetail, FailureKind, SecurityFailure, StoreError};
use crate::metrics::{MetricSample, MetricsRegistry, MetricsSink};
use crate::monitor::{
    Metrics, MonitorError, OperationMonitor, ProcessProbe, ResourceProbe, ResourceUsage,
    ThresholdLevel, ThresholdReport,
};
use crate::operation::{Operation, OperationDescriptor, OperationError};
use crate::storage::{StateStore, Transaction};
use crate::validation::{ValidationService, Violation};

/// Successful outcome of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    /// Always `true`; failures are returned as [`SecurityFailure`].
    pub success: bool,
    /// Value produced by the body (or the cache).
    pub payload: Value,
    /// Empty on success.
    pub validation_errors: Vec<Violation>,
    /// Time spent in the execution window.
    pub elapsed: Duration,
    /// Resources consumed by the body.
    pub usage: ResourceUsage,
    /// Correlation id of the invocation.
    pub correlation_id: String,
    /// Whether the payload was served from the result cache.
    pub cached: bool,
    /// Threshold classification of the measurements.
    pub threshold: ThresholdLevel,
    /// States the invocation passed through, ending in `Logged`.
    pub lifecycle: Vec<InvocationState>,
}

/// Executor construction errors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The backup point registry could not be opened.
    #[error("backup service: {0}")]
    Backup(#[from] BackupError),
}

/// Why an invocation failed after the backup point was taken.
enum Fault {
    Body(OperationError),
    Panicked(String),
    Invalid(Vec<Violation>),
    Commit(StoreError),
}

impl Fault {
    fn kind(&self) -> FailureKind {
        match self {
            Fault::Body(_) | Fault::Panicked(_) | Fault::Commit(_) => FailureKind::ExecutionFailed,
            Fault::Invalid(_) => FailureKind::ResultInvalid,
        }
    }

    fn cause(&self) -> String {
        match self {
            Fault::Body(e) => e.to_string(),
            Fault::Panicked(message) => format!("operation panicked: {}", message),
            Fault::Invalid(violations) => {
                let list: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                format!("result failed verification: {}", list.join("; "))
            }
            Fault::Commit(e) => format!("commit failed: {}", e),
        }
    }
}

/// Run operation code, turning a panic into its message.
fn isolate<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Enclosing invocation of a nested one.
struct Parent<'p> {
    backup: &'p mut BackupPoint,
    calls: Arc<AtomicU64>,
    started_at: u64,
}

/// Body outcome that reached commit.
struct Completed {
    value: Value,
    metrics: Option<Metrics>,
    report: ThresholdReport,
}

/// Runs critical operations.
///
/// Collaborators are injected through [`Executor::builder`]. The executor
/// is `Sync`; invocations run on the caller's thread.
pub struct Executor {
    config: GuardConfig,
    store: StateStore,
    access: Arc<AccessControl>,
    validation: Arc<ValidationService>,
    audit: Arc<AuditLogger>,
    monitor: Arc<OperationMonitor>,
    backup: Arc<dyn BackupService>,
    cache: Arc<ResultCache>,
    emergency: Arc<dyn EmergencyProtocol>,
    metrics: Arc<dyn MetricsSink>,
    clock: SharedClock,
}

impl Executor {
    /// Start building an executor over `store`.
    pub fn builder(store: StateStore) -> ExecutorBuilder {
        ExecutorBuilder::new(store)
    }

    /// Configuration.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// State store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Access control.
    pub fn access(&self) -> &Arc<AccessControl> {
        &self.access
    }

    /// Validation service.
    pub fn validation(&self) -> &Arc<ValidationService> {
        &self.validation
    }

    /// Audit logger.
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Operation monitor.
    pub fn monitor(&self) -> &Arc<OperationMonitor> {
        &self.monitor
    }

    /// Result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Clock.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Execute a critical operation.
    pub fn execute(
        &self,
        operation: &dyn Operation,
        context: &SecurityContext,
    ) -> Result<OperationResult, SecurityFailure> {
        self.execute_with_cancellation(operation, context, &CancellationToken::new())
    }

    /// Execute a critical operation that can be cancelled through `cancel`.
    ///
    /// The body observes cancellation at its next
    /// [`ExecutionScope::checkpoint`]; a cancelled invocation fails with
    /// `ExecutionFailed`.
    #[instrument(
        name = "critical_operation",
        skip_all,
        fields(
            kind = %operation.descriptor().kind(),
            correlation_id = %context.correlation_id(),
        )
    )]
    pub fn execute_with_cancellation(
        &self,
        operation: &dyn Operation,
        context: &SecurityContext,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, SecurityFailure> {
        let descriptor = operation.descriptor();
        let started_at = self.clock.now_micros();
        let mut lifecycle = Lifecycle::new();

        self.pre_checks(descriptor, context, &mut lifecycle)?;

        let cacheable = descriptor.fingerprint().filter(|_| self.cache.is_enabled());
        let Some(fingerprint) = cacheable else {
            return self.run_top_level(operation, context, cancel, lifecycle, started_at);
        };

        let scope = self.access.security_scope(context);
        if let Some(value) = self.cache.get(&fingerprint, &scope) {
            self.metrics.record_cache(descriptor.kind(), true);
            return Ok(self.serve_cached(descriptor, context, value, lifecycle, started_at));
        }
        self.metrics.record_cache(descriptor.kind(), false);

        let key = fingerprint.key(&scope);
        self.cache.with_populate_lock(&key, || {
            // Another populator may have finished while we waited.
            if let Some(value) = self.cache.get(&fingerprint, &scope) {
                return Ok(self.serve_cached(descriptor, context, value, lifecycle, started_at));
            }
            let result = self.run_top_level(operation, context, cancel, lifecycle, started_at)?;
            self.cache.put(
                &fingerprint,
                &scope,
                result.payload.clone(),
                self.cache.policy_for(descriptor),
            );
            Ok(result)
        })
    }

    fn run_top_level(
        &self,
        operation: &dyn Operation,
        context: &SecurityContext,
        cancel: &CancellationToken,
        mut lifecycle: Lifecycle,
        started_at: u64,
    ) -> Result<OperationResult, SecurityFailure> {
        let mut txn = self.store.begin();
        let completed = self.run(operation, context, &mut txn, cancel, &mut lifecycle, None)?;
        Ok(OperationResult {
            success: true,
            payload: completed.value,
            validation_errors: Vec::new(),
            elapsed: completed
                .metrics
                .map(|m| m.duration)
                .unwrap_or_else(|| self.clock.elapsed_since(started_at)),
            usage: completed.metrics.map(|m| m.usage).unwrap_or_default(),
            correlation_id: context.correlation_id().to_string(),
            cached: false,
            threshold: completed.report.level,
            lifecycle: lifecycle.history().to_vec(),
        })
    }

    /// Entry point for [`ExecutionScope::execute_nested`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_nested(
        &self,
        operation: &dyn Operation,
        context: &SecurityContext,
        txn: &mut Transaction,
        backup: &mut BackupPoint,
        calls: Arc<AtomicU64>,
        cancel: &CancellationToken,
        started_at: u64,
    ) -> Result<Value, SecurityFailure> {
        let span = tracing::info_span!(
            "nested_operation",
            kind = %operation.descriptor().kind(),
            correlation_id = %context.correlation_id(),
            depth = txn.depth() + 1,
        );
        let _entered = span.enter();

        let mut lifecycle = Lifecycle::new();
        self.pre_checks(operation.descriptor(), context, &mut lifecycle)?;
        let parent = Parent {
            backup,
            calls,
            started_at,
        };
        self.run(operation, context, txn, cancel, &mut lifecycle, Some(parent))
            .map(|completed| completed.value)
    }

    /// Steps 1-4: context, authorization, rate limit, input rules.
    fn pre_checks(
        &self,
        descriptor: &OperationDescriptor,
        context: &SecurityContext,
        lifecycle: &mut Lifecycle,
    ) -> Result<(), SecurityFailure> {
        lifecycle.advance(InvocationState::Validating);
        let kind = descriptor.kind();

        if let Err(reason) = context.validate_shape() {
            return Err(self.reject(
                descriptor,
                context,
                lifecycle,
                FailureKind::InvalidContext,
                FailureDetail::Context(reason.clone()),
                &reason,
            ));
        }

        let decision = self.access.authorize(context, descriptor);
        if !decision.is_allowed() {
            lifecycle.advance(InvocationState::RolledBack);
            let reason = decision
                .reason
                .unwrap_or_else(|| "permission denied".to_string());
            warn!(actor = context.actor_id(), kind, reason = %reason, "unauthorized access");
            self.audit
                .log_unauthorized_access(context, descriptor, &decision.missing, &reason);
            self.metrics.record_rejection(kind, FailureKind::Unauthorized);
            self.escalate(
                context,
                kind,
                IncidentReason::SecurityFailure {
                    kind: FailureKind::Unauthorized,
                },
            );
            lifecycle.advance(InvocationState::Logged);
            return Err(SecurityFailure::new(
                FailureKind::Unauthorized,
                context.correlation_id(),
                FailureDetail::MissingPermissions(decision.missing),
            ));
        }

        if !self.access.check_rate_limit(context, kind) {
            let rule = self.access.rate_limit_rule(kind);
            return Err(self.reject(
                descriptor,
                context,
                lifecycle,
                FailureKind::RateLimited,
                FailureDetail::RateLimited {
                    max_attempts: rule.max_attempts,
                    window_ms: rule.window_ms,
                },
                "",
            ));
        }

        if let Err(violations) = self
            .validation
            .validate_input(descriptor.payload(), descriptor.rules())
        {
            return Err(self.reject(
                descriptor,
                context,
                lifecycle,
                FailureKind::ValidationFailed,
                FailureDetail::Violations(violations),
                "",
            ));
        }
        Ok(())
    }

    /// Steps 5-12.
    fn run(
        &self,
        operation: &dyn Operation,
        context: &SecurityContext,
        txn: &mut Transaction,
        cancel: &CancellationToken,
        lifecycle: &mut Lifecycle,
        parent: Option<Parent<'_>>,
    ) -> Result<Completed, SecurityFailure> {
        let descriptor = operation.descriptor();
        let kind = descriptor.kind();

        let mut point = match self.backup.create_snapshot(kind, context) {
            Ok(point) => point,
            Err(e) => {
                lifecycle.advance(InvocationState::RolledBack);
                let failure = self.fail(
                    descriptor,
                    context,
                    FailureKind::ExecutionFailed,
                    FailureDetail::Opaque,
                    &format!("backup snapshot failed: {}", e),
                );
                lifecycle.advance(InvocationState::Logged);
                return Err(failure);
            }
        };
        lifecycle.advance(InvocationState::BackedUp);

        let mut guard = txn.enter();
        lifecycle.advance(InvocationState::Transacting);

        // Nested invocations run inside the parent's monitored window.
        let (window, calls, started_at) = match &parent {
            Some(parent) => (None, parent.calls.clone(), parent.started_at),
            None => match self.monitor.admit(kind, context) {
                Ok(window) => {
                    let calls = window
                        .id()
                        .and_then(|id| self.monitor.call_counter(id).ok())
                        .unwrap_or_else(|| Arc::new(AtomicU64::new(0)));
                    (Some(window), calls, self.clock.now_micros())
                }
                Err(e) => {
                    guard.rollback();
                    self.restore(context, kind, point);
                    lifecycle.advance(InvocationState::RolledBack);
                    let (failure_kind, detail) = match e {
                        MonitorError::TooManyConcurrent { limit } => (
                            FailureKind::TooManyConcurrentOperations,
                            FailureDetail::ConcurrencyLimit { limit },
                        ),
                        MonitorError::UnknownId(_) => {
                            (FailureKind::ExecutionFailed, FailureDetail::Opaque)
                        }
                    };
                    self.metrics.record_rejection(kind, failure_kind);
                    let failure =
                        self.fail(descriptor, context, failure_kind, detail, &e.to_string());
                    lifecycle.advance(InvocationState::Logged);
                    return Err(failure);
                }
            },
        };
        lifecycle.advance(InvocationState::Monitoring);

        let outcome = {
            let mut scope = ExecutionScope::new(
                self,
                context,
                descriptor,
                &mut guard,
                &mut point,
                calls,
                cancel,
                started_at,
                self.monitor.deadline_for(kind),
            );
            isolate(|| operation.execute(&mut scope))
        };

        let outcome = match outcome {
            Ok(Ok(value)) => {
                lifecycle.advance(InvocationState::Verifying);
                self.verify(operation, &value).map(|()| value)
            }
            Ok(Err(e)) => Err(Fault::Body(e)),
            Err(message) => {
                error!(kind, panic = %message, "operation body panicked");
                Err(Fault::Panicked(message))
            }
        };

        let metrics = window.and_then(|window| match window.finish() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                error!(error = %e, "monitor stop failed");
                None
            }
        });
        let report = match &metrics {
            Some(metrics) => self.observe_thresholds(context, kind, metrics),
            None => ThresholdReport::normal(),
        };

        let outcome = match outcome {
            Ok(value) => guard.commit().map(|()| value).map_err(Fault::Commit),
            Err(fault) => {
                guard.rollback();
                Err(fault)
            }
        };

        match outcome {
            Ok(value) => {
                lifecycle.advance(InvocationState::Committed);
                if let Some(parent) = parent {
                    parent.backup.extend(point.take_compensations());
                }
                self.backup.discard(point);
                if let Some(metrics) = &metrics {
                    self.record_sample(kind, metrics, None);
                }
                self.audit
                    .log_success(context, descriptor, metrics.as_ref(), false);
                lifecycle.advance(InvocationState::Logged);
                info!(
                    kind,
                    correlation_id = context.correlation_id(),
                    threshold = %report.level,
                    "operation committed"
                );
                Ok(Completed {
                    value,
                    metrics,
                    report,
                })
            }
            Err(fault) => {
                lifecycle.advance(InvocationState::RolledBack);
                self.restore(context, kind, point);
                if let Some(metrics) = &metrics {
                    self.record_sample(kind, metrics, Some(fault.kind()));
                }
                let failure = self.fail(
                    descriptor,
                    context,
                    fault.kind(),
                    FailureDetail::Opaque,
                    &fault.cause(),
                );
                lifecycle.advance(InvocationState::Logged);
                Err(failure)
            }
        }
    }

    /// Structural result rules plus the operation's own check.
    fn verify(&self, operation: &dyn Operation, value: &Value) -> Result<(), Fault> {
        let mut violations = self
            .validation
            .validate_result(value, operation.descriptor().result_rules())
            .err()
            .unwrap_or_default();
        match isolate(|| operation.verify(value)) {
            Ok(Ok(())) => {}
            Ok(Err(business)) => violations.extend(business),
            Err(message) => {
                error!(kind = operation.descriptor().kind(), panic = %message, "verifier panicked");
                return Err(Fault::Panicked(message));
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Fault::Invalid(violations))
        }
    }

    fn serve_cached(
        &self,
        descriptor: &OperationDescriptor,
        context: &SecurityContext,
        value: Value,
        mut lifecycle: Lifecycle,
        started_at: u64,
    ) -> OperationResult {
        lifecycle.advance(InvocationState::Committed);
        self.audit.log_success(context, descriptor, None, true);
        lifecycle.advance(InvocationState::Logged);
        OperationResult {
            lifecycle: lifecycle.history().to_vec(),
            success: true,
            payload: value,
            validation_errors: Vec::new(),
            elapsed: self.clock.elapsed_since(started_at),
            usage: ResourceUsage::default(),
            correlation_id: context.correlation_id().to_string(),
            cached: true,
            threshold: ThresholdLevel::Normal,
        }
    }

    fn observe_thresholds(
        &self,
        context: &SecurityContext,
        kind: &str,
        metrics: &Metrics,
    ) -> ThresholdReport {
        let report = self.monitor.evaluate(kind, metrics);
        if !report.is_breach() {
            return report;
        }
        warn!(kind, level = %report.level, summary = %report.summary(), "threshold violation");
        self.metrics.record_threshold(kind, report.level);
        self.audit.log_threshold_violation(context, kind, &report);
        if report.is_critical() {
            self.escalate(
                context,
                kind,
                IncidentReason::CriticalThreshold {
                    summary: report.summary(),
                },
            );
        }
        report
    }

    fn record_sample(&self, kind: &str, metrics: &Metrics, failure: Option<FailureKind>) {
        let sample = MetricSample::new(kind, metrics, failure, self.clock.now_micros());
        self.metrics.record_sample(&sample);
    }

    /// Pre-check failure: nothing to roll back.
    fn reject(
        &self,
        descriptor: &OperationDescriptor,
        context: &SecurityContext,
        lifecycle: &mut Lifecycle,
        kind: FailureKind,
        detail: FailureDetail,
        cause: &str,
    ) -> SecurityFailure {
        lifecycle.advance(InvocationState::RolledBack);
        self.metrics.record_rejection(descriptor.kind(), kind);
        let failure = self.fail(descriptor, context, kind, detail, cause);
        lifecycle.advance(InvocationState::Logged);
        failure
    }

    /// Audit a failure and escalate security-critical kinds.
    fn fail(
        &self,
        descriptor: &OperationDescriptor,
        context: &SecurityContext,
        kind: FailureKind,
        detail: FailureDetail,
        cause: &str,
    ) -> SecurityFailure {
        let failure = SecurityFailure::new(kind, context.correlation_id(), detail);
        warn!(
            kind = descriptor.kind(),
            failure = %kind,
            correlation_id = context.correlation_id(),
            "operation failed"
        );
        self.audit.log_failure(context, descriptor, &failure, cause);
        if kind.is_security_critical() {
            self.escalate(context, descriptor.kind(), IncidentReason::SecurityFailure { kind });
        }
        failure
    }

    fn escalate(&self, context: &SecurityContext, kind: &str, reason: IncidentReason) {
        let incident = Incident::new(context, kind, reason, self.clock.now_micros());
        self.emergency.invoke(&incident);
        self.audit.log_emergency(
            context,
            kind,
            incident.reason.failure_kind(),
            &incident.describe(),
        );
        self.metrics.record_emergency(kind);
    }

    fn restore(&self, context: &SecurityContext, kind: &str, point: BackupPoint) {
        match self.backup.restore(point) {
            Ok(()) => {}
            Err(BackupError::RestoreFailed { failures }) => {
                error!(kind, failed = failures.len(), "restore failed");
                self.audit.log_restore_failed(context, kind, &failures);
            }
            Err(e) => {
                error!(kind, error = %e, "restore failed");
                self.audit
                    .log_restore_failed(context, kind, &[e.to_string()]);
            }
        }
    }
}

/// Builder for [`Executor`].
pub struct ExecutorBuilder {
    store: StateStore,
    config: GuardConfig,
    clock: Option<SharedClock>,
    roles: Option<Arc<dyn RoleProvider>>,
    registry: Option<Arc<PermissionRegistry>>,
    access: Option<Arc<AccessControl>>,
    validation: Option<Arc<ValidationService>>,
    audit_sinks: Vec<Arc<dyn AuditSink>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    backup: Option<Arc<dyn BackupService>>,
    emergency: Option<Arc<dyn EmergencyProtocol>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ExecutorBuilder {
    /// Start with default configuration.
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            config: GuardConfig::default(),
            clock: None,
            roles: None,
            registry: None,
            access: None,
            validation: None,
            audit_sinks: Vec::new(),
            probe: None,
            backup: None,
            emergency: None,
            metrics: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the clock (defaults to the system clock).
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the role provider used by the default access control.
    pub fn role_provider(mut self, roles: Arc<dyn RoleProvider>) -> Self {
        self.roles = Some(roles);
        self
    }

    /// Set the permission registry used by the default access control.
    pub fn permission_registry(mut self, registry: Arc<PermissionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a pre-built access control.
    pub fn access(mut self, access: Arc<AccessControl>) -> Self {
        self.access = Some(access);
        self
    }

    /// Use a pre-built validation service.
    pub fn validation(mut self, validation: Arc<ValidationService>) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Add an audit sink. Without any, entries go to `tracing`.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks.push(sink);
        self
    }

    /// Set the resource probe (defaults to the process probe).
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Set the backup service (defaults to the store-backed service).
    pub fn backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Set the emergency protocol (defaults to logging).
    pub fn emergency(mut self, emergency: Arc<dyn EmergencyProtocol>) -> Self {
        self.emergency = Some(emergency);
        self
    }

    /// Set the metrics sink (defaults to a fresh registry).
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and assemble the executor.
    pub fn build(self) -> Result<Executor, BuildError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);

        let validation = self
            .validation
            .unwrap_or_else(|| Arc::new(ValidationService::new(config.validation)));

        let access = match self.access {
            Some(access) => access,
            None => {
                let roles = self.roles.unwrap_or_else(|| {
                    Arc::new(StaticRoleProvider::new()) as Arc<dyn RoleProvider>
                });
                let registry = self
                    .registry
                    .unwrap_or_else(|| Arc::new(PermissionRegistry::new()));
                Arc::new(AccessControl::new(
                    config.access,
                    config.rate_limit.clone(),
                    roles,
                    registry,
                    clock.clone(),
                ))
            }
        };

        let mut audit = AuditLogger::new(&config.audit, clock.clone());
        if self.audit_sinks.is_empty() {
            audit = audit.with_sink(Arc::new(TracingAuditSink));
        }
        for sink in self.audit_sinks {
            audit = audit.with_sink(sink);
        }

        let monitor = OperationMonitor::new(
            config.monitor.clone(),
            clock.clone(),
            self.probe
                .unwrap_or_else(|| Arc::new(ProcessProbe::new()) as Arc<dyn ResourceProbe>),
        );

        let backup: Arc<dyn BackupService> = match self.backup {
            Some(backup) => backup,
            None => Arc::new(StoreBackupService::open(self.store.clone(), clock.clone())?),
        };

        let cache = ResultCache::new(config.cache.clone(), validation.clone(), clock.clone());

        Ok(Executor {
            store: self.store,
            access,
            validation,
            audit: Arc::new(audit),
            monitor: Arc::new(monitor),
            backup,
            cache: Arc::new(cache),
            emergency: self.emergency.unwrap_or_else(|| {
                Arc::new(LoggingEmergencyProtocol) as Arc<dyn EmergencyProtocol>
            }),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(MetricsRegistry::new()) as Arc<dyn MetricsSink>),
            clock,
            config,
        })
    }
}
