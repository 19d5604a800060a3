//! Audit logging.
//!
//! Every invocation writes exactly one outcome entry (success, failure or
//! unauthorized access). Threshold violations, restore failures and
//! emergencies are written as additional alert entries. Payloads, context
//! attributes and error messages are redacted before any sink sees them.
//! Logging never fails the caller: sink errors are counted and reported
//! through `tracing`.

mod entry;
mod redact;
mod sink;

pub use entry::{format_iso8601, AuditCategory, AuditEntry, AuditOutcome, AuditRecord, ErrorDetail};
pub use redact::Redactor;
pub use sink::{
    read_records, AuditError, AuditSink, JsonLinesAuditSink, MemoryAuditSink, NullAuditSink,
    TracingAuditSink,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::error;

use crate::clock::SharedClock;
use crate::config::AuditConfig;
use crate::context::SecurityContext;
use crate::error::{FailureKind, SecurityFailure};
use crate::monitor::{Metrics, ThresholdReport};
use crate::operation::OperationDescriptor;

/// Writes redacted audit entries to every configured sink.
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
    redactor: Redactor,
    clock: SharedClock,
    written: AtomicU64,
    sink_failures: AtomicU64,
}

impl AuditLogger {
    /// Create a logger without sinks.
    pub fn new(config: &AuditConfig, clock: SharedClock) -> Self {
        Self {
            sinks: Vec::new(),
            redactor: Redactor::new(config),
            clock,
            written: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
        }
    }

    /// Add a sink.
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// The redactor applied to every entry.
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Entries handed to sinks.
    pub fn entries_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Sink writes that failed.
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    fn entry(
        &self,
        context: &SecurityContext,
        kind: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) -> AuditEntry {
        AuditEntry::new(
            self.redactor.redact_context(context.snapshot()),
            kind,
            category,
            outcome,
            self.clock.now_micros(),
        )
    }

    fn with_payload(&self, entry: AuditEntry, operation: &OperationDescriptor) -> AuditEntry {
        let payload = Value::Object(operation.payload().clone());
        entry.with_payload(self.redactor.redact_value(&payload))
    }

    fn emit(&self, entry: AuditEntry) {
        self.written.fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry) {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    error = %e,
                    entry_id = %entry.id,
                    correlation_id = %entry.correlation_id,
                    "audit sink write failed"
                );
            }
        }
    }

    /// Record a successful invocation.
    pub fn log_success(
        &self,
        context: &SecurityContext,
        operation: &OperationDescriptor,
        metrics: Option<&Metrics>,
        cached: bool,
    ) {
        let mut entry = self.with_payload(
            self.entry(
                context,
                operation.kind(),
                AuditCategory::Operation,
                AuditOutcome::Success,
            ),
            operation,
        )
        .with_detail("cached", Value::Bool(cached));
        if let Some(metrics) = metrics {
            entry = entry.with_detail("metrics", metrics.to_json());
        }
        self.emit(entry);
    }

    /// Record a failed invocation.
    ///
    /// `cause` is the internal description; it is scrubbed before writing.
    pub fn log_failure(
        &self,
        context: &SecurityContext,
        operation: &OperationDescriptor,
        failure: &SecurityFailure,
        cause: &str,
    ) {
        let message = if cause.is_empty() {
            failure.to_string()
        } else {
            cause.to_string()
        };
        let mut entry = self
            .with_payload(
                self.entry(
                    context,
                    operation.kind(),
                    AuditCategory::Operation,
                    AuditOutcome::Failure,
                ),
                operation,
            )
            .with_error(failure.kind, self.redactor.scrub_message(&message));
        if !failure.violations().is_empty() {
            entry = entry.with_detail("violations", json!(failure.violations()));
        }
        self.emit(entry);
    }

    /// Record an authorization denial. This is the invocation's outcome
    /// entry; no separate failure entry is written.
    pub fn log_unauthorized_access(
        &self,
        context: &SecurityContext,
        operation: &OperationDescriptor,
        missing: &[String],
        reason: &str,
    ) {
        let entry = self
            .with_payload(
                self.entry(
                    context,
                    operation.kind(),
                    AuditCategory::UnauthorizedAccess,
                    AuditOutcome::Failure,
                ),
                operation,
            )
            .with_error(FailureKind::Unauthorized, self.redactor.scrub_message(reason))
            .with_detail("missing_permissions", json!(missing));
        self.emit(entry);
    }

    /// Record a threshold breach.
    pub fn log_threshold_violation(
        &self,
        context: &SecurityContext,
        kind: &str,
        report: &ThresholdReport,
    ) {
        let entry = self
            .entry(
                context,
                kind,
                AuditCategory::ThresholdViolation,
                AuditOutcome::Alert,
            )
            .with_error(FailureKind::ThresholdViolation, report.summary())
            .with_detail("level", json!(report.level))
            .with_detail("breaches", json!(report.breaches));
        self.emit(entry);
    }

    /// Record compensations that could not be applied.
    pub fn log_restore_failed(&self, context: &SecurityContext, kind: &str, errors: &[String]) {
        let message = errors
            .iter()
            .map(|e| self.redactor.scrub_message(e))
            .collect::<Vec<_>>()
            .join("; ");
        let entry = self
            .entry(context, kind, AuditCategory::RestoreFailed, AuditOutcome::Alert)
            .with_error(FailureKind::RestoreFailed, message)
            .with_detail("failed_compensations", json!(errors.len()));
        self.emit(entry);
    }

    /// Record that the emergency protocol was invoked.
    pub fn log_emergency(
        &self,
        context: &SecurityContext,
        kind: &str,
        trigger: FailureKind,
        reason: &str,
    ) {
        let entry = self
            .entry(context, kind, AuditCategory::Emergency, AuditOutcome::Alert)
            .with_error(trigger, self.redactor.scrub_message(reason));
        self.emit(entry);
    }

    /// Flush every sink. Failures are counted, not returned.
    pub fn flush(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "audit sink flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FailureDetail;
    use crate::validation::Violation;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn write(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
            Err(AuditError::Sink("disk full".into()))
        }
    }

    fn setup() -> (AuditLogger, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::new(&AuditConfig::default(), Arc::new(ManualClock::new(42)))
            .with_sink(sink.clone());
        (logger, sink)
    }

    fn ctx() -> SecurityContext {
        SecurityContext::builder()
            .actor("alice")
            .session("s")
            .correlation_id("corr-1")
            .attribute("session_token", "abc")
            .build()
    }

    fn op() -> OperationDescriptor {
        OperationDescriptor::new("user.register").with_payload(
            json!({"email": "a@example.com", "password": "hunter2"})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn test_success_entry_redacted() {
        let (logger, sink) = setup();
        logger.log_success(&ctx(), &op(), None, false);

        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.outcome, AuditOutcome::Success);
        assert_eq!(entry.timestamp, 42);
        let payload = entry.payload.as_ref().unwrap();
        assert_eq!(payload["password"], "[REDACTED]");
        assert_eq!(payload["email"], "a@example.com");
        assert_eq!(entry.context.attributes["session_token"], "[REDACTED]");
        assert_eq!(entry.details["cached"], Value::Bool(false));
    }

    #[test]
    fn test_failure_message_scrubbed() {
        let (logger, sink) = setup();
        let failure =
            SecurityFailure::new(FailureKind::ExecutionFailed, "corr-1", FailureDetail::Opaque);
        logger.log_failure(&ctx(), &op(), &failure, "smtp rejected password=hunter2");

        let entry = &sink.entries()[0];
        let error = entry.error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::ExecutionFailed);
        assert!(!error.message.contains("hunter2"));
    }

    #[test]
    fn test_validation_failure_carries_violations() {
        let (logger, sink) = setup();
        let failure = SecurityFailure::new(
            FailureKind::ValidationFailed,
            "corr-1",
            FailureDetail::Violations(vec![Violation::new(
                "email",
                "required",
                "field is required",
            )]),
        );
        logger.log_failure(&ctx(), &op(), &failure, "");
        let entry = &sink.entries()[0];
        assert_eq!(entry.details["violations"][0]["field"], "email");
    }

    #[test]
    fn test_unauthorized_entry() {
        let (logger, sink) = setup();
        logger.log_unauthorized_access(
            &ctx(),
            &op(),
            &["user.manage".to_string()],
            "user.manage is not granted",
        );

        let entry = &sink.entries()[0];
        assert_eq!(entry.category, AuditCategory::UnauthorizedAccess);
        assert_eq!(entry.outcome, AuditOutcome::Failure);
        assert_eq!(entry.details["missing_permissions"][0], "user.manage");
    }

    #[test]
    fn test_side_channel_entries_are_alerts() {
        let (logger, sink) = setup();
        logger.log_restore_failed(&ctx(), "media.upload", &["cleanup failed".into()]);
        logger.log_emergency(&ctx(), "media.upload", FailureKind::ResultInvalid, "integrity");

        for entry in sink.entries() {
            assert_eq!(entry.outcome, AuditOutcome::Alert);
            assert!(!entry.category.is_outcome());
        }
    }

    #[test]
    fn test_sink_failure_counted_not_raised() {
        let memory = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::new(&AuditConfig::default(), Arc::new(ManualClock::new(0)))
            .with_sink(Arc::new(FailingSink))
            .with_sink(memory.clone());

        logger.log_success(&ctx(), &op(), None, false);
        assert_eq!(logger.sink_failures(), 1);
        assert_eq!(logger.entries_written(), 1);
        // Other sinks still receive the entry.
        assert_eq!(memory.len(), 1);
    }
}
