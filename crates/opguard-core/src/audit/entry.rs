//! Audit entries and the operator-facing record format.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::current_timestamp;
use crate::context::ContextSnapshot;
use crate::error::FailureKind;

/// Counter for generating unique entry ids.
static ENTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique entry id from timestamp and counter.
fn generate_entry_id() -> String {
    let ts = current_timestamp();
    let counter = ENTRY_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    hex::encode(id)
}

/// What an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Final outcome of an invocation.
    Operation,
    /// Authorization denial (the invocation's failure entry).
    UnauthorizedAccess,
    /// Monitored metric above its ceiling.
    ThresholdViolation,
    /// Compensations could not all be applied.
    RestoreFailed,
    /// Emergency protocol invoked.
    Emergency,
}

impl AuditCategory {
    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Operation => "operation",
            AuditCategory::UnauthorizedAccess => "unauthorized_access",
            AuditCategory::ThresholdViolation => "threshold_violation",
            AuditCategory::RestoreFailed => "restore_failed",
            AuditCategory::Emergency => "emergency",
        }
    }

    /// Whether entries of this category count toward the one-per-invocation
    /// outcome entry.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            AuditCategory::Operation | AuditCategory::UnauthorizedAccess
        )
    }
}

/// Outcome recorded by an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The invocation succeeded.
    Success,
    /// The invocation failed.
    Failure,
    /// Side-channel event that does not change the outcome.
    Alert,
}

impl AuditOutcome {
    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Alert => "alert",
        }
    }
}

/// Failure kind and redacted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Failure kind.
    pub kind: FailureKind,
    /// Message with sensitive values scrubbed.
    pub message: String,
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Unique entry id (hex).
    pub id: String,
    /// Correlation id of the invocation.
    pub correlation_id: String,
    /// Operation kind.
    pub kind: String,
    /// Redacted context snapshot.
    pub context: ContextSnapshot,
    /// Entry category.
    pub category: AuditCategory,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Failure detail, if any.
    pub error: Option<ErrorDetail>,
    /// Redacted operation payload, if recorded.
    pub payload: Option<Value>,
    /// Structured extras (metrics, missing permissions, cache flag).
    pub details: Map<String, Value>,
    /// When the entry was written (micros).
    pub timestamp: u64,
}

impl AuditEntry {
    /// Create an entry for a context snapshot.
    pub fn new(
        context: ContextSnapshot,
        kind: impl Into<String>,
        category: AuditCategory,
        outcome: AuditOutcome,
        timestamp: u64,
    ) -> Self {
        Self {
            id: generate_entry_id(),
            correlation_id: context.correlation_id.clone(),
            kind: kind.into(),
            context,
            category,
            outcome,
            error: None,
            payload: None,
            details: Map::new(),
            timestamp,
        }
    }

    /// Attach failure detail.
    pub fn with_error(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetail {
            kind,
            message: message.into(),
        });
        self
    }

    /// Attach the (already redacted) payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a structured detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Timestamp rendered as ISO-8601 (UTC, microsecond precision).
    pub fn timestamp_iso8601(&self) -> String {
        format_iso8601(self.timestamp)
    }

    /// Format the entry as a log line.
    pub fn to_log_line(&self) -> String {
        let error = match &self.error {
            Some(e) => format!(" error={} message={:?}", e.kind, e.message),
            None => String::new(),
        };
        format!(
            "{} id={} corr={} actor={} origin={} {} kind={} outcome={}{}",
            self.timestamp_iso8601(),
            self.id,
            self.correlation_id,
            self.context.actor_id,
            self.context.origin,
            self.category.as_str().to_uppercase(),
            self.kind,
            self.outcome.as_str(),
            error
        )
    }

    /// Operator record for this entry.
    pub fn to_record(&self) -> AuditRecord {
        AuditRecord {
            correlation_id: self.correlation_id.clone(),
            kind: self.kind.clone(),
            outcome: self.outcome,
            error_kind: self.error.as_ref().map(|e| e.kind),
            error_message: self.error.as_ref().map(|e| e.message.clone()),
            timestamp_iso8601: self.timestamp_iso8601(),
            category: self.category,
            actor: self.context.actor_id.clone(),
        }
    }
}

/// Render micros since Unix epoch as RFC 3339.
pub fn format_iso8601(micros: u64) -> String {
    let secs = (micros / 1_000_000) as i64;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    match Utc.timestamp_opt(secs, nanos).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        None => micros.to_string(),
    }
}

/// Serialized audit record, one per line in JSON-lines logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Correlation id.
    pub correlation_id: String,
    /// Operation kind.
    pub kind: String,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Failure kind, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    /// Redacted failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Entry time in ISO-8601.
    #[serde(rename = "timestampIso8601")]
    pub timestamp_iso8601: String,
    /// Entry category.
    pub category: AuditCategory,
    /// Actor id.
    pub actor: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SecurityContext;

    fn snapshot() -> ContextSnapshot {
        SecurityContext::builder()
            .actor("alice")
            .origin("10.0.0.7")
            .session("s")
            .correlation_id("corr-9")
            .build()
            .snapshot()
    }

    #[test]
    fn test_entry_fields() {
        let entry = AuditEntry::new(
            snapshot(),
            "content.create",
            AuditCategory::Operation,
            AuditOutcome::Failure,
            1_700_000_000_000_000,
        )
        .with_error(FailureKind::ExecutionFailed, "disk full");

        assert_eq!(entry.correlation_id, "corr-9");
        assert_eq!(entry.error.as_ref().unwrap().kind, FailureKind::ExecutionFailed);
        assert_eq!(entry.id.len(), 32);
    }

    #[test]
    fn test_iso8601_rendering() {
        assert_eq!(format_iso8601(0), "1970-01-01T00:00:00.000000Z");
        assert_eq!(
            format_iso8601(1_700_000_000_123_456),
            "2023-11-14T22:13:20.123456Z"
        );
    }

    #[test]
    fn test_log_line() {
        let entry = AuditEntry::new(
            snapshot(),
            "content.create",
            AuditCategory::UnauthorizedAccess,
            AuditOutcome::Failure,
            0,
        )
        .with_error(FailureKind::Unauthorized, "content.publish is not granted");
        let line = entry.to_log_line();

        assert!(line.contains("UNAUTHORIZED_ACCESS"));
        assert!(line.contains("corr=corr-9"));
        assert!(line.contains("actor=alice"));
        assert!(line.contains("error=Unauthorized"));
    }

    #[test]
    fn test_record_json_shape() {
        let entry = AuditEntry::new(
            snapshot(),
            "content.create",
            AuditCategory::Operation,
            AuditOutcome::Success,
            0,
        );
        let json = serde_json::to_value(entry.to_record()).unwrap();

        assert_eq!(json["correlationId"], "corr-9");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["timestampIso8601"], "1970-01-01T00:00:00.000000Z");
        assert!(json.get("errorKind").is_none());
        assert!(json.get("errorMessage").is_none());
    }
}
