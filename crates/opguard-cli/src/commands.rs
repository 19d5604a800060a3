//! `check-config` and `audit` subcommands.

use std::path::Path;

use thiserror::Error;

use opguard_core::audit::{read_records, AuditError, AuditOutcome, AuditRecord};
use opguard_core::config::GuardConfig;
use opguard_core::error::ConfigError;

use crate::{OutcomeFilter, OutputFormat};

/// Subcommand errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load a configuration file and report its effective settings.
pub fn check_config(path: &Path, print: bool) -> Result<(), CommandError> {
    let config = GuardConfig::from_json_file(path)?;
    tracing::info!(path = %path.display(), "configuration valid");

    println!("{}: ok", path.display());
    println!(
        "  rate limit: {} ({} attempts / {} ms, {} per-kind rules)",
        if config.rate_limit.enabled { "on" } else { "off" },
        config.rate_limit.max_attempts,
        config.rate_limit.window_ms,
        config.rate_limit.per_kind.len()
    );
    println!(
        "  monitor: max {} concurrent, {:?} admission, {} per-kind thresholds",
        config.monitor.max_concurrent,
        config.monitor.admission,
        config.monitor.per_kind.len()
    );
    println!(
        "  cache: {} (capacity {}, default ttl {} ms)",
        if config.cache.enabled { "on" } else { "off" },
        config.cache.capacity,
        config.cache.default_ttl_ms
    );
    println!(
        "  audit: {} sensitive fields redacted",
        config.audit.sensitive_fields.len()
    );

    if print {
        println!("{}", serde_json::to_string_pretty(&config)?);
    }
    Ok(())
}

/// Record selection for `audit`.
#[derive(Debug, Default)]
pub struct AuditFilter {
    pub correlation_id: Option<String>,
    pub outcome: Option<OutcomeFilter>,
    pub kind: Option<String>,
}

impl AuditFilter {
    /// Whether `record` passes the filter. A correlation id also selects
    /// the records of nested invocations (`{id}.{n}`).
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(id) = &self.correlation_id {
            let nested = record
                .correlation_id
                .strip_prefix(id.as_str())
                .is_some_and(|rest| rest.starts_with('.'));
            if record.correlation_id != *id && !nested {
                return false;
            }
        }
        if let Some(outcome) = self.outcome {
            let wanted = match outcome {
                OutcomeFilter::Success => AuditOutcome::Success,
                OutcomeFilter::Failure => AuditOutcome::Failure,
                OutcomeFilter::Alert => AuditOutcome::Alert,
            };
            if record.outcome != wanted {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if record.kind != *kind {
                return false;
            }
        }
        true
    }
}

/// Print the records of an audit log that pass `filter`.
pub fn print_audit(
    path: &Path,
    filter: &AuditFilter,
    format: OutputFormat,
) -> Result<(), CommandError> {
    let records = read_records(path)?;
    let total = records.len();
    let selected: Vec<&AuditRecord> = records.iter().filter(|r| filter.matches(r)).collect();
    tracing::debug!(total, selected = selected.len(), "audit log read");

    for record in &selected {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(record)?),
            OutputFormat::Text => println!("{}", render_record(record)),
        }
    }
    if format == OutputFormat::Text {
        println!("({} of {} records)", selected.len(), total);
    }
    Ok(())
}

fn render_record(record: &AuditRecord) -> String {
    let mut line = format!(
        "{} {:<7} {:<20} {} actor={} id={}",
        record.timestamp_iso8601,
        record.outcome.as_str(),
        record.category.as_str(),
        record.kind,
        record.actor,
        record.correlation_id
    );
    if let Some(kind) = record.error_kind {
        line.push_str(&format!(" error={}", kind));
    }
    if let Some(message) = &record.error_message {
        line.push_str(&format!(" message={:?}", message));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use opguard_core::audit::AuditCategory;
    use opguard_core::error::FailureKind;

    fn record(correlation_id: &str, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord {
            correlation_id: correlation_id.to_string(),
            kind: "notes.create".to_string(),
            outcome,
            error_kind: None,
            error_message: None,
            timestamp_iso8601: "2026-01-01T00:00:00.000000Z".to_string(),
            category: AuditCategory::Operation,
            actor: "alice".to_string(),
        }
    }

    #[test]
    fn test_filter_by_correlation_includes_children() {
        let filter = AuditFilter {
            correlation_id: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record("abc", AuditOutcome::Success)));
        assert!(filter.matches(&record("abc.1", AuditOutcome::Success)));
        assert!(!filter.matches(&record("abcd", AuditOutcome::Success)));
        assert!(!filter.matches(&record("xyz", AuditOutcome::Success)));
    }

    #[test]
    fn test_filter_by_outcome_and_kind() {
        let filter = AuditFilter {
            outcome: Some(OutcomeFilter::Failure),
            kind: Some("notes.create".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&record("a", AuditOutcome::Failure)));
        assert!(!filter.matches(&record("a", AuditOutcome::Alert)));
    }

    #[test]
    fn test_render_includes_error() {
        let mut r = record("a", AuditOutcome::Failure);
        r.error_kind = Some(FailureKind::ExecutionFailed);
        r.error_message = Some("disk full".to_string());
        let line = render_record(&r);
        assert!(line.contains("failure"));
        assert!(line.contains("error=ExecutionFailed"));
        assert!(line.contains("disk full"));
    }

    #[test]
    fn test_check_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        std::fs::write(&path, r#"{"monitor": {"max_concurrent": 0}}"#).unwrap();
        assert!(matches!(
            check_config(&path, false),
            Err(CommandError::Config(_))
        ));
    }
}
