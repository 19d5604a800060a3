//! Audit sinks.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use super::entry::{AuditEntry, AuditOutcome, AuditRecord};

/// Audit sink errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Writing to or reading from the log failed.
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sink-specific failure.
    #[error("audit sink error: {0}")]
    Sink(String),
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Append an entry.
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Flush any buffered entries.
    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// In-memory sink for tests and inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Create a new memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Entries of one correlation id.
    pub fn for_correlation(&self, correlation_id: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Get entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

/// Sink that discards all entries.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn write(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Sink that emits entries as `tracing` events on the `opguard::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let error_kind = entry.error.as_ref().map(|e| e.kind.as_str());
        match entry.outcome {
            AuditOutcome::Success => info!(
                target: "opguard::audit",
                id = %entry.id,
                correlation_id = %entry.correlation_id,
                actor = %entry.context.actor_id,
                kind = %entry.kind,
                category = entry.category.as_str(),
                "operation succeeded"
            ),
            AuditOutcome::Failure => warn!(
                target: "opguard::audit",
                id = %entry.id,
                correlation_id = %entry.correlation_id,
                actor = %entry.context.actor_id,
                kind = %entry.kind,
                category = entry.category.as_str(),
                error_kind,
                "operation failed"
            ),
            AuditOutcome::Alert => error!(
                target: "opguard::audit",
                id = %entry.id,
                correlation_id = %entry.correlation_id,
                actor = %entry.context.actor_id,
                kind = %entry.kind,
                category = entry.category.as_str(),
                error_kind,
                "security alert"
            ),
        }
        Ok(())
    }
}

/// Append-only JSON-lines file, one [`AuditRecord`] per line.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Open (or create) a log file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&entry.to_record())?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Read every record from a JSON-lines audit log.
///
/// Blank lines are skipped; a malformed line is an error naming its line
/// number.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(|e| AuditError::Sink(format!("line {}: {}", index + 1, e)))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::AuditCategory;
    use crate::context::SecurityContext;
    use crate::error::FailureKind;

    fn entry(outcome: AuditOutcome, corr: &str) -> AuditEntry {
        let snapshot = SecurityContext::builder()
            .actor("alice")
            .session("s")
            .correlation_id(corr)
            .build()
            .snapshot();
        AuditEntry::new(snapshot, "content.create", AuditCategory::Operation, outcome, 0)
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemoryAuditSink::new();
        sink.write(&entry(AuditOutcome::Success, "a")).unwrap();
        sink.write(&entry(AuditOutcome::Failure, "b")).unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.for_correlation("b").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_null_and_tracing_sinks() {
        NullAuditSink.write(&entry(AuditOutcome::Success, "a")).unwrap();
        NullAuditSink.flush().unwrap();
        TracingAuditSink.write(&entry(AuditOutcome::Alert, "a")).unwrap();
    }

    #[test]
    fn test_json_lines_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let sink = JsonLinesAuditSink::open(&path).unwrap();
            sink.write(&entry(AuditOutcome::Success, "a")).unwrap();
            sink.flush().unwrap();
        }
        {
            // Reopening appends.
            let sink = JsonLinesAuditSink::open(&path).unwrap();
            let failed = entry(AuditOutcome::Failure, "b")
                .with_error(FailureKind::ExecutionFailed, "body failed");
            sink.write(&failed).unwrap();
            sink.flush().unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].correlation_id, "a");
        assert_eq!(records[1].error_kind, Some(FailureKind::ExecutionFailed));
        assert_eq!(records[1].error_message.as_deref(), Some("body failed"));
    }

    #[test]
    fn test_read_records_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "\n{not json}\n").unwrap();
        let err = read_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
