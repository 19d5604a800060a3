//! Backup points and compensation-based restore.
//!
//! The store transaction is the primary rollback. A [`BackupPoint`] carries
//! compensations for side effects the store cannot undo (files written,
//! messages sent); the operation body registers them while it runs. On
//! failure they are applied in reverse registration order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sled::Tree;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::clock::SharedClock;
use crate::context::SecurityContext;
use crate::error::StoreError;
use crate::storage::StateStore;

/// Tree holding live backup points.
pub const BACKUP_TREE: &str = "backup:points";

/// Backup errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The point registry could not be updated.
    #[error("backup store error: {0}")]
    Store(#[from] StoreError),

    /// One or more compensations failed.
    #[error("restore failed: {} compensation(s) failed", failures.len())]
    RestoreFailed {
        /// Failure messages, labelled by compensation.
        failures: Vec<String>,
    },
}

impl From<sled::Error> for BackupError {
    fn from(err: sled::Error) -> Self {
        BackupError::Store(StoreError::Sled(err))
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Store(StoreError::from(err))
    }
}

type CompensationFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// An undo action for one side effect.
pub struct Compensation {
    label: String,
    action: CompensationFn,
}

impl Compensation {
    /// Create a labelled compensation.
    pub fn new<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Box::new(action),
        }
    }

    /// Label used in restore failure reports.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn apply(self) -> Result<(), String> {
        (self.action)()
    }
}

impl fmt::Debug for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compensation")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Persisted description of a live point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Point id.
    pub id: u64,
    /// Operation kind.
    pub kind: String,
    /// Correlation id of the invocation.
    pub correlation_id: String,
    /// Creation time (micros).
    pub created_at: u64,
}

/// Restorable handle taken immediately before the transaction begins.
#[derive(Debug)]
pub struct BackupPoint {
    record: BackupRecord,
    compensations: Vec<Compensation>,
}

impl BackupPoint {
    /// Create a point without registering it anywhere.
    pub fn new(
        id: u64,
        kind: impl Into<String>,
        correlation_id: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            record: BackupRecord {
                id,
                kind: kind.into(),
                correlation_id: correlation_id.into(),
                created_at,
            },
            compensations: Vec::new(),
        }
    }

    /// Point id.
    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// Operation kind.
    pub fn kind(&self) -> &str {
        &self.record.kind
    }

    /// Correlation id.
    pub fn correlation_id(&self) -> &str {
        &self.record.correlation_id
    }

    /// Creation time (micros).
    pub fn created_at(&self) -> u64 {
        self.record.created_at
    }

    /// Persisted form.
    pub fn record(&self) -> &BackupRecord {
        &self.record
    }

    /// Register a compensation.
    pub fn push(&mut self, compensation: Compensation) {
        self.compensations.push(compensation);
    }

    /// Append compensations in order.
    pub fn extend(&mut self, compensations: Vec<Compensation>) {
        self.compensations.extend(compensations);
    }

    /// Remove and return every registered compensation.
    pub fn take_compensations(&mut self) -> Vec<Compensation> {
        std::mem::take(&mut self.compensations)
    }

    /// Number of registered compensations.
    pub fn compensation_count(&self) -> usize {
        self.compensations.len()
    }

    /// Run compensations newest first. Every one is attempted.
    fn run_compensations(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(compensation) = self.compensations.pop() {
            let label = compensation.label.clone();
            if let Err(e) = compensation.apply() {
                error!(
                    point = self.record.id,
                    compensation = %label,
                    error = %e,
                    "compensation failed"
                );
                failures.push(format!("{}: {}", label, e));
            }
        }
        failures
    }
}

/// Creates and consumes backup points.
pub trait BackupService: Send + Sync {
    /// Take a point before the transaction begins.
    fn create_snapshot(
        &self,
        kind: &str,
        context: &SecurityContext,
    ) -> Result<BackupPoint, BackupError>;

    /// Release a point after commit. Compensations are dropped unrun.
    fn discard(&self, point: BackupPoint);

    /// Apply the point's compensations in reverse order.
    ///
    /// All compensations are attempted; failures are collected into
    /// [`BackupError::RestoreFailed`].
    fn restore(&self, point: BackupPoint) -> Result<(), BackupError>;
}

/// Backup statistics.
#[derive(Debug, Default)]
pub struct BackupStats {
    created: AtomicU64,
    discarded: AtomicU64,
    restored: AtomicU64,
    restore_failures: AtomicU64,
}

impl BackupStats {
    /// Points created.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Points discarded after commit.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Points restored.
    pub fn restored(&self) -> u64 {
        self.restored.load(Ordering::Relaxed)
    }

    /// Restores with at least one failed compensation.
    pub fn restore_failures(&self) -> u64 {
        self.restore_failures.load(Ordering::Relaxed)
    }
}

/// Backup service that records live points in the state store's database.
///
/// Points still present after a restart outlived their invocation and are
/// evidence of a crash mid-operation.
pub struct StoreBackupService {
    store: StateStore,
    points: Tree,
    clock: SharedClock,
    stats: BackupStats,
}

impl StoreBackupService {
    /// Open the point registry in `store`.
    pub fn open(store: StateStore, clock: SharedClock) -> Result<Self, BackupError> {
        let points = store.open_tree(BACKUP_TREE)?;
        let service = Self {
            store,
            points,
            clock,
            stats: BackupStats::default(),
        };
        let stale = service.points.len();
        if stale > 0 {
            warn!(stale, "backup points survived a previous run");
        }
        Ok(service)
    }

    /// Statistics.
    pub fn stats(&self) -> &BackupStats {
        &self.stats
    }

    /// Points currently registered.
    pub fn live_points(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = Vec::new();
        for item in self.points.iter() {
            let (_, bytes) = item?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }

    /// Remove registered points older than `before` (micros).
    pub fn purge_before(&self, before: u64) -> Result<usize, BackupError> {
        let mut purged = 0;
        for record in self.live_points()? {
            if record.created_at < before {
                self.points.remove(record.id.to_be_bytes())?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn unregister(&self, id: u64) {
        if let Err(e) = self.points.remove(id.to_be_bytes()) {
            error!(point = id, error = %e, "failed to unregister backup point");
        }
    }
}

impl BackupService for StoreBackupService {
    fn create_snapshot(
        &self,
        kind: &str,
        context: &SecurityContext,
    ) -> Result<BackupPoint, BackupError> {
        let id = self.store.generate_id()?;
        let point = BackupPoint::new(id, kind, context.correlation_id(), self.clock.now_micros());
        self.points
            .insert(id.to_be_bytes(), serde_json::to_vec(point.record())?)?;
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        debug!(point = id, kind, "backup point created");
        Ok(point)
    }

    fn discard(&self, point: BackupPoint) {
        self.unregister(point.id());
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            point = point.id(),
            dropped = point.compensation_count(),
            "backup point discarded"
        );
    }

    fn restore(&self, mut point: BackupPoint) -> Result<(), BackupError> {
        let count = point.compensation_count();
        let failures = point.run_compensations();
        self.unregister(point.id());
        self.stats.restored.fetch_add(1, Ordering::Relaxed);
        debug!(point = point.id(), compensations = count, "backup point restored");

        if failures.is_empty() {
            Ok(())
        } else {
            self.stats.restore_failures.fetch_add(1, Ordering::Relaxed);
            Err(BackupError::RestoreFailed { failures })
        }
    }
}
