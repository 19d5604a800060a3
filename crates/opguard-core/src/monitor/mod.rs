//! Operation monitoring and admission control.
//!
//! The monitor brackets the execution window of every invocation. It caps
//! the number of concurrently monitored operations, measures duration,
//! memory and CPU deltas and store calls, and classifies the measurements
//! against per-kind thresholds. A breach never interrupts the body.

mod probe;
mod thresholds;

pub use probe::{NullProbe, ProcessProbe, ResourceProbe, ResourceSample};
pub use thresholds::{classify, MetricKind, ThresholdBreach, ThresholdLevel, ThresholdReport};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{AdmissionPolicy, MonitorConfig};
use crate::context::SecurityContext;

/// Handle of a monitored operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

impl MonitorId {
    /// Numeric id.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Resource consumption of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Memory growth in bytes (negative when memory was released).
    pub memory_delta_bytes: i64,
    /// CPU time consumed in microseconds.
    pub cpu_micros: u64,
    /// Store calls made by the body.
    pub storage_calls: u64,
}

/// Measurements taken between `start` and `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Wall-clock duration.
    pub duration: Duration,
    /// Resource deltas.
    pub usage: ResourceUsage,
}

impl Metrics {
    /// JSON form used in audit details.
    pub fn to_json(&self) -> Value {
        json!({
            "durationMs": self.duration.as_millis() as u64,
            "memoryDeltaBytes": self.usage.memory_delta_bytes,
            "cpuMicros": self.usage.cpu_micros,
            "storageCalls": self.usage.storage_calls,
        })
    }
}

/// Monitor errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// The concurrency ceiling refused admission.
    #[error("too many concurrent operations (limit {limit})")]
    TooManyConcurrent {
        /// Configured ceiling.
        limit: usize,
    },

    /// The id is not (or no longer) monitored.
    #[error("unknown monitor id {0}")]
    UnknownId(u64),
}

/// Currently monitored operation.
#[derive(Debug, Clone)]
pub struct ActiveOperation {
    /// Operation kind.
    pub kind: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Start time (micros).
    pub started_at: u64,
    start_sample: ResourceSample,
    storage_calls: Arc<AtomicU64>,
}

/// Monitor statistics.
#[derive(Debug, Default)]
pub struct MonitorStats {
    admitted: AtomicU64,
    rejected: AtomicU64,
    peak: AtomicU64,
}

impl MonitorStats {
    /// Operations admitted.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Operations refused admission.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Highest number of concurrently monitored operations.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Instruments critical operations.
pub struct OperationMonitor {
    config: MonitorConfig,
    clock: SharedClock,
    probe: Arc<dyn ResourceProbe>,
    active: Mutex<HashMap<MonitorId, ActiveOperation>>,
    slot_freed: Condvar,
    next_id: AtomicU64,
    stats: MonitorStats,
}

impl OperationMonitor {
    /// Create a monitor.
    pub fn new(config: MonitorConfig, clock: SharedClock, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            config,
            clock,
            probe,
            active: Mutex::new(HashMap::new()),
            slot_freed: Condvar::new(),
            next_id: AtomicU64::new(1),
            stats: MonitorStats::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Statistics.
    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    /// Begin monitoring an operation.
    ///
    /// Fails with [`MonitorError::TooManyConcurrent`] when the ceiling is
    /// reached and the admission policy does not (or no longer) allow
    /// waiting.
    pub fn start(&self, kind: &str, context: &SecurityContext) -> Result<MonitorId, MonitorError> {
        let limit = self.config.max_concurrent;
        let mut active = self.active.lock();

        if active.len() >= limit {
            match self.config.admission {
                AdmissionPolicy::FailFast => return Err(self.reject(kind, limit)),
                AdmissionPolicy::Block { timeout_ms } => {
                    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                    while active.len() >= limit {
                        if self.slot_freed.wait_until(&mut active, deadline).timed_out()
                            && active.len() >= limit
                        {
                            return Err(self.reject(kind, limit));
                        }
                    }
                }
            }
        }

        let id = MonitorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        active.insert(
            id,
            ActiveOperation {
                kind: kind.to_string(),
                correlation_id: context.correlation_id().to_string(),
                started_at: self.clock.now_micros(),
                start_sample: self.probe.sample(),
                storage_calls: Arc::new(AtomicU64::new(0)),
            },
        );
        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .peak
            .fetch_max(active.len() as u64, Ordering::Relaxed);
        debug!(monitor_id = id.0, kind, active = active.len(), "monitoring started");
        Ok(id)
    }

    /// Like [`start`](Self::start), but the slot is released when the
    /// returned guard drops.
    pub fn admit(
        &self,
        kind: &str,
        context: &SecurityContext,
    ) -> Result<MonitorGuard<'_>, MonitorError> {
        let id = self.start(kind, context)?;
        Ok(MonitorGuard {
            monitor: self,
            id: Some(id),
        })
    }

    fn reject(&self, kind: &str, limit: usize) -> MonitorError {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(kind, limit, "admission refused: concurrency ceiling reached");
        MonitorError::TooManyConcurrent { limit }
    }

    /// Counter the body increments on every store call.
    pub fn call_counter(&self, id: MonitorId) -> Result<Arc<AtomicU64>, MonitorError> {
        self.active
            .lock()
            .get(&id)
            .map(|op| op.storage_calls.clone())
            .ok_or(MonitorError::UnknownId(id.0))
    }

    /// Stop monitoring and return the measurements.
    pub fn stop(&self, id: MonitorId) -> Result<Metrics, MonitorError> {
        let op = self
            .active
            .lock()
            .remove(&id)
            .ok_or(MonitorError::UnknownId(id.0))?;
        self.slot_freed.notify_one();

        let end_sample = self.probe.sample();
        let metrics = Metrics {
            duration: self.clock.elapsed_since(op.started_at),
            usage: ResourceUsage {
                memory_delta_bytes: end_sample.memory_bytes as i64
                    - op.start_sample.memory_bytes as i64,
                cpu_micros: end_sample
                    .cpu_micros
                    .saturating_sub(op.start_sample.cpu_micros),
                storage_calls: op.storage_calls.load(Ordering::Relaxed),
            },
        };
        debug!(
            monitor_id = id.0,
            kind = %op.kind,
            duration_ms = metrics.duration.as_millis() as u64,
            "monitoring stopped"
        );
        Ok(metrics)
    }

    /// Classify metrics against the thresholds of a kind.
    pub fn evaluate(&self, kind: &str, metrics: &Metrics) -> ThresholdReport {
        classify(
            metrics,
            &self.config.thresholds_for(kind),
            self.config.critical_multiplier,
        )
    }

    /// Hard deadline of a kind, if configured.
    pub fn deadline_for(&self, kind: &str) -> Option<Duration> {
        self.config
            .thresholds_for(kind)
            .hard_deadline_ms
            .map(Duration::from_millis)
    }

    /// Number of operations currently monitored.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot of monitored operations.
    pub fn active_operations(&self) -> Vec<(MonitorId, ActiveOperation)> {
        self.active
            .lock()
            .iter()
            .map(|(id, op)| (*id, op.clone()))
            .collect()
    }
}

/// Admission slot held for one monitored window.
///
/// Call [`finish`](MonitorGuard::finish) to get the measurements; dropping
/// the guard without it stops monitoring and discards them.
pub struct MonitorGuard<'m> {
    monitor: &'m OperationMonitor,
    id: Option<MonitorId>,
}

impl MonitorGuard<'_> {
    /// Id of the monitored operation.
    pub fn id(&self) -> Option<MonitorId> {
        self.id
    }

    /// Stop monitoring and return the measurements.
    pub fn finish(mut self) -> Result<Metrics, MonitorError> {
        match self.id.take() {
            Some(id) => self.monitor.stop(id),
            None => Err(MonitorError::UnknownId(0)),
        }
    }
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            warn!(monitor_id = id.0, "monitored window abandoned");
            if let Err(e) = self.monitor.stop(id) {
                warn!(error = %e, "failed to release admission slot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ThresholdConfig;
    use std::thread;

    fn ctx() -> SecurityContext {
        SecurityContext::builder().actor("alice").session("s").build()
    }

    fn monitor(config: MonitorConfig) -> (OperationMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (
            OperationMonitor::new(config, clock.clone(), Arc::new(NullProbe)),
            clock,
        )
    }

    #[test]
    fn test_start_stop_measures_duration_and_calls() {
        let (monitor, clock) = monitor(MonitorConfig::default());
        let id = monitor.start("content.create", &ctx()).unwrap();
        assert_eq!(monitor.active_count(), 1);

        monitor.call_counter(id).unwrap().fetch_add(3, Ordering::Relaxed);
        clock.advance(Duration::from_millis(250));

        let metrics = monitor.stop(id).unwrap();
        assert_eq!(metrics.duration, Duration::from_millis(250));
        assert_eq!(metrics.usage.storage_calls, 3);
        assert_eq!(monitor.active_count(), 0);
        assert_eq!(monitor.stop(id), Err(MonitorError::UnknownId(id.as_u64())));
    }

    #[test]
    fn test_fail_fast_ceiling() {
        let (monitor, _) = monitor(MonitorConfig::default().with_max_concurrent(2));
        let a = monitor.start("k", &ctx()).unwrap();
        let _b = monitor.start("k", &ctx()).unwrap();
        assert_eq!(
            monitor.start("k", &ctx()),
            Err(MonitorError::TooManyConcurrent { limit: 2 })
        );
        assert_eq!(monitor.stats().rejected(), 1);

        monitor.stop(a).unwrap();
        assert!(monitor.start("k", &ctx()).is_ok());
        assert_eq!(monitor.stats().peak(), 2);
    }

    #[test]
    fn test_block_times_out() {
        let config = MonitorConfig::default()
            .with_max_concurrent(1)
            .with_admission(AdmissionPolicy::Block { timeout_ms: 20 });
        let (monitor, _) = monitor(config);
        let _held = monitor.start("k", &ctx()).unwrap();
        assert!(matches!(
            monitor.start("k", &ctx()),
            Err(MonitorError::TooManyConcurrent { .. })
        ));
    }

    #[test]
    fn test_block_admits_when_slot_frees() {
        let config = MonitorConfig::default()
            .with_max_concurrent(1)
            .with_admission(AdmissionPolicy::Block { timeout_ms: 5_000 });
        let (monitor, _) = monitor(config);
        let monitor = Arc::new(monitor);
        let held = monitor.start("k", &ctx()).unwrap();

        let waiter = {
            let monitor = monitor.clone();
            thread::spawn(move || monitor.start("k", &ctx()).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        monitor.stop(held).unwrap();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_guard_releases_slot_on_drop() {
        let (monitor, clock) = monitor(MonitorConfig::default().with_max_concurrent(1));
        {
            let _guard = monitor.admit("k", &ctx()).unwrap();
            assert_eq!(monitor.active_count(), 1);
        }
        assert_eq!(monitor.active_count(), 0);

        let guard = monitor.admit("k", &ctx()).unwrap();
        clock.advance(Duration::from_millis(40));
        let metrics = guard.finish().unwrap();
        assert_eq!(metrics.duration, Duration::from_millis(40));
        assert_eq!(monitor.active_count(), 0);
        assert_eq!(monitor.stats().admitted(), 2);
    }

    #[test]
    fn test_guard_releases_slot_on_panic() {
        let (monitor, _) = monitor(MonitorConfig::default().with_max_concurrent(1));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = monitor.admit("k", &ctx()).unwrap();
            panic!("body exploded");
        }));
        assert!(outcome.is_err());
        assert_eq!(monitor.active_count(), 0);
        assert!(monitor.admit("k", &ctx()).is_ok());
    }

    #[test]
    fn test_evaluate_and_deadline() {
        let config = MonitorConfig::default().with_kind(
            "media.transcode",
            ThresholdConfig {
                max_duration_ms: Some(100),
                hard_deadline_ms: Some(500),
                ..ThresholdConfig::default()
            },
        );
        let (monitor, _) = monitor(config);
        let metrics = Metrics {
            duration: Duration::from_millis(250),
            usage: ResourceUsage::default(),
        };
        assert!(monitor.evaluate("media.transcode", &metrics).is_critical());
        assert_eq!(
            monitor.deadline_for("media.transcode"),
            Some(Duration::from_millis(500))
        );
        assert_eq!(monitor.deadline_for("other"), None);
    }
}
