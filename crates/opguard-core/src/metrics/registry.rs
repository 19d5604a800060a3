//! Central metrics registry.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use super::histogram::Histogram;
use super::{MetricSample, MetricsSink, SampleOutcome};
use crate::error::FailureKind;
use crate::monitor::ThresholdLevel;

/// Per-kind counters.
#[derive(Debug, Default)]
struct KindCounters {
    invocations: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    warnings: AtomicU64,
    criticals: AtomicU64,
}

/// Snapshot of one kind's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindMetrics {
    /// Monitored invocations.
    pub invocations: u64,
    /// Monitored invocations that failed.
    pub failures: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Warning-level threshold breaches.
    pub warnings: u64,
    /// Critical threshold breaches.
    pub criticals: u64,
}

/// Collects operation metrics and exports them in Prometheus text format.
pub struct MetricsRegistry {
    started_at: Instant,
    latency: Histogram,
    samples: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rejections: AtomicU64,
    emergencies: AtomicU64,
    by_kind: RwLock<BTreeMap<String, Arc<KindCounters>>>,
    by_failure: RwLock<BTreeMap<FailureKind, u64>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            latency: Histogram::operation_latency(),
            samples: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
            by_kind: RwLock::new(BTreeMap::new()),
            by_failure: RwLock::new(BTreeMap::new()),
        }
    }

    fn kind(&self, kind: &str) -> Arc<KindCounters> {
        if let Some(counters) = self.by_kind.read().get(kind) {
            return counters.clone();
        }
        self.by_kind
            .write()
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    fn count_failure(&self, reason: FailureKind) {
        *self.by_failure.write().entry(reason).or_insert(0) += 1;
    }

    /// Uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Latency histogram.
    pub fn latency(&self) -> &Histogram {
        &self.latency
    }

    /// Monitored invocations.
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Monitored invocations that failed.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Cache hit rate (0.0 - 1.0).
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits() as f64;
        let total = hits + self.cache_misses() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    /// Invocations rejected before monitoring started.
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Emergency protocol invocations.
    pub fn emergencies(&self) -> u64 {
        self.emergencies.load(Ordering::Relaxed)
    }

    /// Counters of one kind.
    pub fn kind_metrics(&self, kind: &str) -> KindMetrics {
        match self.by_kind.read().get(kind) {
            Some(c) => KindMetrics {
                invocations: c.invocations.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
                cache_hits: c.cache_hits.load(Ordering::Relaxed),
                cache_misses: c.cache_misses.load(Ordering::Relaxed),
                warnings: c.warnings.load(Ordering::Relaxed),
                criticals: c.criticals.load(Ordering::Relaxed),
            },
            None => KindMetrics::default(),
        }
    }

    /// Failures (including rejections) by kind.
    pub fn failures_by_kind(&self) -> BTreeMap<FailureKind, u64> {
        self.by_failure.read().clone()
    }

    /// Export to Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# HELP opguard_uptime_seconds Registry uptime in seconds");
        let _ = writeln!(out, "# TYPE opguard_uptime_seconds gauge");
        let _ = writeln!(out, "opguard_uptime_seconds {}\n", self.uptime_secs());

        let _ = writeln!(out, "# HELP opguard_operations_total Monitored operations by kind");
        let _ = writeln!(out, "# TYPE opguard_operations_total counter");
        let kinds = self.by_kind.read();
        for (kind, c) in kinds.iter() {
            let _ = writeln!(
                out,
                "opguard_operations_total{{kind=\"{}\"}} {}",
                kind,
                c.invocations.load(Ordering::Relaxed)
            );
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP opguard_operation_failures_total Failed operations by kind");
        let _ = writeln!(out, "# TYPE opguard_operation_failures_total counter");
        for (kind, c) in kinds.iter() {
            let _ = writeln!(
                out,
                "opguard_operation_failures_total{{kind=\"{}\"}} {}",
                kind,
                c.failures.load(Ordering::Relaxed)
            );
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP opguard_threshold_violations_total Threshold breaches by kind and level"
        );
        let _ = writeln!(out, "# TYPE opguard_threshold_violations_total counter");
        for (kind, c) in kinds.iter() {
            let _ = writeln!(
                out,
                "opguard_threshold_violations_total{{kind=\"{}\",level=\"warning\"}} {}",
                kind,
                c.warnings.load(Ordering::Relaxed)
            );
            let _ = writeln!(
                out,
                "opguard_threshold_violations_total{{kind=\"{}\",level=\"critical\"}} {}",
                kind,
                c.criticals.load(Ordering::Relaxed)
            );
        }
        drop(kinds);
        out.push('\n');

        let _ = writeln!(out, "# HELP opguard_failures_total Failures by failure kind");
        let _ = writeln!(out, "# TYPE opguard_failures_total counter");
        for (reason, count) in self.by_failure.read().iter() {
            let _ = writeln!(out, "opguard_failures_total{{reason=\"{}\"}} {}", reason, count);
        }
        out.push('\n');

        let _ = writeln!(
            out,
            "# HELP opguard_operation_duration_us Operation duration in microseconds"
        );
        let _ = writeln!(out, "# TYPE opguard_operation_duration_us histogram");
        for (bound, count) in self.latency.cumulative() {
            match bound {
                Some(bound) => {
                    let _ = writeln!(
                        out,
                        "opguard_operation_duration_us_bucket{{le=\"{}\"}} {}",
                        bound, count
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "opguard_operation_duration_us_bucket{{le=\"+Inf\"}} {}",
                        count
                    );
                }
            }
        }
        let _ = writeln!(out, "opguard_operation_duration_us_sum {}", self.latency.sum());
        let _ = writeln!(out, "opguard_operation_duration_us_count {}\n", self.latency.count());

        let _ = writeln!(out, "# HELP opguard_cache_hits_total Result cache hits");
        let _ = writeln!(out, "# TYPE opguard_cache_hits_total counter");
        let _ = writeln!(out, "opguard_cache_hits_total {}\n", self.cache_hits());

        let _ = writeln!(out, "# HELP opguard_cache_misses_total Result cache misses");
        let _ = writeln!(out, "# TYPE opguard_cache_misses_total counter");
        let _ = writeln!(out, "opguard_cache_misses_total {}\n", self.cache_misses());

        let _ = writeln!(out, "# HELP opguard_cache_hit_rate Result cache hit rate");
        let _ = writeln!(out, "# TYPE opguard_cache_hit_rate gauge");
        let _ = writeln!(out, "opguard_cache_hit_rate {:.4}\n", self.cache_hit_rate());

        let _ = writeln!(
            out,
            "# HELP opguard_rejections_total Operations rejected before execution"
        );
        let _ = writeln!(out, "# TYPE opguard_rejections_total counter");
        let _ = writeln!(out, "opguard_rejections_total {}\n", self.rejections());

        let _ = writeln!(out, "# HELP opguard_emergencies_total Emergency protocol invocations");
        let _ = writeln!(out, "# TYPE opguard_emergencies_total counter");
        let _ = writeln!(out, "opguard_emergencies_total {}", self.emergencies());

        out
    }

    /// Reset all metrics (for testing).
    pub fn reset(&self) {
        self.latency.reset();
        self.samples.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
        self.emergencies.store(0, Ordering::Relaxed);
        self.by_kind.write().clear();
        self.by_failure.write().clear();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRegistry {
    fn record_sample(&self, sample: &MetricSample) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.latency.observe(sample.duration_ms.saturating_mul(1_000));
        let counters = self.kind(&sample.kind);
        counters.invocations.fetch_add(1, Ordering::Relaxed);
        if sample.outcome == SampleOutcome::Failure {
            self.failures.fetch_add(1, Ordering::Relaxed);
            counters.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(reason) = sample.failure {
                self.count_failure(reason);
            }
        }
    }

    fn record_cache(&self, kind: &str, hit: bool) {
        let counters = self.kind(kind);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_threshold(&self, kind: &str, level: ThresholdLevel) {
        let counters = self.kind(kind);
        match level {
            ThresholdLevel::Normal => {}
            ThresholdLevel::Warning => {
                counters.warnings.fetch_add(1, Ordering::Relaxed);
            }
            ThresholdLevel::Critical => {
                counters.criticals.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_rejection(&self, _kind: &str, reason: FailureKind) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        self.count_failure(reason);
    }

    fn record_emergency(&self, _kind: &str) {
        self.emergencies.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared metrics registry handle.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Create a new shared metrics registry.
pub fn new_shared_registry() -> SharedMetricsRegistry {
    Arc::new(MetricsRegistry::new())
}
