//! Operation metrics.
//!
//! The executor hands one [`MetricSample`] per monitored invocation to a
//! [`MetricsSink`], along with cache, threshold, rejection and emergency
//! events. [`MetricsRegistry`] is the default sink and exports Prometheus
//! text.
//!
//! # Usage
//!
//! ```ignore
//! use opguard_core::metrics::{new_shared_registry, MetricsSink};
//!
//! let registry = new_shared_registry();
//! registry.record_cache("search.query", true);
//! println!("{}", registry.to_prometheus());
//! ```

mod histogram;
mod registry;

pub use histogram::Histogram;
pub use registry::{new_shared_registry, KindMetrics, MetricsRegistry, SharedMetricsRegistry};

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::monitor::{Metrics, ThresholdLevel};

/// Outcome attached to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    /// The invocation committed.
    Success,
    /// The invocation failed after monitoring started.
    Failure,
}

/// Measurements of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    /// Operation kind.
    pub kind: String,
    /// Duration in milliseconds.
    pub duration_ms: u64,
    /// Memory growth in bytes.
    pub memory_delta_bytes: i64,
    /// CPU time in microseconds.
    pub cpu_micros: u64,
    /// Store calls made by the body.
    pub storage_calls: u64,
    /// Outcome.
    pub outcome: SampleOutcome,
    /// Failure kind, when the outcome is a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Sample time (micros since epoch).
    pub timestamp: u64,
}

impl MetricSample {
    /// Build a sample from monitor metrics.
    pub fn new(
        kind: &str,
        metrics: &Metrics,
        failure: Option<FailureKind>,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            duration_ms: metrics.duration.as_millis() as u64,
            memory_delta_bytes: metrics.usage.memory_delta_bytes,
            cpu_micros: metrics.usage.cpu_micros,
            storage_calls: metrics.usage.storage_calls,
            outcome: if failure.is_some() {
                SampleOutcome::Failure
            } else {
                SampleOutcome::Success
            },
            failure,
            timestamp,
        }
    }
}

/// Receives operation metrics.
pub trait MetricsSink: Send + Sync {
    /// Record one invocation's measurements.
    fn record_sample(&self, sample: &MetricSample);

    /// Record a cache lookup.
    fn record_cache(&self, _kind: &str, _hit: bool) {}

    /// Record a threshold classification above normal.
    fn record_threshold(&self, _kind: &str, _level: ThresholdLevel) {}

    /// Record an invocation rejected before monitoring started.
    fn record_rejection(&self, _kind: &str, _reason: FailureKind) {}

    /// Record an emergency protocol invocation.
    fn record_emergency(&self, _kind: &str) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_sample(&self, _sample: &MetricSample) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ResourceUsage;
    use std::time::Duration;

    #[test]
    fn test_sample_json_shape() {
        let metrics = Metrics {
            duration: Duration::from_millis(12),
            usage: ResourceUsage {
                memory_delta_bytes: -64,
                cpu_micros: 900,
                storage_calls: 2,
            },
        };
        let sample = MetricSample::new("content.create", &metrics, None, 7);
        let json = serde_json::to_value(&sample).unwrap();

        assert_eq!(json["kind"], "content.create");
        assert_eq!(json["durationMs"], 12);
        assert_eq!(json["memoryDeltaBytes"], -64);
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["timestamp"], 7);
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn test_failure_sample() {
        let sample = MetricSample::new(
            "content.create",
            &Metrics::default(),
            Some(FailureKind::ExecutionFailed),
            0,
        );
        assert_eq!(sample.outcome, SampleOutcome::Failure);
        NullMetricsSink.record_sample(&sample);
    }
}
