//! Two-tier threshold classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Metrics;
use crate::config::ThresholdConfig;

/// Severity of a measurement relative to its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdLevel {
    /// Within the ceiling.
    Normal,
    /// Above the ceiling.
    Warning,
    /// Above the ceiling times the critical multiplier.
    Critical,
}

impl ThresholdLevel {
    /// Classify one observation.
    pub fn classify(observed: u64, ceiling: u64, critical_multiplier: f64) -> Self {
        if observed as f64 > ceiling as f64 * critical_multiplier {
            ThresholdLevel::Critical
        } else if observed > ceiling {
            ThresholdLevel::Warning
        } else {
            ThresholdLevel::Normal
        }
    }

    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdLevel::Normal => "normal",
            ThresholdLevel::Warning => "warning",
            ThresholdLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ThresholdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitored quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Wall-clock duration in milliseconds.
    DurationMs,
    /// Memory growth in bytes.
    MemoryBytes,
    /// Store calls made by the body.
    StorageCalls,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::DurationMs => write!(f, "duration_ms"),
            MetricKind::MemoryBytes => write!(f, "memory_bytes"),
            MetricKind::StorageCalls => write!(f, "storage_calls"),
        }
    }
}

/// One metric above its ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBreach {
    /// Which metric.
    pub metric: MetricKind,
    /// Observed value.
    pub observed: u64,
    /// Configured ceiling.
    pub ceiling: u64,
    /// Severity.
    pub level: ThresholdLevel,
}

/// Classification of one invocation's metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    /// Highest severity across all metrics.
    pub level: ThresholdLevel,
    /// Metrics above their ceiling.
    pub breaches: Vec<ThresholdBreach>,
}

impl ThresholdReport {
    /// Report with no breaches.
    pub fn normal() -> Self {
        Self {
            level: ThresholdLevel::Normal,
            breaches: Vec::new(),
        }
    }

    /// Whether any metric exceeded its ceiling.
    pub fn is_breach(&self) -> bool {
        self.level > ThresholdLevel::Normal
    }

    /// Whether any metric exceeded the critical tier.
    pub fn is_critical(&self) -> bool {
        self.level == ThresholdLevel::Critical
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        if self.breaches.is_empty() {
            return "within thresholds".to_string();
        }
        let parts: Vec<String> = self
            .breaches
            .iter()
            .map(|b| format!("{} {} > {} ({})", b.metric, b.observed, b.ceiling, b.level))
            .collect();
        parts.join(", ")
    }
}

/// Classify metrics against the thresholds of one kind.
pub fn classify(
    metrics: &Metrics,
    thresholds: &ThresholdConfig,
    critical_multiplier: f64,
) -> ThresholdReport {
    let observations = [
        (
            MetricKind::DurationMs,
            metrics.duration.as_millis() as u64,
            thresholds.max_duration_ms,
        ),
        (
            MetricKind::MemoryBytes,
            metrics.usage.memory_delta_bytes.max(0) as u64,
            thresholds.max_memory_bytes,
        ),
        (
            MetricKind::StorageCalls,
            metrics.usage.storage_calls,
            thresholds.max_storage_calls,
        ),
    ];

    let mut report = ThresholdReport::normal();
    for (metric, observed, ceiling) in observations {
        let Some(ceiling) = ceiling else { continue };
        let level = ThresholdLevel::classify(observed, ceiling, critical_multiplier);
        if level > ThresholdLevel::Normal {
            report.level = report.level.max(level);
            report.breaches.push(ThresholdBreach {
                metric,
                observed,
                ceiling,
                level,
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::ResourceUsage;
    use std::time::Duration;

    fn metrics(ms: u64, memory: i64, calls: u64) -> Metrics {
        Metrics {
            duration: Duration::from_millis(ms),
            usage: ResourceUsage {
                memory_delta_bytes: memory,
                cpu_micros: 0,
                storage_calls: calls,
            },
        }
    }

    #[test]
    fn test_level_classification() {
        assert_eq!(ThresholdLevel::classify(100, 100, 2.0), ThresholdLevel::Normal);
        assert_eq!(ThresholdLevel::classify(101, 100, 2.0), ThresholdLevel::Warning);
        assert_eq!(ThresholdLevel::classify(200, 100, 2.0), ThresholdLevel::Warning);
        assert_eq!(ThresholdLevel::classify(201, 100, 2.0), ThresholdLevel::Critical);
    }

    #[test]
    fn test_classify_reports_highest_level() {
        let thresholds = ThresholdConfig {
            max_duration_ms: Some(100),
            max_memory_bytes: Some(1_000),
            max_storage_calls: Some(10),
            hard_deadline_ms: None,
        };
        let report = classify(&metrics(150, 5_000, 3), &thresholds, 2.0);
        assert_eq!(report.level, ThresholdLevel::Critical);
        assert_eq!(report.breaches.len(), 2);
        assert!(report.summary().contains("memory_bytes 5000 > 1000 (critical)"));
    }

    #[test]
    fn test_disabled_ceilings_ignored() {
        let report = classify(&metrics(10_000, -50, 1_000), &ThresholdConfig::default(), 2.0);
        assert!(!report.is_breach());
        assert_eq!(report.summary(), "within thresholds");
    }
}
