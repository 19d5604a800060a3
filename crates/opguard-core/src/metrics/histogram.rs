//! Fixed-bucket histogram for operation latencies.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default bucket boundaries in microseconds: 1ms to 30s.
const OPERATION_BUCKETS_US: &[u64] = &[
    1_000, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000, 2_500_000,
    5_000_000, 10_000_000, 30_000_000,
];

/// Lock-free fixed-bucket histogram.
///
/// Each observation lands in the first bucket whose upper bound it does not
/// exceed; observations above the last bound land in an overflow bucket.
pub struct Histogram {
    /// Upper bounds in microseconds.
    bounds: Vec<u64>,
    /// Counts per bucket plus one overflow slot.
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram tuned for operation durations.
    pub fn operation_latency() -> Self {
        Self::with_bounds(OPERATION_BUCKETS_US.to_vec())
    }

    /// Histogram with custom upper bounds (sorted, deduplicated).
    pub fn with_bounds(mut bounds: Vec<u64>) -> Self {
        bounds.sort_unstable();
        bounds.dedup();
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record a value in microseconds.
    pub fn observe(&self, value_us: u64) {
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max.fetch_max(value_us, Ordering::Relaxed);

        let slot = self.bounds.partition_point(|&bound| bound < value_us);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observations.
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest observation.
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    /// Mean observation.
    pub fn avg(&self) -> u64 {
        match self.count() {
            0 => 0,
            n => self.sum() / n,
        }
    }

    /// Upper bound of the bucket holding the `p` quantile (0.0..=1.0).
    ///
    /// Values in the overflow bucket report the observed maximum.
    pub fn percentile(&self, p: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return self.bounds.get(i).copied().unwrap_or_else(|| self.max());
            }
        }
        self.max()
    }

    /// Median.
    pub fn p50(&self) -> u64 {
        self.percentile(0.50)
    }

    /// 99th percentile.
    pub fn p99(&self) -> u64 {
        self.percentile(0.99)
    }

    /// Cumulative `(upper bound, count)` pairs; the last pair has bound
    /// `None` and equals the total.
    pub fn cumulative(&self) -> Vec<(Option<u64>, u64)> {
        let mut running = 0u64;
        self.counts
            .iter()
            .enumerate()
            .map(|(i, count)| {
                running += count.load(Ordering::Relaxed);
                (self.bounds.get(i).copied(), running)
            })
            .collect()
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.sum.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::operation_latency()
    }
}
