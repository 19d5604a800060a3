//! Resource probes.

/// Point-in-time resource reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSample {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU time consumed (user + system) in microseconds.
    pub cpu_micros: u64,
}

/// Source of resource readings.
pub trait ResourceProbe: Send + Sync {
    /// Take a reading.
    fn sample(&self) -> ResourceSample;
}

/// Probe that always reports zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample::default()
    }
}

/// Process-wide readings from `/proc/self` on Linux.
///
/// Readings are process-wide, so deltas of concurrent operations overlap.
/// On other platforms, or when `/proc` is unreadable, zero is reported.
#[derive(Debug, Clone, Copy)]
pub struct ProcessProbe {
    page_size: u64,
    ticks_per_second: u64,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self {
            page_size: 4096,
            ticks_per_second: 100,
        }
    }
}

impl ProcessProbe {
    /// Create a probe with the usual Linux page size and clock tick rate.
    pub fn new() -> Self {
        Self::default()
    }

    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * self.page_size)
    }

    fn cpu_micros(&self) -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
        // The command name may contain spaces; fields resume after the last ')'.
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // utime and stime are fields 14 and 15 overall, 12 and 13 here.
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some((utime + stime) * 1_000_000 / self.ticks_per_second)
    }
}

impl ResourceProbe for ProcessProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            memory_bytes: self.resident_bytes().unwrap_or(0),
            cpu_micros: self.cpu_micros().unwrap_or(0),
        }
    }
}
