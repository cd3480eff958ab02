use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub cache_entries: usize,
    pub fix_operations: usize,
    pub triage_records: usize,
    pub buffered_events: usize,
    pub memory_usage_mb: f32,
}

/// Table sizes sampled by the caller, combined with process-level figures.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableSizes {
    pub cache_entries: usize,
    pub fix_operations: usize,
    pub triage_records: usize,
    pub buffered_events: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, sizes: TableSizes) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            cache_entries: sizes.cache_entries,
            fix_operations: sizes.fix_operations,
            triage_records: sizes.triage_records,
            buffered_events: sizes.buffered_events,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

/// Resident set size from /proc on Linux, 0.0 elsewhere.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
