//! Wall-clock source shared by every table that reasons about age
//! (cache freshness, rate windows, fix-operation timeouts, retention).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since UNIX_EPOCH
    fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Clock that only moves when told to. Used by tests to cross TTL and timeout
/// boundaries without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self { now: AtomicI64::new(start_ms) }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

pub fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

/// Epoch milliseconds to RFC3339, `None` for zero or out-of-range values.
pub fn ms_to_rfc3339(ms: i64) -> Option<String> {
    if ms <= 0 {
        return None;
    }
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).ok()?;
    ts.format(&time::format_description::well_known::Rfc3339).ok()
}

/// Short human label for an age ("3m", "2h 5m", "1d 4h 0m").
pub fn human_duration(ms: i64) -> String {
    let s = ms.max(0) / 1000;
    let d = s / 86_400;
    let h = (s % 86_400) / 3600;
    let m = (s % 3600) / 60;
    if d > 0 {
        format!("{d}d {h}h {m}m")
    } else if h > 0 {
        format!("{h}h {m}m")
    } else {
        format!("{m}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ms(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_human_duration() {
        assert_eq!(human_duration(59_000), "0m");
        assert_eq!(human_duration(5 * 60_000), "5m");
        assert_eq!(human_duration(2 * 3_600_000 + 5 * 60_000), "2h 5m");
        assert_eq!(human_duration(26 * 3_600_000), "1d 2h 0m");
    }

    #[test]
    fn test_ms_to_rfc3339() {
        assert_eq!(ms_to_rfc3339(0), None);
        assert_eq!(ms_to_rfc3339(1_000).as_deref(), Some("1970-01-01T00:00:01Z"));
    }
}
