//! Per-node failure tracking.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use passage_core::defaults::{DEFAULT_FAIL_TIMEOUT, DEFAULT_MAX_FAILS};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Consecutive-failure counter with a dead-until timestamp.
///
/// A node is dead while `now < dead_until`. Selectors skip dead nodes;
/// when every candidate is dead they fall back to the one whose
/// dead-until expires soonest. Updates use plain atomics — markers are
/// the only mutable state shared across requests.
#[derive(Debug)]
pub struct Marker {
    fail_count: AtomicU32,
    dead_until_ms: AtomicU64,
    max_fails: u32,
    fail_timeout: Duration,
}

impl Marker {
    pub fn new(max_fails: u32, fail_timeout: Duration) -> Self {
        Self {
            fail_count: AtomicU32::new(0),
            dead_until_ms: AtomicU64::new(0),
            max_fails: max_fails.max(1),
            fail_timeout,
        }
    }

    /// Record one failure. Reaching `max_fails` consecutive failures
    /// sets the dead-until deadline and restarts the count.
    pub fn mark(&self) {
        let count = self.fail_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.max_fails {
            self.dead_until_ms
                .store(now_ms() + self.fail_timeout.as_millis() as u64, Ordering::Relaxed);
            self.fail_count.store(0, Ordering::Relaxed);
        }
    }

    /// Record a success: the node is live again immediately.
    pub fn reset(&self) {
        self.fail_count.store(0, Ordering::Relaxed);
        self.dead_until_ms.store(0, Ordering::Relaxed);
    }

    pub fn is_dead(&self) -> bool {
        now_ms() < self.dead_until_ms.load(Ordering::Relaxed)
    }

    /// Raw deadline, for the all-dead fallback ordering.
    pub fn dead_until_ms(&self) -> u64 {
        self.dead_until_ms.load(Ordering::Relaxed)
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILS, DEFAULT_FAIL_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_marker_is_live() {
        let m = Marker::default();
        assert!(!m.is_dead());
        assert_eq!(m.dead_until_ms(), 0);
    }

    #[test]
    fn mark_past_max_fails_sets_future_deadline() {
        let m = Marker::new(3, Duration::from_secs(30));
        m.mark();
        m.mark();
        assert!(!m.is_dead(), "below max_fails must stay live");
        m.mark();
        assert!(m.is_dead());
        assert!(m.dead_until_ms() > now_ms());
    }

    #[test]
    fn reset_after_mark_yields_a_live_node() {
        let m = Marker::new(1, Duration::from_secs(30));
        m.mark();
        assert!(m.is_dead());
        m.reset();
        assert!(!m.is_dead());
        assert_eq!(m.dead_until_ms(), 0);
    }

    #[test]
    fn count_restarts_after_going_dead() {
        let m = Marker::new(2, Duration::from_millis(1));
        m.mark();
        m.mark();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!m.is_dead(), "deadline expired");
        // one more failure is below max_fails again
        m.mark();
        assert!(!m.is_dead());
    }
}
