//! Per-wearable write throttling on the process-local monotonic clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks, per uid, when a position was last emitted.
///
/// Owned by the single locator task; not shared across processes, so a
/// restart legitimately resets the spacing.  The emit instant is recorded
/// only after a position was actually written — a tick that produces no
/// estimate does not consume the device's throttle slot.
#[derive(Debug)]
pub struct WriteThrottle {
    min_interval: Duration,
    last_emit: HashMap<String, Instant>,
}

impl WriteThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: HashMap::new(),
        }
    }

    /// True when a position for this uid was emitted less than the minimum
    /// interval before `now`.
    pub fn is_throttled(&self, uid: &str, now: Instant) -> bool {
        self.last_emit
            .get(uid)
            .is_some_and(|prev| now.duration_since(*prev) < self.min_interval)
    }

    /// Record that a position for this uid was emitted at `now`.
    pub fn record_emit(&mut self, uid: &str, now: Instant) {
        self.last_emit.insert(uid.to_owned(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_emit_within_interval_is_throttled() {
        let mut throttle = WriteThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(!throttle.is_throttled("W-01", t0));
        throttle.record_emit("W-01", t0);
        assert!(throttle.is_throttled("W-01", t0 + Duration::from_secs(2)));
    }

    #[test]
    fn emit_after_interval_is_allowed() {
        let mut throttle = WriteThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        throttle.record_emit("W-01", t0);
        assert!(!throttle.is_throttled("W-01", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn unrecorded_check_does_not_start_a_window() {
        let mut throttle = WriteThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        // A tick that skipped the uid (no estimate) must not throttle the next one.
        assert!(!throttle.is_throttled("W-01", t0));
        assert!(!throttle.is_throttled("W-01", t0 + Duration::from_secs(1)));
        throttle.record_emit("W-01", t0 + Duration::from_secs(1));
        assert!(throttle.is_throttled("W-01", t0 + Duration::from_secs(3)));
    }

    #[test]
    fn uids_are_throttled_independently() {
        let mut throttle = WriteThrottle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        throttle.record_emit("W-01", t0);
        assert!(!throttle.is_throttled("W-02", t0 + Duration::from_secs(1)));
        assert!(throttle.is_throttled("W-01", t0 + Duration::from_secs(1)));
    }
}
