//! Time source for lease timestamps
//!
//! Timestamps are unix seconds as `f64`, the same representation the stored
//! records and the cooldown scores use. The wall clock is truncated to whole
//! milliseconds: the store-side scripts re-encode records with 14 significant
//! digits, and a millisecond unix time fits in 13, so timestamps survive a
//! trip through the scripts unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Wall clock, millisecond resolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        millis as f64 / 1_000.0
    }
}

/// A clock that only moves when told to.
///
/// Lets cooldown and lease-timeout behavior be exercised without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        let next = self.now() + secs;
        self.set(next);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000.0);
        assert_eq!(clock.now(), 1_000.0);
        clock.advance(5.5);
        assert_eq!(clock.now(), 1_005.5);
        clock.set(42.0);
        assert_eq!(clock.now(), 42.0);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now() > 1_577_836_800.0);
    }

    #[test]
    fn system_clock_survives_fourteen_digit_encoding() {
        let now = SystemClock.now();
        let fraction = now.to_string();
        let decimals = fraction.split('.').nth(1).map_or(0, str::len);
        assert!(decimals <= 3, "got {fraction}");

        // Same precision the store scripts write numbers with (%.14g).
        let reencoded: f64 = format!("{now:.13e}").parse().unwrap();
        assert_eq!(reencoded, now);
    }
}
