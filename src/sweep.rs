//! Opportunistic expiry sweeping shared by both registries
//!
//! There is no timer thread. Registry operations ask the sweeper whether a
//! sweep is due; at most one caller per interval gets a `true` and performs
//! the eviction while it already holds the registry's exclusive lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default sweep cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// True if a lease stamped `valid_until` has lapsed at `now`.
///
/// Zero means "valid while the issuing session is open" and never expires.
pub fn is_expired(valid_until: u64, now: u64) -> bool {
    valid_until != 0 && valid_until < now
}

/// Gate that opens at most once per interval
#[derive(Debug)]
pub struct ExpirySweeper {
    interval_secs: u64,
    next_due: AtomicU64,
}

impl ExpirySweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_secs: interval.as_secs(),
            next_due: AtomicU64::new(0),
        }
    }

    /// Claim the sweep for the current interval.
    ///
    /// Returns true for exactly one caller once `now` has passed the previous
    /// deadline, and pushes the deadline `interval` seconds ahead.
    pub fn try_claim(&self, now: u64) -> bool {
        let due = self.next_due.load(Ordering::Acquire);
        if now < due {
            return false;
        }
        self.next_due
            .compare_exchange(
                due,
                now.saturating_add(self.interval_secs),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ExpirySweeper {
    fn default() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }
}
