//! Wall-clock abstraction
//!
//! Lease arithmetic is done in epoch seconds (plus a nanosecond fraction)
//! because capability validity travels to clients as `vtime`/`vtime_ns`.
//! Registries take a `Clock` so tests and scenario replay can move time
//! deterministically.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Point in time as epoch seconds plus sub-second nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Timestamp `secs` seconds later, keeping the sub-second fraction
    pub fn plus_secs(self, secs: u64) -> Self {
        Self {
            secs: self.secs.saturating_add(secs),
            nanos: self.nanos,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Real wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let now = Utc::now();
        Timestamp {
            secs: u64::try_from(now.timestamp()).unwrap_or(0),
            nanos: now.timestamp_subsec_nanos(),
        }
    }
}

/// Manually driven clock for tests and scenario replay
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock second
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    pub fn advance(&self, secs: u64) {
        let mut now = self.now.lock();
        *now = now.plus_secs(secs);
    }

    pub fn set(&self, ts: Timestamp) {
        *self.now.lock() = ts;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
