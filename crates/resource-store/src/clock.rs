//! Time sources for mutation stamps.

use std::fmt;

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

/// Source of the current time.
pub trait Clock: fmt::Debug + Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Smallest step a mutation stamp is pushed past the previous one.
pub const STAMP_RESOLUTION: Duration = Duration::microseconds(1);

/// Stamp for a mutation that must sort strictly after `floor`.
///
/// Uses `now` when the clock has moved past `floor`; otherwise steps just past it so
/// validators keep increasing even if the wall clock stalls or goes backwards.
pub fn next_stamp(now: OffsetDateTime, floor: Option<OffsetDateTime>) -> OffsetDateTime {
    match floor {
        Some(floor) if now <= floor => floor + STAMP_RESOLUTION,
        _ => now,
    }
}
