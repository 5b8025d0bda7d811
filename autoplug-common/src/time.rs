//! Timestamp utilities
//!
//! `ClockTime` is a nanosecond media time used for buffer levels and
//! watermark thresholds. Wall-clock timestamps (for event metadata) come
//! from chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Media time in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    pub const ZERO: ClockTime = ClockTime(0);
    pub const SECOND: ClockTime = ClockTime(1_000_000_000);
    pub const MSECOND: ClockTime = ClockTime(1_000_000);

    pub const fn from_nseconds(ns: u64) -> Self {
        ClockTime(ns)
    }

    pub const fn from_mseconds(ms: u64) -> Self {
        ClockTime(ms * 1_000_000)
    }

    pub const fn from_seconds(s: u64) -> Self {
        ClockTime(s * 1_000_000_000)
    }

    pub const fn nseconds(self) -> u64 {
        self.0
    }

    pub const fn mseconds(self) -> u64 {
        self.0 / 1_000_000
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: ClockTime) -> ClockTime {
        ClockTime(self.0.saturating_sub(other.0))
    }

    /// Scale by `num / denom` without intermediate overflow
    pub fn mul_div(self, num: u64, denom: u64) -> ClockTime {
        if denom == 0 {
            return ClockTime::ZERO;
        }
        ClockTime(((self.0 as u128 * num as u128) / denom as u128) as u64)
    }
}

impl Add for ClockTime {
    type Output = ClockTime;

    fn add(self, rhs: ClockTime) -> ClockTime {
        ClockTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for ClockTime {
    fn add_assign(&mut self, rhs: ClockTime) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for ClockTime {
    type Output = ClockTime;

    fn sub(self, rhs: ClockTime) -> ClockTime {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        ClockTime(d.as_nanos().min(u64::MAX as u128) as u64)
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl fmt::Display for ClockTime {
    /// Formats as `h:mm:ss.nnnnnnnnn`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.0 % 1_000_000_000;
        let total_secs = self.0 / 1_000_000_000;
        let h = total_secs / 3600;
        let m = (total_secs / 60) % 60;
        let s = total_secs % 60;
        write!(f, "{}:{:02}:{:02}.{:09}", h, m, s, ns)
    }
}
