// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler time representation.

/// A moment on the platform's monotonic clock, in microseconds.
///
/// The zero point is whatever the HAL says it is (typically boot); only
/// differences and ordering matter to the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_micros(us: u64) -> Self {
        Timestamp(us)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    pub fn saturating_add_micros(self, us: u32) -> Self {
        Timestamp(self.0.saturating_add(us as u64))
    }

    /// Microseconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}
