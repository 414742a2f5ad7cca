// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The platform abstraction consumed by the engine.
//!
//! Everything the core needs from the outside world comes through these
//! traits: a monotonic clock, a way to sleep, process-image I/O, and a
//! small key/value persistence store. Platforms implement them once;
//! everything above is portable. Tests use a hand-cranked fake.

use crate::time::Timestamp;

/// Monotonic time source.
///
/// Split from [`Hal`] because the VM needs nothing else: `GET_TICKS` takes
/// a `&dyn Clock`, which keeps the instruction handlers away from
/// persistence and I/O by construction.
pub trait Clock {
    /// Current time in microseconds since an arbitrary epoch. Must be
    /// monotonically non-decreasing.
    fn now_us(&self) -> u64;

    /// Milliseconds for the `GET_TICKS` opcode. Derived from [`now_us`]
    /// unless the platform has a cheaper source.
    ///
    /// [`now_us`]: Clock::now_us
    fn ticks_ms(&self) -> u32 {
        (self.now_us() / 1_000) as u32
    }
}

/// Full platform interface.
pub trait Hal: Clock {
    /// Blocks until the clock reaches `deadline`. Spurious early wakeups
    /// are fine; the dispatcher re-checks deadlines every pass.
    fn sleep_until(&mut self, deadline: Timestamp);

    /// Copies fresh physical input state into the input process image.
    /// Called by the dispatcher at the top of every cycle, under the
    /// process-image lock.
    fn latch_inputs(&mut self, ipi: &mut [u8]);

    /// Drains the output process image to physical outputs. Called by the
    /// dispatcher at the end of every cycle, under the process-image lock.
    fn flush_outputs(&mut self, opi: &[u8]);

    /// Stores `value` under `key`, replacing any previous value.
    fn persist_write(&mut self, key: &str, value: &[u8])
        -> Result<(), HalError>;

    /// Reads the value under `key` into `buf`, returning the stored
    /// length. A value longer than `buf` is an error, not a partial read.
    fn persist_read(&mut self, key: &str, buf: &mut [u8])
        -> Result<usize, HalError>;

    /// Removes `key`. Absent keys are not an error.
    fn persist_clear(&mut self, key: &str) -> Result<(), HalError>;
}

/// Non-fatal platform failure. HAL errors never crash the core; the
/// triggering operation reports failure and the runtime carries on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HalError {
    /// The platform does not provide this facility at all.
    Unsupported,
    /// No value stored under the requested key.
    NotFound,
    /// The destination buffer is too small for the stored value.
    TooLarge,
    /// The platform tried and failed (I/O error, storage full, ...).
    Failed,
}

impl HalError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "UNSUPPORTED",
            Self::NotFound => "NOT_FOUND",
            Self::TooLarge => "TOO_LARGE",
            Self::Failed => "FAILED",
        }
    }
}
