// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing scheduler and VM events.
//!
//! This keeps the last `N` recorded entries, de-duplicating consecutive
//! identical payloads by bumping a repeat count instead of burning a slot.
//! The design center is the runtime's debug surface: the scheduler owns a
//! buffer of dispatch/fault events and operators read it back through
//! read-only snapshots.
//!
//! Unlike trace buffers that live in statics and are claimed once per boot,
//! this one is an ordinary owned value, so a test (or a second runtime in
//! the same process) gets its own.

#![cfg_attr(not(test), no_std)]

/// One recorded entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Entry<T> {
    /// Wrap count of the buffer at the time this slot was written. Lets a
    /// reader distinguish fresh entries from survivors of earlier laps.
    pub generation: u16,
    /// Number of consecutive times this payload was recorded.
    pub count: u32,
    pub payload: T,
}

/// A ring buffer holding the last `N` distinct entries of type `T`.
///
/// `T` must be `Copy` to keep recording allocation-free and `PartialEq`
/// for the de-duplication check.
#[derive(Clone)]
pub struct Ringbuf<T, const N: usize> {
    /// Index of the most recently written slot, `None` until the first
    /// record.
    last: Option<usize>,
    generation: u16,
    buffer: [Option<Entry<T>>; N],
}

impl<T, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Ringbuf<T, N> {
    // Workaround for array-repeat needing a const when `T: Copy` is not in
    // scope here.
    const EMPTY: Option<Entry<T>> = None;

    pub const fn new() -> Self {
        Self {
            last: None,
            generation: 0,
            buffer: [Self::EMPTY; N],
        }
    }
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Records `payload`. If it equals the most recent payload, the repeat
    /// count of that entry is incremented (saturating) instead of
    /// consuming a new slot.
    pub fn record(&mut self, payload: T) {
        if let Some(last) = self.last {
            if let Some(entry) = &mut self.buffer[last] {
                if entry.payload == payload {
                    entry.count = entry.count.saturating_add(1);
                    return;
                }
            }
        }

        let ndx = match self.last {
            Some(last) if last + 1 < N => last + 1,
            Some(_) => {
                self.generation = self.generation.wrapping_add(1);
                0
            }
            None => 0,
        };
        self.buffer[ndx] = Some(Entry {
            generation: self.generation,
            count: 1,
            payload,
        });
        self.last = Some(ndx);
    }

    /// Iterates recorded entries from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<T>> + '_ {
        // Oldest entry is the one after `last`, once the buffer has
        // wrapped; before that it's slot 0.
        let start = match self.last {
            Some(last) if self.generation > 0 => last + 1,
            _ => 0,
        };
        (0..N)
            .map(move |i| (start + i) % N)
            .filter_map(|i| self.buffer[i].as_ref())
    }

    /// The most recent entry, if any.
    pub fn last_entry(&self) -> Option<&Entry<T>> {
        self.buffer[self.last?].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }
}
