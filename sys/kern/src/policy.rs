// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runtime policy switches.
//!
//! The design leaves a handful of behaviors to integrator choice. They are
//! collected here as one plain record handed to [`Runtime::new`] rather
//! than scattered as feature flags, so a single binary can host
//! differently-configured runtimes (and so tests can exercise both sides
//! of each switch).
//!
//! [`Runtime::new`]: crate::runtime::Runtime::new

/// What the scheduler does with a slot whose cycle faulted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultResponse {
    /// Latch the fault for the debug surface but keep scheduling the task;
    /// each new cycle starts from a clean VM state.
    Rearm,
    /// Stop scheduling the slot until an operator `reset`.
    Disable,
}

#[derive(Copy, Clone, Debug)]
pub struct Policy {
    /// Verify the payload CRC even when the image's header flags don't
    /// demand it. Images that *store* a nonzero CRC are always checked.
    pub require_crc: bool,
    /// Zero the retain region on `reset`. Off by default: retain exists to
    /// survive restarts.
    pub clear_retain_on_reset: bool,
    /// Permit `memory_poke` on the debug surface. Pokes are restricted to
    /// the input process image even when enabled.
    pub allow_poke: bool,
    pub fault_response: FaultResponse,
    /// Instruction budget per cycle; 0 disables the watchdog entirely.
    pub cycle_budget: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            require_crc: false,
            clear_retain_on_reset: false,
            allow_poke: false,
            fault_response: FaultResponse::Rearm,
            cycle_budget: 100_000,
        }
    }
}
