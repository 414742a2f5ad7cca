// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One runtime: memory, lock, scheduler, wired together.
//!
//! [`Runtime`] is the facade the shell and platform integrations talk to.
//! It enforces the one sequencing rule the lower layers can't see on
//! their own: the code region changes only while dispatch is stopped.
//! Everything else is delegation.
//!
//! A `Runtime` is a large value (the memory regions live inline); embed it
//! in a `static`, or box it on hosted platforms.

use crate::hal::{Hal, HalError};
use crate::loader;
use crate::memory::{ImageLock, Memory};
use crate::policy::Policy;
use crate::sched::{Poll, RegisterError, Scheduler};
use crate::time::Timestamp;
use zplc_abi::LoadError;

/// Failure of a composite load-and-register operation. Parsing and
/// registration are separate layers with separate error vocabularies;
/// this keeps both visible to the operator instead of flattening one
/// into the other.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeployError {
    Load(LoadError),
    Register(RegisterError),
}

impl DeployError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load(e) => e.as_str(),
            Self::Register(e) => e.as_str(),
        }
    }
}

impl From<LoadError> for DeployError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<RegisterError> for DeployError {
    fn from(e: RegisterError) -> Self {
        Self::Register(e)
    }
}

pub struct Runtime {
    mem: Memory,
    lock: ImageLock,
    sched: Scheduler,
}

impl Runtime {
    pub const fn new(policy: Policy) -> Self {
        Self {
            mem: Memory::new(),
            lock: ImageLock::new(),
            sched: Scheduler::new(policy),
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    /// Mutable memory access, for HAL latch paths and tests. Fieldbus
    /// adapters must hold [`Runtime::image_lock`] around their batches.
    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn image_lock(&self) -> &ImageLock {
        &self.lock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Loads a `.zplc` image and registers its tasks, stopping dispatch
    /// first. Tasks are required: a program with nothing to schedule is a
    /// configuration error, not a deployment.
    pub fn load<H: Hal>(
        &mut self,
        bytes: &[u8],
        hal: &mut H,
    ) -> Result<usize, DeployError> {
        self.sched.stop();
        let program = loader::load(
            &mut self.mem,
            bytes,
            true,
            self.sched.policy(),
        )?;
        let now = Timestamp::from_micros(hal.now_us());
        Ok(self.sched.register_program(&program, now)?)
    }

    /// Raw-mode load: bare bytecode as one default cyclic task.
    pub fn load_raw<H: Hal>(
        &mut self,
        bytes: &[u8],
        hal: &mut H,
    ) -> Result<usize, DeployError> {
        self.sched.stop();
        let program = loader::load_raw(&mut self.mem, bytes)?;
        let now = Timestamp::from_micros(hal.now_us());
        Ok(self.sched.register_program(&program, now)?)
    }

    /// Persists `image` as the boot program. Callers pass the same bytes
    /// they just loaded; a failure here leaves the running program intact.
    pub fn persist_image<H: Hal>(
        &mut self,
        image: &[u8],
        hal: &mut H,
    ) -> Result<(), HalError> {
        loader::persist(hal, image)
    }

    /// Boot-time restore: replays a persisted program, if any, leaving the
    /// runtime stopped but fully registered. Returns the task count.
    pub fn replay_persisted<H: Hal>(
        &mut self,
        hal: &mut H,
        scratch: &mut [u8],
    ) -> Result<Option<usize>, DeployError> {
        let Some(program) = loader::replay(
            &mut self.mem,
            hal,
            scratch,
            self.sched.policy(),
        )?
        else {
            return Ok(None);
        };
        let now = Timestamp::from_micros(hal.now_us());
        Ok(Some(self.sched.register_program(&program, now)?))
    }

    pub fn start<H: Hal>(&mut self, hal: &mut H) {
        self.sched.start(&mut self.mem, &self.lock, hal);
    }

    pub fn stop(&mut self) {
        self.sched.stop();
    }

    /// Operator reset: clears faults and stats, re-arms every slot, zeroes
    /// the volatile regions (retain per policy).
    pub fn reset<H: Hal>(&mut self, hal: &mut H) {
        let clear_retain = self.sched.policy().clear_retain_on_reset;
        self.mem.reset(clear_retain);
        self.sched
            .reset_slots(Timestamp::from_micros(hal.now_us()));
    }

    pub fn resume(&mut self, slot: usize) -> bool {
        self.sched.resume(slot)
    }

    pub fn unregister(&mut self, slot: usize) -> bool {
        self.sched.unregister_task(slot)
    }

    /// One dispatcher pass; the caller owns the sleep.
    pub fn poll<H: Hal>(&mut self, hal: &mut H) -> Poll {
        self.sched.poll(&mut self.mem, &self.lock, hal)
    }

    /// Convenience dispatch loop for platforms whose main loop is just
    /// "run the PLC": polls and sleeps until `deadline` passes or
    /// dispatch goes idle.
    pub fn run_until<H: Hal>(&mut self, hal: &mut H, deadline: Timestamp) {
        while hal.now_us() < deadline.as_micros() {
            match self.poll(hal) {
                Poll::Ran { .. } => {}
                Poll::Sleep { until } => {
                    hal.sleep_until(until.min(deadline));
                }
                Poll::Idle => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{IPI_BASE, OPI_BASE};
    use crate::test_util::{build_image, FakeHal, Prog};
    use zplc_abi::{op, Priority, TaskDef, TaskType};

    fn image_with_one_task(code: &Prog) -> Vec<u8> {
        let def =
            TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 0);
        build_image(code.bytes(), &[def])
    }

    #[test]
    fn load_start_poll_flushes_outputs() {
        let code = Prog::new()
            .load8(IPI_BASE)
            .push8(1)
            .op(op::ADD)
            .store8(OPI_BASE)
            .op(op::HALT);
        let image = image_with_one_task(&code);

        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut hal = FakeHal::default();
        assert_eq!(rt.load(&image, &mut hal).unwrap(), 1);

        rt.memory_mut().write_u8(IPI_BASE, 41).unwrap();
        rt.start(&mut hal);
        match rt.poll(&mut hal) {
            Poll::Ran { slot } => assert_eq!(slot, 0),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rt.memory().read_u8(OPI_BASE).unwrap(), 42);
        // The HAL saw the flush.
        assert_eq!(hal.flushed.last().unwrap()[0], 42);
    }

    #[test]
    fn load_requires_tasks() {
        let code = Prog::new().op(op::HALT);
        let image = build_image(code.bytes(), &[]);
        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut hal = FakeHal::default();
        assert_eq!(
            rt.load(&image, &mut hal),
            Err(DeployError::Load(LoadError::NoTasks))
        );
    }

    #[test]
    fn loading_stops_dispatch() {
        let code = Prog::new().op(op::HALT);
        let image = image_with_one_task(&code);
        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut hal = FakeHal::default();
        rt.load(&image, &mut hal).unwrap();
        rt.start(&mut hal);
        assert_eq!(
            rt.scheduler().state(),
            crate::sched::SchedulerState::Running
        );

        rt.load(&image, &mut hal).unwrap();
        assert_eq!(
            rt.scheduler().state(),
            crate::sched::SchedulerState::Stopped
        );
        // A restart picks the new registrations up.
        rt.start(&mut hal);
        match rt.poll(&mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn persisted_program_replays_at_boot() {
        let code = Prog::new().push8(9).store8(OPI_BASE).op(op::HALT);
        let image = image_with_one_task(&code);

        let mut hal = FakeHal::default();
        {
            let mut rt = Box::new(Runtime::new(Policy::default()));
            rt.load(&image, &mut hal).unwrap();
            rt.persist_image(&image, &mut hal).unwrap();
        }

        // "Power cycle": new runtime, same HAL store.
        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut scratch = vec![0u8; 64 * 1024];
        let count =
            rt.replay_persisted(&mut hal, &mut scratch).unwrap();
        assert_eq!(count, Some(1));
        rt.start(&mut hal);
        match rt.poll(&mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rt.memory().read_u8(OPI_BASE).unwrap(), 9);
    }

    #[test]
    fn reset_clears_outputs_and_faults() {
        let code = Prog::new().op(op::DROP).op(op::HALT);
        let image = image_with_one_task(&code);
        let mut rt = Box::new(Runtime::new(Policy::default()));
        let mut hal = FakeHal::default();
        rt.load(&image, &mut hal).unwrap();
        rt.start(&mut hal);
        match rt.poll(&mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(rt.scheduler().slot(0).unwrap().last_fault().is_some());

        rt.reset(&mut hal);
        assert!(rt.scheduler().slot(0).unwrap().last_fault().is_none());
        // Code survives a reset; only the data regions are wiped.
        assert!(rt.memory().code_len() > 0);
    }
}
