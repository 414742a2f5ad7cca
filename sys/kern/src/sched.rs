// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cyclic task scheduler.
//!
//! One dispatcher runs cycles serially. Each of the [`MAX_TASKS`] slots
//! pairs a task definition with its own [`Vm`] instance; all slots share
//! the code region and the process memory. Selection is by priority at
//! cycle boundaries only -- once a cycle starts it runs to `HALT`, fault,
//! pause or budget, which is what keeps a cycle atomic with respect to the
//! process image.
//!
//! Deadline bookkeeping is deliberately dull: a slot becomes ready when
//! `next_deadline <= now`, and after a cycle its deadline advances by one
//! interval. If that advanced deadline is already in the past the slot is
//! counted as overrun and re-based on `now` -- one late cycle costs one
//! overrun, not a burst of cascading catch-up cycles.

use crate::hal::Hal;
use crate::memory::{ImageLock, Memory, Region};
use crate::policy::{FaultResponse, Policy};
use crate::time::Timestamp;
use crate::vm::{Run, Vm};
use crate::{loader::Program, MAX_TASKS};
use zplc_abi::{FaultKind, Priority, TaskDef, TaskType};
use zplc_ringbuf::Ringbuf;

/// Gate state of the dispatch loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerState {
    /// Fresh; nothing has ever been started.
    Idle,
    Running,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }
}

/// Schedulability of one slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    Ready,
    /// Hit a `BREAK`; waiting for an operator resume.
    Paused,
    /// Faulted under [`FaultResponse::Disable`], or during its one INIT
    /// shot; not scheduled until an operator reset.
    Errored(FaultKind),
}

/// Decoded task definition, host-endian. The wire form lives in
/// `zplc-abi`; this is what the scheduler actually consults every cycle.
#[derive(Copy, Clone, Debug)]
pub struct Task {
    pub id: u16,
    pub task_type: TaskType,
    pub priority: Priority,
    pub interval_us: u32,
    pub entry_point: u16,
    pub stack_size: u16,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TaskStats {
    /// Completed cycles (ran to `HALT`).
    pub cycle_count: u32,
    pub overrun_count: u32,
    pub last_exec_time_us: u32,
    pub next_deadline_us: u64,
}

/// One occupied scheduler slot.
pub struct TaskSlot {
    task: Task,
    vm: Vm,
    stats: TaskStats,
    state: SlotState,
    /// Most recent fault, kept for the debug surface even when the policy
    /// re-arms the task.
    last_fault: Option<FaultKind>,
    /// Set by `resume`: the next dispatch continues after the `BREAK`
    /// instead of resetting the cycle.
    resume_pending: bool,
}

impl TaskSlot {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn stats(&self) -> &TaskStats {
        &self.stats
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn last_fault(&self) -> Option<FaultKind> {
        self.last_fault
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }
}

/// Why `register_task` refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterError {
    NoFreeSlot,
    BadTaskType,
    /// Entry point not inside the loaded code.
    BadEntryPoint,
    /// Requested stack depth exceeds the physical maximum.
    BadStackSize,
}

impl RegisterError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoFreeSlot => "NO_FREE_SLOT",
            Self::BadTaskType => "BAD_TASK_TYPE",
            Self::BadEntryPoint => "BAD_ENTRY_POINT",
            Self::BadStackSize => "BAD_STACK_SIZE",
        }
    }
}

/// Outcome of one dispatcher pass.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Poll {
    /// Ran one cycle of the named slot.
    Ran { slot: usize },
    /// Nothing ready; nearest deadline to sleep toward.
    Sleep { until: Timestamp },
    /// Not running, or no schedulable tasks at all.
    Idle,
}

/// Trace events recorded for the debug surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Start,
    Stop,
    Register { slot: u8 },
    Unregister { slot: u8 },
    InitRun { slot: u8 },
    Dispatch { slot: u8 },
    Overrun { slot: u8 },
    Paused { slot: u8 },
    Fault { slot: u8, kind: FaultKind },
}

/// Entries retained in the scheduler's trace buffer.
pub const TRACE_DEPTH: usize = 32;

pub struct Scheduler {
    slots: [Option<TaskSlot>; MAX_TASKS],
    state: SchedulerState,
    policy: Policy,
    started_at: Timestamp,
    trace: Ringbuf<Event, TRACE_DEPTH>,
}

impl Scheduler {
    const FREE: Option<TaskSlot> = None;

    pub const fn new(policy: Policy) -> Self {
        Self {
            slots: [Self::FREE; MAX_TASKS],
            state: SchedulerState::Idle,
            policy,
            started_at: Timestamp::from_micros(0),
            trace: Ringbuf::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn slot(&self, index: usize) -> Option<&TaskSlot> {
        self.slots.get(index)?.as_ref()
    }

    /// Occupied slots with their indices, for stats and snapshots.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &TaskSlot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    pub fn active_tasks(&self) -> usize {
        self.slots().count()
    }

    /// Sums across slots: `(cycles, overruns)`.
    pub fn totals(&self) -> (u32, u32) {
        self.slots().fold((0, 0), |(c, o), (_, s)| {
            (
                c.wrapping_add(s.stats.cycle_count),
                o.wrapping_add(s.stats.overrun_count),
            )
        })
    }

    pub fn trace(&self) -> &Ringbuf<Event, TRACE_DEPTH> {
        &self.trace
    }

    /// Claims a free slot for `def`, binding a fresh VM to the task's
    /// slice of the loaded code (entry point through end of program).
    pub fn register_task(
        &mut self,
        def: &TaskDef,
        code_len: u32,
        now: Timestamp,
    ) -> Result<usize, RegisterError> {
        let task_type =
            def.task_type().map_err(|_| RegisterError::BadTaskType)?;
        let entry = def.entry_point.get();
        if (entry as u32) >= code_len {
            return Err(RegisterError::BadEntryPoint);
        }

        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(RegisterError::NoFreeSlot)?;

        let mut vm = Vm::new();
        vm.set_stack_limit(def.stack_size.get())
            .map_err(|_| RegisterError::BadStackSize)?;
        vm.set_entry(entry, (code_len - entry as u32) as u16)
            .map_err(|_| RegisterError::BadEntryPoint)?;

        let interval = def.interval_us.get();
        let task = Task {
            id: def.id.get(),
            task_type,
            priority: def.priority(),
            interval_us: if interval == 0 {
                crate::DEFAULT_INTERVAL_US
            } else {
                interval
            },
            entry_point: entry,
            stack_size: def.stack_size.get(),
        };

        self.slots[index] = Some(TaskSlot {
            task,
            vm,
            stats: TaskStats {
                next_deadline_us: now.as_micros(),
                ..TaskStats::default()
            },
            state: SlotState::Ready,
            last_fault: None,
            resume_pending: false,
        });
        self.trace.record(Event::Register { slot: index as u8 });
        Ok(index)
    }

    /// Registers every task of a freshly loaded program. All-or-nothing:
    /// existing registrations are dropped first, since the code they were
    /// bound to is gone.
    pub fn register_program(
        &mut self,
        program: &Program,
        now: Timestamp,
    ) -> Result<usize, RegisterError> {
        self.slots = [Self::FREE; MAX_TASKS];
        for def in &program.tasks {
            self.register_task(def, program.code_len, now)?;
        }
        Ok(program.tasks.len())
    }

    pub fn unregister_task(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.trace.record(Event::Unregister { slot: index as u8 });
                true
            }
            _ => false,
        }
    }

    /// Opens the dispatch gate. INIT tasks run exactly once, in ascending
    /// task-id order, before any cyclic task becomes ready; a clean INIT
    /// frees its slot, a faulted one stays visible as `Errored`.
    pub fn start<H: Hal>(
        &mut self,
        mem: &mut Memory,
        lock: &ImageLock,
        hal: &mut H,
    ) {
        if self.state == SchedulerState::Running {
            return;
        }
        self.started_at = Timestamp::from_micros(hal.now_us());
        self.trace.record(Event::Start);

        // Ascending id, not slot order.
        loop {
            let next = self
                .slots()
                .filter(|(_, s)| {
                    s.task.task_type == TaskType::Init
                        && matches!(s.state, SlotState::Ready)
                })
                .min_by_key(|(_, s)| s.task.id)
                .map(|(i, _)| i);
            let Some(index) = next else { break };

            self.trace.record(Event::InitRun { slot: index as u8 });
            let outcome = self.run_cycle(index, mem, lock, hal);
            match outcome {
                Run::Fault(_) | Run::Paused { .. } => {
                    // Slot kept (errored or paused, per run_cycle), so an
                    // operator can see what the boot hook did. A resumed
                    // INIT gets its continuation at the next start.
                }
                _ => {
                    // One-shot means one shot, even if it overran.
                    self.slots[index] = None;
                }
            }
        }

        // Cyclic tasks all become due immediately.
        let now = hal.now_us();
        for slot in self.slots.iter_mut().flatten() {
            if slot.task.task_type == TaskType::Cyclic {
                slot.stats.next_deadline_us = now;
            }
        }
        self.state = SchedulerState::Running;
    }

    pub fn stop(&mut self) {
        if self.state == SchedulerState::Running {
            self.state = SchedulerState::Stopped;
            self.trace.record(Event::Stop);
        }
    }

    /// Clears a `BREAK` pause; the slot's next dispatch continues after
    /// the breakpoint instead of restarting the cycle.
    pub fn resume(&mut self, index: usize) -> bool {
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.state != SlotState::Paused {
            return false;
        }
        slot.vm.resume();
        slot.state = SlotState::Ready;
        slot.resume_pending = true;
        true
    }

    /// Operator reset: faults cleared, stats zeroed, every surviving slot
    /// re-armed at `now`. Code and registrations stay.
    pub fn reset_slots(&mut self, now: Timestamp) {
        for slot in self.slots.iter_mut().flatten() {
            slot.vm.reset_cycle();
            slot.state = SlotState::Ready;
            slot.last_fault = None;
            slot.resume_pending = false;
            slot.stats = TaskStats {
                next_deadline_us: now.as_micros(),
                ..TaskStats::default()
            };
        }
    }

    /// One dispatcher pass: pick the most important due cyclic task and
    /// run one cycle of it.
    pub fn poll<H: Hal>(
        &mut self,
        mem: &mut Memory,
        lock: &ImageLock,
        hal: &mut H,
    ) -> Poll {
        if self.state != SchedulerState::Running {
            return Poll::Idle;
        }
        let now = hal.now_us();

        let mut chosen: Option<(usize, Priority, u16)> = None;
        let mut nearest: Option<u64> = None;
        for (i, slot) in self.slots() {
            if slot.task.task_type != TaskType::Cyclic
                || slot.state != SlotState::Ready
            {
                continue;
            }
            let deadline = slot.stats.next_deadline_us;
            if deadline <= now {
                let better = match chosen {
                    None => true,
                    Some((_, prio, id)) => {
                        slot.task.priority.is_more_important_than(prio)
                            || (slot.task.priority == prio
                                && slot.task.id < id)
                    }
                };
                if better {
                    chosen = Some((i, slot.task.priority, slot.task.id));
                }
            } else {
                nearest = Some(match nearest {
                    None => deadline,
                    Some(d) => d.min(deadline),
                });
            }
        }

        let Some((index, _, _)) = chosen else {
            return match nearest {
                Some(deadline) => Poll::Sleep {
                    until: Timestamp::from_micros(deadline),
                },
                None => Poll::Idle,
            };
        };

        self.trace.record(Event::Dispatch { slot: index as u8 });
        let outcome = self.run_cycle(index, mem, lock, hal);

        // Deadline arithmetic happens whatever the outcome: a faulted or
        // paused task does not get to starve the others by staying
        // perpetually due.
        let now = hal.now_us();
        if let Some(slot) = self.slots[index].as_mut() {
            let interval = slot.task.interval_us as u64;
            let next = slot.stats.next_deadline_us + interval;
            if next <= now {
                // Already late for the next cycle: one overrun, re-base,
                // no cascading catch-up.
                slot.stats.overrun_count =
                    slot.stats.overrun_count.wrapping_add(1);
                slot.stats.next_deadline_us = now + interval;
                self.trace.record(Event::Overrun { slot: index as u8 });
            } else {
                slot.stats.next_deadline_us = next;
            }
            if matches!(outcome, Run::BudgetExhausted { .. }) {
                slot.stats.overrun_count =
                    slot.stats.overrun_count.wrapping_add(1);
                self.trace.record(Event::Overrun { slot: index as u8 });
            }
        }

        Poll::Ran { slot: index }
    }

    /// Runs one cycle of `index` under the process-image lock: latch,
    /// reset (or resume), run, flush, account.
    fn run_cycle<H: Hal>(
        &mut self,
        index: usize,
        mem: &mut Memory,
        lock: &ImageLock,
        hal: &mut H,
    ) -> Run {
        let _guard = lock.lock();
        hal.latch_inputs(mem.region_mut(Region::Ipi));

        let budget = self.policy.cycle_budget;
        let fault_response = self.policy.fault_response;
        let Some(slot) = self.slots[index].as_mut() else {
            return Run::Halted { executed: 0 };
        };

        if slot.resume_pending {
            slot.resume_pending = false;
        } else {
            slot.vm.reset_cycle();
        }

        let begin = hal.now_us();
        let outcome = slot.vm.run(mem, &*hal, budget);
        slot.stats.last_exec_time_us =
            hal.now_us().saturating_sub(begin) as u32;

        match outcome {
            Run::Halted { .. } => {
                slot.stats.cycle_count =
                    slot.stats.cycle_count.wrapping_add(1);
            }
            Run::Paused { .. } => {
                slot.state = SlotState::Paused;
                self.trace.record(Event::Paused { slot: index as u8 });
            }
            Run::BudgetExhausted { .. } => {
                // Accounted by the caller; the VM state is simply
                // discarded at the next cycle reset.
            }
            Run::Fault(kind) => {
                slot.last_fault = Some(kind);
                match (slot.task.task_type, fault_response) {
                    (TaskType::Init, _) | (_, FaultResponse::Disable) => {
                        slot.state = SlotState::Errored(kind);
                    }
                    (_, FaultResponse::Rearm) => {
                        // Stays Ready; next cycle starts clean.
                    }
                }
                self.trace.record(Event::Fault {
                    slot: index as u8,
                    kind,
                });
            }
        }

        hal.flush_outputs(mem.region(Region::Opi));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::WORK_BASE;
    use crate::policy::Policy;
    use crate::test_util::{FakeHal, Prog};
    use zplc_abi::op;

    /// Two programs in one code blob: entry 0 increments work[0], entry
    /// offset `SECOND` increments work[4].
    const SECOND: u16 = 13;

    fn counter_code() -> Prog {
        let p = Prog::new()
            .load32(WORK_BASE) // 0..3
            .push8(1) // 3..5
            .op(op::ADD) // 5
            .store32(WORK_BASE) // 6..9
            .op(op::HALT); // 9
        assert_eq!(p.bytes().len(), 10);
        let p = p.raw(&[0, 0, 0]); // padding to offset 13
        p.load32(WORK_BASE + 16)
            .push8(1)
            .op(op::ADD)
            .store32(WORK_BASE + 16)
            .op(op::HALT)
    }

    fn cyclic(id: u16, priority: u8, interval_us: u32, entry: u16) -> TaskDef {
        TaskDef::new(
            id,
            TaskType::Cyclic,
            Priority(priority),
            interval_us,
            entry,
            0,
        )
    }

    fn setup(defs: &[TaskDef]) -> (Memory, ImageLock, Scheduler, FakeHal) {
        let code = counter_code();
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let now = Timestamp::from_micros(hal.now_us);
        for def in defs {
            sched.register_task(def, mem.code_len(), now).unwrap();
        }
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);
        (mem, lock, sched, hal)
    }

    #[test]
    fn register_validates_its_inputs() {
        let mut sched = Scheduler::new(Policy::default());
        let now = Timestamp::from_micros(0);

        let def = cyclic(0, 0, 10_000, 99);
        assert_eq!(
            sched.register_task(&def, 10, now),
            Err(RegisterError::BadEntryPoint)
        );

        let mut def = cyclic(0, 0, 10_000, 0);
        def.task_type = 7;
        assert_eq!(
            sched.register_task(&def, 10, now),
            Err(RegisterError::BadTaskType)
        );

        let def = TaskDef::new(
            0,
            TaskType::Cyclic,
            Priority(0),
            10_000,
            0,
            (crate::STACK_MAX + 1) as u16,
        );
        assert_eq!(
            sched.register_task(&def, 10, now),
            Err(RegisterError::BadStackSize)
        );

        for i in 0..MAX_TASKS {
            let def = cyclic(i as u16, 0, 10_000, 0);
            sched.register_task(&def, 10, now).unwrap();
        }
        let def = cyclic(99, 0, 10_000, 0);
        assert_eq!(
            sched.register_task(&def, 10, now),
            Err(RegisterError::NoFreeSlot)
        );
    }

    #[test]
    fn init_tasks_run_once_ascending_id_before_cyclics() {
        // Two INIT tasks, registered out of id order, each bumping a
        // different counter; plus one cyclic.
        let init_hi = TaskDef::new(
            5,
            TaskType::Init,
            Priority(0),
            0,
            SECOND,
            0,
        );
        let init_lo = TaskDef::new(1, TaskType::Init, Priority(0), 0, 0, 0);
        let cyc = cyclic(2, 0, 10_000, 0);

        let code = counter_code();
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let now = Timestamp::from_micros(0);
        sched.register_task(&init_hi, mem.code_len(), now).unwrap();
        sched.register_task(&init_lo, mem.code_len(), now).unwrap();
        sched.register_task(&cyc, mem.code_len(), now).unwrap();
        let lock = ImageLock::new();

        sched.start(&mut mem, &lock, &mut hal);

        // Both INITs ran (their counters moved) and their slots are gone.
        assert_eq!(mem.read_u32(WORK_BASE).unwrap(), 1);
        assert_eq!(mem.read_u32(WORK_BASE + 16).unwrap(), 1);
        assert_eq!(sched.active_tasks(), 1);
        // Ascending id: InitRun slot 1 (id 1) precedes slot 0 (id 5).
        let order: Vec<Event> = sched
            .trace()
            .entries()
            .map(|e| e.payload)
            .filter(|e| matches!(e, Event::InitRun { .. }))
            .collect();
        assert_eq!(
            order,
            vec![Event::InitRun { slot: 1 }, Event::InitRun { slot: 0 }]
        );

        // The cyclic task still works afterwards.
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("expected a cycle, got {other:?}"),
        }
        assert_eq!(mem.read_u32(WORK_BASE).unwrap(), 2);
    }

    #[test]
    fn priority_then_id_breaks_ties() {
        // Both due at the same instant. B is more important.
        let a = cyclic(1, 5, 10_000, 0);
        let b = cyclic(2, 1, 10_000, SECOND);
        let (mut mem, lock, mut sched, mut hal) = setup(&[a, b]);

        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { slot } => assert_eq!(slot, 1),
            other => panic!("unexpected {other:?}"),
        }

        // Same priority: lower id wins.
        let a = cyclic(7, 3, 10_000, 0);
        let b = cyclic(4, 3, 10_000, SECOND);
        let (mut mem, lock, mut sched, mut hal) = setup(&[a, b]);
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { slot } => assert_eq!(slot, 1, "id 4 should win"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn sleep_reports_the_nearest_deadline() {
        let a = cyclic(0, 0, 10_000, 0);
        let b = cyclic(1, 0, 3_000, SECOND);
        let (mut mem, lock, mut sched, mut hal) = setup(&[a, b]);

        // Drain the initially-due cycles.
        loop {
            match sched.poll(&mut mem, &lock, &mut hal) {
                Poll::Ran { .. } => {}
                Poll::Sleep { until } => {
                    let now = hal.now_us;
                    assert!(until.as_micros() > now);
                    // Nearest deadline belongs to the 3 ms task.
                    let slot1 = sched.slot(1).unwrap();
                    assert_eq!(
                        until.as_micros(),
                        slot1.stats().next_deadline_us
                    );
                    break;
                }
                Poll::Idle => panic!("scheduler should be running"),
            }
        }
    }

    #[test]
    fn ten_to_one_interval_ratio_holds() {
        // Task A: 10 ms, priority 0, counts work[0]. Task B: 100 ms,
        // priority 1, counts work[4]. Run 10 simulated seconds.
        let a = cyclic(0, 0, 10_000, 0);
        let b = cyclic(1, 1, 100_000, SECOND);
        let (mut mem, lock, mut sched, mut hal) = setup(&[a, b]);

        while hal.now_us < 10_000_000 {
            match sched.poll(&mut mem, &lock, &mut hal) {
                Poll::Ran { .. } => {}
                Poll::Sleep { until } => hal.sleep_until(until),
                Poll::Idle => panic!("scheduler should be running"),
            }
        }

        let fast = mem.read_u32(WORK_BASE).unwrap() as f64;
        let slow = mem.read_u32(WORK_BASE + 16).unwrap() as f64;
        let ratio = fast / slow;
        assert!(
            (9.0..=11.0).contains(&ratio),
            "expected ~10:1, got {fast}:{slow}"
        );
        // And the absolute counts are in the right ballpark for 10 s.
        assert!((900.0..=1100.0).contains(&fast), "fast ran {fast} times");

        let (cycles, overruns) = sched.totals();
        assert_eq!(cycles, fast as u32 + slow as u32);
        assert_eq!(overruns, 0);
    }

    #[test]
    fn budget_exhaustion_counts_overruns_and_rearms() {
        // An infinite loop at offset 0.
        let code = Prog::new().jmp(0);
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let policy = Policy {
            cycle_budget: 100,
            ..Policy::default()
        };
        let mut sched = Scheduler::new(policy);
        let mut hal = FakeHal::default();
        let def = cyclic(0, 0, 10_000, 0);
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);

        for _ in 0..3 {
            match sched.poll(&mut mem, &lock, &mut hal) {
                Poll::Ran { .. } => {}
                Poll::Sleep { until } => hal.sleep_until(until),
                Poll::Idle => panic!("should keep running"),
            }
        }
        let slot = sched.slot(0).unwrap();
        assert!(slot.stats().overrun_count >= 1);
        assert_eq!(slot.stats().cycle_count, 0);
        // Not a fault: the slot is still schedulable.
        assert_eq!(slot.state(), SlotState::Ready);
        assert_eq!(slot.last_fault(), None);
    }

    #[test]
    fn fault_policy_rearm_versus_disable() {
        let code = Prog::new().op(op::DROP).op(op::HALT); // faults instantly
        let def = cyclic(0, 0, 10_000, 0);

        // Rearm (default): fault surfaces but the task keeps its turn.
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);
        for _ in 0..2 {
            match sched.poll(&mut mem, &lock, &mut hal) {
                Poll::Ran { slot } => assert_eq!(slot, 0),
                Poll::Sleep { until } => hal.sleep_until(until),
                Poll::Idle => panic!("rearm should keep scheduling"),
            }
        }
        let slot = sched.slot(0).unwrap();
        assert_eq!(slot.last_fault(), Some(FaultKind::StackUnderflow));
        assert_eq!(slot.state(), SlotState::Ready);

        // Disable: one fault parks the slot.
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let policy = Policy {
            fault_response: FaultResponse::Disable,
            ..Policy::default()
        };
        let mut sched = Scheduler::new(policy);
        let mut hal = FakeHal::default();
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            sched.slot(0).unwrap().state(),
            SlotState::Errored(FaultKind::StackUnderflow)
        );
        // Nothing left to schedule.
        assert_eq!(sched.poll(&mut mem, &lock, &mut hal), Poll::Idle);

        // Operator reset clears the slate.
        sched.reset_slots(Timestamp::from_micros(hal.now_us));
        assert_eq!(sched.slot(0).unwrap().state(), SlotState::Ready);
        assert_eq!(sched.slot(0).unwrap().last_fault(), None);
    }

    #[test]
    fn paused_task_waits_for_resume() {
        let code = Prog::new()
            .push32(1)
            .op(op::BREAK)
            .push32(2)
            .op(op::HALT);
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let def = cyclic(0, 0, 10_000, 0);
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);

        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sched.slot(0).unwrap().state(), SlotState::Paused);
        // Paused slots are invisible to the dispatcher.
        assert_eq!(sched.poll(&mut mem, &lock, &mut hal), Poll::Idle);

        assert!(sched.resume(0));
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            Poll::Sleep { .. } | Poll::Idle => {
                panic!("resumed slot should dispatch")
            }
        }
        // The cycle continued rather than restarting: both pushes on the
        // stack, one completed cycle.
        let slot = sched.slot(0).unwrap();
        assert_eq!(slot.stats().cycle_count, 1);
        assert!(slot.vm().is_halted());
        assert_eq!(slot.vm().sp(), 2);
    }

    #[test]
    fn event_tasks_occupy_a_slot_but_never_run() {
        let code = counter_code();
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let def =
            TaskDef::new(0, TaskType::Event, Priority(0), 10_000, 0, 0);
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);

        assert_eq!(sched.poll(&mut mem, &lock, &mut hal), Poll::Idle);
        assert_eq!(sched.active_tasks(), 1);
        assert_eq!(mem.read_u32(WORK_BASE).unwrap(), 0);
    }
}
