// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-task virtual machine.
//!
//! A [`Vm`] is a small record of execution state -- program counter,
//! operand stack, return stack -- over the *shared* code region. The
//! scheduler owns one per task slot; nothing here is global. Stack
//! isolation between instances is an invariant the rest of the system
//! leans on: two VMs over the same code never observe each other's state,
//! and the only sanctioned external view is the read-only snapshot taken
//! by the debug surface.
//!
//! The fields are private so the invariants (stack bounds, pc window,
//! fault latching) live in this module and nowhere else.

use crate::hal::Clock;
use crate::insn;
use crate::memory::{Memory, CODE_SIZE};
use crate::{CALL_MAX, STACK_MAX};
use zplc_abi::FaultKind;

/// Execution state of a VM instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecState {
    /// Will execute on the next `step`.
    Ready,
    /// Stopped at a `BREAK`; resumption is an external action.
    Paused,
    /// Ran `HALT`; done until the next cycle reset.
    Halted,
    /// Took a fault, latched here until the next cycle reset.
    Faulted(FaultKind),
}

/// Result of executing a single instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Step {
    Running,
    Paused,
    Halted,
    Fault(FaultKind),
}

/// Result of a bounded run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Run {
    Halted { executed: u32 },
    Paused { executed: u32 },
    /// The instruction budget ran out first. Reported by the scheduler as
    /// an overrun, not a fault: the task gets a fresh cycle next deadline.
    BudgetExhausted { executed: u32 },
    Fault(FaultKind),
}

/// Where execution goes after one instruction; returned by handlers in
/// [`crate::insn`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Flow {
    Next,
    Jump(u16),
    Halt,
    Pause,
}

/// Per-task execution state.
pub struct Vm {
    pc: u16,
    sp: u16,
    csp: u16,
    stack: [u32; STACK_MAX],
    call_stack: [u16; CALL_MAX],
    /// Effective operand-stack depth for this task, `<= STACK_MAX`.
    stack_limit: u16,
    entry_point: u16,
    code_limit: u16,
    state: ExecState,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A fresh instance: empty stacks, no fault, pc at zero, bound to an
    /// empty code slice until [`set_entry`](Vm::set_entry).
    pub const fn new() -> Self {
        Self {
            pc: 0,
            sp: 0,
            csp: 0,
            stack: [0; STACK_MAX],
            call_stack: [0; CALL_MAX],
            stack_limit: STACK_MAX as u16,
            entry_point: 0,
            code_limit: 0,
            state: ExecState::Ready,
        }
    }

    /// Installs the task's slice of the code region. `pc` is confined to
    /// `[entry_point, entry_point + code_limit)` from here on.
    pub fn set_entry(
        &mut self,
        entry_point: u16,
        code_limit: u16,
    ) -> Result<(), FaultKind> {
        let end = entry_point as u32 + code_limit as u32;
        if code_limit == 0 || end > CODE_SIZE as u32 {
            return Err(FaultKind::InvalidPc);
        }
        self.entry_point = entry_point;
        self.code_limit = code_limit;
        self.pc = entry_point;
        Ok(())
    }

    /// Caps the operand stack for this task; 0 selects the full
    /// [`STACK_MAX`] depth. Anything above the physical maximum is an
    /// error rather than a silent clamp.
    pub fn set_stack_limit(&mut self, cells: u16) -> Result<(), FaultKind> {
        if cells as usize > STACK_MAX {
            return Err(FaultKind::StackOverflow);
        }
        self.stack_limit = if cells == 0 {
            STACK_MAX as u16
        } else {
            cells
        };
        Ok(())
    }

    /// Rewinds to the top of a cycle: pc at the entry point, both stacks
    /// empty, any latched fault cleared.
    pub fn reset_cycle(&mut self) {
        self.pc = self.entry_point;
        self.sp = 0;
        self.csp = 0;
        self.state = ExecState::Ready;
    }

    /// Clears a `Paused` state so the next `step` continues after the
    /// `BREAK`. No effect in any other state.
    pub fn resume(&mut self) {
        if self.state == ExecState::Paused {
            self.state = ExecState::Ready;
        }
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn sp(&self) -> u16 {
        self.sp
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn fault(&self) -> Option<FaultKind> {
        match self.state {
            ExecState::Faulted(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.state == ExecState::Halted
    }

    pub fn entry_point(&self) -> u16 {
        self.entry_point
    }

    /// Top of the operand stack, if anything is on it.
    pub fn top(&self) -> Option<u32> {
        self.sp.checked_sub(1).map(|i| self.stack[i as usize])
    }

    /// Reads a stack cell for tests and snapshots; index 0 is the bottom.
    pub fn stack_cell(&self, index: u16) -> Option<u32> {
        if index < self.sp {
            Some(self.stack[index as usize])
        } else {
            None
        }
    }

    pub(crate) fn push(&mut self, v: u32) -> Result<(), FaultKind> {
        if self.sp >= self.stack_limit {
            return Err(FaultKind::StackOverflow);
        }
        self.stack[self.sp as usize] = v;
        self.sp += 1;
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<u32, FaultKind> {
        self.sp = self.sp.checked_sub(1).ok_or(FaultKind::StackUnderflow)?;
        Ok(self.stack[self.sp as usize])
    }

    /// Cell `depth` below the top; `depth` 0 is the top itself.
    pub(crate) fn peek(&self, depth: u16) -> Result<u32, FaultKind> {
        let i = self
            .sp
            .checked_sub(1 + depth)
            .ok_or(FaultKind::StackUnderflow)?;
        Ok(self.stack[i as usize])
    }

    pub(crate) fn call_push(&mut self, ret: u16) -> Result<(), FaultKind> {
        if self.csp as usize >= CALL_MAX {
            return Err(FaultKind::CallOverflow);
        }
        self.call_stack[self.csp as usize] = ret;
        self.csp += 1;
        Ok(())
    }

    pub(crate) fn call_pop(&mut self) -> Result<u16, FaultKind> {
        self.csp = self.csp.checked_sub(1).ok_or(FaultKind::CallUnderflow)?;
        Ok(self.call_stack[self.csp as usize])
    }

    fn window_end(&self) -> u32 {
        self.entry_point as u32 + self.code_limit as u32
    }

    fn in_window(&self, pc: u32) -> bool {
        pc >= self.entry_point as u32 && pc < self.window_end()
    }

    /// Decodes and executes one instruction.
    ///
    /// On a fault the pc is left at the faulting instruction (not past it)
    /// so snapshots point at the culprit, and the fault is latched until
    /// [`reset_cycle`](Vm::reset_cycle).
    pub fn step(&mut self, mem: &mut Memory, clock: &dyn Clock) -> Step {
        match self.state {
            ExecState::Halted => return Step::Halted,
            ExecState::Paused => return Step::Paused,
            ExecState::Faulted(k) => return Step::Fault(k),
            ExecState::Ready => {}
        }

        let insn_addr = self.pc;
        match self.execute_one(mem, clock) {
            Ok(Flow::Next) => Step::Running,
            Ok(Flow::Jump(target)) => {
                if self.in_window(target as u32) {
                    self.pc = target;
                    Step::Running
                } else {
                    self.pc = insn_addr;
                    self.state = ExecState::Faulted(FaultKind::InvalidPc);
                    Step::Fault(FaultKind::InvalidPc)
                }
            }
            Ok(Flow::Halt) => {
                self.state = ExecState::Halted;
                Step::Halted
            }
            Ok(Flow::Pause) => {
                self.state = ExecState::Paused;
                Step::Paused
            }
            Err(kind) => {
                self.pc = insn_addr;
                self.state = ExecState::Faulted(kind);
                Step::Fault(kind)
            }
        }
    }

    fn execute_one(
        &mut self,
        mem: &mut Memory,
        clock: &dyn Clock,
    ) -> Result<Flow, FaultKind> {
        let code = mem.code();
        if !self.in_window(self.pc as u32) || self.pc as usize >= code.len() {
            return Err(FaultKind::InvalidPc);
        }

        let opcode = code[self.pc as usize];
        let desc = insn::lookup(opcode).ok_or(FaultKind::InvalidOpcode)?;

        // The whole instruction, operand included, must sit inside the
        // task's window (and the loaded program).
        let end = self.pc as u32 + 1 + desc.operand.bytes() as u32;
        if end > self.window_end() || end as usize > code.len() {
            return Err(FaultKind::InvalidPc);
        }

        let mut operand: u32 = 0;
        for i in 0..desc.operand.bytes() {
            operand |=
                (code[(self.pc + 1 + i) as usize] as u32) << (8 * i as u32);
        }

        // Advance past the instruction before executing: relative branches
        // and CALL return addresses are defined in terms of the byte after
        // the operand.
        self.pc = end as u16;

        (desc.handler)(self, mem, clock, operand)
    }

    /// Steps until halt, pause, fault, or `budget` instructions have
    /// executed (0 means no budget).
    pub fn run(
        &mut self,
        mem: &mut Memory,
        clock: &dyn Clock,
        budget: u32,
    ) -> Run {
        let mut executed = 0u32;
        loop {
            match self.state {
                ExecState::Halted => return Run::Halted { executed },
                ExecState::Paused => return Run::Paused { executed },
                ExecState::Faulted(k) => return Run::Fault(k),
                ExecState::Ready => {}
            }
            if budget != 0 && executed >= budget {
                return Run::BudgetExhausted { executed };
            }
            match self.step(mem, clock) {
                Step::Running => executed += 1,
                Step::Halted => {
                    return Run::Halted {
                        executed: executed + 1,
                    }
                }
                Step::Paused => {
                    return Run::Paused {
                        executed: executed + 1,
                    }
                }
                Step::Fault(k) => return Run::Fault(k),
            }
        }
    }
}
