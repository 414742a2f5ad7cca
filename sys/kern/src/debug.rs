// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The read-only debug surface.
//!
//! Everything here is a pure function over `&Scheduler` / `&Memory`:
//! snapshot structs for in-process callers, and JSON emitters for the
//! operator protocol. JSON is written field-by-field into a
//! caller-provided [`core::fmt::Write`] sink -- no allocation, no
//! serializer machinery -- because the primary consumer is a serial shell
//! on a platform with no heap. Strings we emit are all fixed tokens
//! (state names, fault names), so no escaping is needed.
//!
//! The one deliberate mutation in this module, [`memory_poke`], is gated
//! by policy and confined to the input image, where it is
//! indistinguishable from a fieldbus write.

use crate::memory::{Memory, Region};
use crate::policy::Policy;
use crate::sched::{Scheduler, SlotState};
use crate::time::Timestamp;
use core::fmt::{self, Write};
use zplc_abi::{FaultKind, TaskType};

/// Point-in-time view of one task's VM.
#[derive(Copy, Clone, Debug)]
pub struct VmSnapshot {
    pub pc: u16,
    pub sp: u16,
    /// Top of stack, if the stack is nonempty.
    pub top: Option<u32>,
    pub halted: bool,
    pub paused: bool,
    pub error: Option<FaultKind>,
}

/// Point-in-time view of the scheduler as a whole.
#[derive(Copy, Clone, Debug)]
pub struct StatsSnapshot {
    pub state: &'static str,
    pub active_tasks: u8,
    pub total_cycles: u32,
    pub total_overruns: u32,
    pub uptime_ms: u32,
}

pub fn vm_snapshot(sched: &Scheduler, slot: usize) -> Option<VmSnapshot> {
    let s = sched.slot(slot)?;
    let vm = s.vm();
    Some(VmSnapshot {
        pc: vm.pc(),
        sp: vm.sp(),
        top: vm.top(),
        halted: vm.is_halted(),
        paused: s.state() == SlotState::Paused,
        // The slot remembers the fault even after the VM was re-armed.
        error: vm.fault().or(s.last_fault()),
    })
}

pub fn stats_snapshot(sched: &Scheduler, now: Timestamp) -> StatsSnapshot {
    let (cycles, overruns) = sched.totals();
    StatsSnapshot {
        state: sched.state().as_str(),
        active_tasks: sched.active_tasks() as u8,
        total_cycles: cycles,
        total_overruns: overruns,
        uptime_ms: (now.saturating_since(sched.started_at()) / 1_000) as u32,
    }
}

/// Reads up to `len` bytes starting at `addr`, honouring region
/// boundaries: the returned slice is shortened at the end of the region
/// rather than spilling into the next one.
pub fn memory_peek(mem: &Memory, addr: u16, len: usize) -> &[u8] {
    let region = Region::containing(addr);
    let offset = (addr - region.base()) as usize;
    let avail = region.size() - offset;
    let take = len.min(avail);
    // Peeking code past the loaded program is allowed; it's zeroed.
    &mem.region(region)[offset..offset + take]
}

/// Writes one byte into the input process image, if policy allows pokes at
/// all. Every other region is off limits no matter what -- poking outputs
/// or work memory from a shell would bypass the cycle discipline.
pub fn memory_poke(
    mem: &mut Memory,
    policy: &Policy,
    addr: u16,
    value: u8,
) -> Result<(), FaultKind> {
    if !policy.allow_poke || Region::containing(addr) != Region::Ipi {
        return Err(FaultKind::MemViolation);
    }
    mem.write_u8(addr, value)
}

fn task_type_str(t: TaskType) -> &'static str {
    match t {
        TaskType::Init => "INIT",
        TaskType::Cyclic => "CYCLIC",
        TaskType::Event => "EVENT",
    }
}

fn slot_state_str(s: SlotState) -> &'static str {
    match s {
        SlotState::Ready => "READY",
        SlotState::Paused => "PAUSED",
        SlotState::Errored(_) => "ERRORED",
    }
}

fn emit_opt_fault(
    w: &mut impl Write,
    fault: Option<FaultKind>,
) -> fmt::Result {
    match fault {
        Some(k) => write!(w, "\"{}\"", k.as_str()),
        None => w.write_str("null"),
    }
}

fn emit_byte_array(w: &mut impl Write, bytes: &[u8]) -> fmt::Result {
    w.write_char('[')?;
    for (i, b) in bytes.iter().enumerate() {
        if i != 0 {
            w.write_char(',')?;
        }
        write!(w, "{b}")?;
    }
    w.write_char(']')
}

/// Emits the `status --json` object: scheduler state, totals, one record
/// per occupied slot, and the first 8 output bytes.
pub fn emit_status(
    w: &mut impl Write,
    sched: &Scheduler,
    mem: &Memory,
    now: Timestamp,
) -> fmt::Result {
    let stats = stats_snapshot(sched, now);
    write!(
        w,
        "{{\"state\":\"{}\",\"uptime_ms\":{},\"stats\":{{\"cycles\":{},\
         \"overruns\":{},\"active_tasks\":{}}},\"tasks\":[",
        stats.state,
        stats.uptime_ms,
        stats.total_cycles,
        stats.total_overruns,
        stats.active_tasks,
    )?;
    let mut first = true;
    for (index, slot) in sched.slots() {
        if !first {
            w.write_char(',')?;
        }
        first = false;
        let task = slot.task();
        let s = slot.stats();
        write!(
            w,
            "{{\"slot\":{},\"id\":{},\"type\":\"{}\",\"priority\":{},\
             \"interval_us\":{},\"entry\":{},\"cycles\":{},\"overruns\":{},\
             \"last_exec_us\":{},\"state\":\"{}\",\"error\":",
            index,
            task.id,
            task_type_str(task.task_type),
            task.priority.0,
            task.interval_us,
            task.entry_point,
            s.cycle_count,
            s.overrun_count,
            s.last_exec_time_us,
            slot_state_str(slot.state()),
        )?;
        emit_opt_fault(w, slot.last_fault())?;
        w.write_char('}')?;
    }
    w.write_str("],\"opi\":")?;
    emit_byte_array(w, &mem.region(Region::Opi)[..8])?;
    w.write_char('}')
}

/// Emits the `dbg info --json` object for one slot: VM registers plus the
/// leading bytes of both process images.
pub fn emit_dbg_info(
    w: &mut impl Write,
    sched: &Scheduler,
    slot: usize,
    mem: &Memory,
) -> fmt::Result {
    let Some(snap) = vm_snapshot(sched, slot) else {
        return w.write_str("{\"error\":\"NO_TASK\"}");
    };
    write!(
        w,
        "{{\"state\":\"{}\",\"pc\":{},\"sp\":{},\"top\":",
        sched.state().as_str(),
        snap.pc,
        snap.sp,
    )?;
    match snap.top {
        Some(v) => write!(w, "{v}")?,
        None => w.write_str("null")?,
    }
    write!(
        w,
        ",\"halted\":{},\"paused\":{},\"error\":",
        snap.halted, snap.paused
    )?;
    emit_opt_fault(w, snap.error)?;
    w.write_str(",\"opi\":")?;
    emit_byte_array(w, &mem.region(Region::Opi)[..8])?;
    w.write_str(",\"ipi\":")?;
    emit_byte_array(w, &mem.region(Region::Ipi)[..8])?;
    w.write_char('}')
}

/// Formats the instruction at code offset `pc` as `0012: PUSH8 0x0A`,
/// returning the offset of the next instruction. Undefined bytes render
/// as `DB 0xNN` and are stepped over one byte at a time, which keeps the
/// listing aligned with what the decoder would fault on.
pub fn disasm_line(
    code: &[u8],
    pc: u16,
    w: &mut impl Write,
) -> Result<u16, fmt::Error> {
    let Some(&opcode) = code.get(pc as usize) else {
        write!(w, "{pc:04X}: <end>")?;
        return Ok(pc);
    };
    let Some(desc) = crate::insn::lookup(opcode) else {
        write!(w, "{pc:04X}: DB {opcode:#04X}")?;
        return Ok(pc + 1);
    };

    let n = desc.operand.bytes();
    let end = pc as usize + 1 + n as usize;
    if end > code.len() {
        write!(w, "{pc:04X}: {} <truncated>", desc.name)?;
        return Ok(code.len() as u16);
    }
    let mut operand: u32 = 0;
    for i in 0..n as usize {
        operand |= (code[pc as usize + 1 + i] as u32) << (8 * i);
    }

    match n {
        0 => write!(w, "{pc:04X}: {}", desc.name)?,
        1 => write!(w, "{pc:04X}: {} {:#04X}", desc.name, operand)?,
        2 => write!(w, "{pc:04X}: {} {:#06X}", desc.name, operand)?,
        _ => write!(w, "{pc:04X}: {} {:#010X}", desc.name, operand)?,
    }
    Ok(end as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ImageLock, IPI_BASE, OPI_BASE, WORK_BASE};
    use crate::sched::Poll;
    use crate::test_util::{FakeHal, Prog};
    use crate::vm::Run;
    use zplc_abi::{op, Priority, TaskDef};

    #[test]
    fn peek_gives_short_reads_at_region_ends() {
        let mut mem = Memory::new();
        mem.write_u8(0x0FFE, 0xAA).unwrap();
        mem.write_u8(0x0FFF, 0xBB).unwrap();
        let got = memory_peek(&mem, 0x0FFE, 16);
        assert_eq!(got, &[0xAA, 0xBB]);
    }

    #[test]
    fn poke_is_gated_and_ipi_only() {
        let mut mem = Memory::new();
        let closed = Policy::default();
        assert_eq!(
            memory_poke(&mut mem, &closed, IPI_BASE, 1),
            Err(FaultKind::MemViolation)
        );

        let open = Policy {
            allow_poke: true,
            ..Policy::default()
        };
        memory_poke(&mut mem, &open, IPI_BASE + 2, 7).unwrap();
        assert_eq!(mem.read_u8(IPI_BASE + 2).unwrap(), 7);
        assert_eq!(
            memory_poke(&mut mem, &open, OPI_BASE, 1),
            Err(FaultKind::MemViolation)
        );
        assert_eq!(
            memory_poke(&mut mem, &open, WORK_BASE, 1),
            Err(FaultKind::MemViolation)
        );
    }

    #[test]
    fn status_json_shape() {
        let code = Prog::new().push8(1).store8(OPI_BASE).op(op::HALT);
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let def = TaskDef::new(
            3,
            zplc_abi::TaskType::Cyclic,
            Priority(2),
            10_000,
            0,
            0,
        );
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }

        let mut out = String::new();
        emit_status(
            &mut out,
            &sched,
            &mem,
            Timestamp::from_micros(hal.now_us),
        )
        .unwrap();

        assert!(out.starts_with("{\"state\":\"RUNNING\""));
        assert!(out.contains("\"active_tasks\":1"));
        assert!(out.contains("\"cycles\":1"));
        assert!(out.contains(
            "\"slot\":0,\"id\":3,\"type\":\"CYCLIC\",\"priority\":2"
        ));
        assert!(out.contains("\"error\":null"));
        assert!(out.ends_with("\"opi\":[1,0,0,0,0,0,0,0]}"));
        // It must be one object with balanced braces (cheap sanity check
        // that the field-by-field emission didn't lose a bracket).
        assert_eq!(
            out.matches('{').count(),
            out.matches('}').count()
        );
    }

    #[test]
    fn dbg_info_reports_faults() {
        let code = Prog::new().push32(1).push32(0).op(op::DIV).op(op::HALT);
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut sched = Scheduler::new(Policy::default());
        let mut hal = FakeHal::default();
        let def = TaskDef::new(
            0,
            zplc_abi::TaskType::Cyclic,
            Priority(0),
            10_000,
            0,
            0,
        );
        sched
            .register_task(&def, mem.code_len(), Timestamp::from_micros(0))
            .unwrap();
        let lock = ImageLock::new();
        sched.start(&mut mem, &lock, &mut hal);
        match sched.poll(&mut mem, &lock, &mut hal) {
            Poll::Ran { .. } => {}
            other => panic!("unexpected {other:?}"),
        }

        let snap = vm_snapshot(&sched, 0).unwrap();
        assert_eq!(snap.error, Some(FaultKind::DivByZero));
        // Faulting DIV is at offset 10; the pc points at it.
        assert_eq!(snap.pc, 10);

        let mut out = String::new();
        emit_dbg_info(&mut out, &sched, 0, &mem).unwrap();
        assert!(out.contains("\"error\":\"DIV_BY_ZERO\""));
        assert!(out.contains("\"pc\":10"));

        let mut out = String::new();
        emit_dbg_info(&mut out, &sched, 5, &mem).unwrap();
        assert_eq!(out, "{\"error\":\"NO_TASK\"}");
    }

    #[test]
    fn vm_run_outcome_matches_snapshot() {
        // Cross-check that a budget overrun does not show up as a fault in
        // the snapshot.
        let code = Prog::new().jmp(0);
        let mut mem = Memory::new();
        mem.load_code(code.bytes(), 0).unwrap();
        let mut vm = crate::vm::Vm::new();
        vm.set_entry(0, mem.code_len() as u16).unwrap();
        let clock = crate::test_util::FakeClock::default();
        assert!(matches!(
            vm.run(&mut mem, &clock, 5),
            Run::BudgetExhausted { .. }
        ));
        assert_eq!(vm.fault(), None);
    }

    #[test]
    fn disassembly_walks_the_descriptor_table() {
        let code = Prog::new()
            .push8(10)
            .push32(0x1234)
            .store16(OPI_BASE)
            .op(op::HALT)
            .raw(&[0x0F]);
        let mut pc = 0;
        let mut lines = Vec::new();
        while (pc as usize) < code.bytes().len() {
            let mut line = String::new();
            let next = disasm_line(code.bytes(), pc, &mut line).unwrap();
            lines.push(line);
            pc = next;
        }
        assert_eq!(
            lines,
            vec![
                "0000: PUSH8 0x0A",
                "0002: PUSH32 0x00001234",
                "0007: STORE16 0x1000",
                "000A: HALT",
                "000B: DB 0x0F",
            ]
        );
    }
}
