// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared test support: a tiny bytecode assembler and hand-cranked fakes
//! for the platform traits.

#![allow(dead_code)]

use crate::hal::{Clock, Hal, HalError};
use crate::memory::Memory;
use crate::time::Timestamp;
use crate::vm::Vm;
use std::cell::Cell;
use std::collections::HashMap;
use zplc_abi::op;

/// Builder for little test programs. Offsets are plain byte positions in
/// the emitted buffer, which the tests load at code offset 0.
#[derive(Default)]
pub struct Prog {
    buf: Vec<u8>,
}

impl Prog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> u16 {
        self.buf.len() as u16
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn op(mut self, opcode: u8) -> Self {
        self.buf.push(opcode);
        self
    }

    pub fn byte_op(mut self, opcode: u8, operand: u8) -> Self {
        self.buf.push(opcode);
        self.buf.push(operand);
        self
    }

    pub fn word_op(mut self, opcode: u8, operand: u16) -> Self {
        self.buf.push(opcode);
        self.buf.extend_from_slice(&operand.to_le_bytes());
        self
    }

    pub fn push8(self, v: u8) -> Self {
        self.byte_op(op::PUSH8, v)
    }

    pub fn push16(self, v: u16) -> Self {
        self.word_op(op::PUSH16, v)
    }

    pub fn push32(mut self, v: u32) -> Self {
        self.buf.push(op::PUSH32);
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Pushes the bit pattern of an f32, for feeding the float ops.
    pub fn pushf(self, v: f32) -> Self {
        self.push32(v.to_bits())
    }

    pub fn jmp(self, target: u16) -> Self {
        self.word_op(op::JMP, target)
    }

    pub fn jz(self, target: u16) -> Self {
        self.word_op(op::JZ, target)
    }

    pub fn jnz(self, target: u16) -> Self {
        self.word_op(op::JNZ, target)
    }

    pub fn call(self, target: u16) -> Self {
        self.word_op(op::CALL, target)
    }

    pub fn load8(self, addr: u16) -> Self {
        self.word_op(op::LOAD8, addr)
    }

    pub fn load16(self, addr: u16) -> Self {
        self.word_op(op::LOAD16, addr)
    }

    pub fn load32(self, addr: u16) -> Self {
        self.word_op(op::LOAD32, addr)
    }

    pub fn load64(self, addr: u16) -> Self {
        self.word_op(op::LOAD64, addr)
    }

    pub fn store8(self, addr: u16) -> Self {
        self.word_op(op::STORE8, addr)
    }

    pub fn store16(self, addr: u16) -> Self {
        self.word_op(op::STORE16, addr)
    }

    pub fn store32(self, addr: u16) -> Self {
        self.word_op(op::STORE32, addr)
    }

    pub fn store64(self, addr: u16) -> Self {
        self.word_op(op::STORE64, addr)
    }
}

/// Loads `prog` at offset 0, runs a fresh VM over it without budget, and
/// hands the VM back for state assertions.
pub fn run_to_halt(prog: &Prog) -> Vm {
    let mut mem = Memory::new();
    mem.load_code(prog.bytes(), 0).unwrap();
    let mut vm = Vm::new();
    vm.set_entry(0, mem.code_len() as u16).unwrap();
    let clock = FakeClock::default();
    let _ = vm.run(&mut mem, &clock, 0);
    vm
}

/// Same, but with a caller-provided memory, for tests that pre-seed IPI or
/// inspect OPI afterwards.
pub fn run_in(prog: &Prog, mem: &mut Memory) -> Vm {
    mem.load_code(prog.bytes(), 0).unwrap();
    let mut vm = Vm::new();
    vm.set_entry(0, mem.code_len() as u16).unwrap();
    let clock = FakeClock::default();
    let _ = vm.run(mem, &clock, 0);
    vm
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct FakeClock {
    us: Cell<u64>,
}

impl FakeClock {
    pub fn at_us(us: u64) -> Self {
        Self { us: Cell::new(us) }
    }

    pub fn advance_us(&self, by: u64) {
        self.us.set(self.us.get() + by);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.us.get()
    }
}

/// A whole fake platform. Sleeping jumps the clock straight to the
/// deadline, so scheduler tests cover simulated hours in microseconds of
/// real time. Each cycle also costs [`FakeHal::cycle_cost_us`] so elapsed
/// time is nonzero.
pub struct FakeHal {
    pub now_us: u64,
    /// Added to the clock by every `latch_inputs`, standing in for the
    /// time a real cycle takes.
    pub cycle_cost_us: u64,
    pub store: HashMap<String, Vec<u8>>,
    pub flushed: Vec<Vec<u8>>,
}

impl Default for FakeHal {
    fn default() -> Self {
        Self {
            now_us: 0,
            cycle_cost_us: 50,
            store: HashMap::new(),
            flushed: Vec::new(),
        }
    }
}

impl Clock for FakeHal {
    fn now_us(&self) -> u64 {
        self.now_us
    }
}

impl Hal for FakeHal {
    fn sleep_until(&mut self, deadline: Timestamp) {
        if deadline.as_micros() > self.now_us {
            self.now_us = deadline.as_micros();
        }
    }

    fn latch_inputs(&mut self, _ipi: &mut [u8]) {
        // Inputs are whatever the test wrote into IPI; latching is free to
        // be a no-op here, but it still costs time.
        self.now_us += self.cycle_cost_us;
    }

    fn flush_outputs(&mut self, opi: &[u8]) {
        self.flushed.push(opi[..8.min(opi.len())].to_vec());
    }

    fn persist_write(
        &mut self,
        key: &str,
        value: &[u8],
    ) -> Result<(), HalError> {
        self.store.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn persist_read(
        &mut self,
        key: &str,
        buf: &mut [u8],
    ) -> Result<usize, HalError> {
        let value = self.store.get(key).ok_or(HalError::NotFound)?;
        if value.len() > buf.len() {
            return Err(HalError::TooLarge);
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn persist_clear(&mut self, key: &str) -> Result<(), HalError> {
        self.store.remove(key);
        Ok(())
    }
}

/// Builds a well-formed `.zplc` image from code bytes and task records.
/// This is the mirror of what the loader parses and what an external
/// compiler would emit.
pub fn build_image(code: &[u8], tasks: &[zplc_abi::TaskDef]) -> Vec<u8> {
    build_image_with(code, tasks, true, zplc_abi::ZPLC_VERSION_MAJOR)
}

pub fn build_image_with(
    code: &[u8],
    tasks: &[zplc_abi::TaskDef],
    with_crc: bool,
    version_major: u16,
) -> Vec<u8> {
    use crc::{Crc, CRC_32_ISO_HDLC};
    use zerocopy::IntoBytes;

    let mut segments: Vec<(u16, Vec<u8>)> = Vec::new();
    segments.push((zplc_abi::SegmentType::Code as u16, code.to_vec()));
    if !tasks.is_empty() {
        let mut task_bytes = Vec::new();
        for t in tasks {
            task_bytes.extend_from_slice(t.as_bytes());
        }
        segments.push((zplc_abi::SegmentType::Task as u16, task_bytes));
    }

    let mut payload = Vec::new();
    let mut table = Vec::new();
    for (seg_type, bytes) in &segments {
        table.extend_from_slice(&seg_type.to_le_bytes());
        table.extend_from_slice(&0u16.to_le_bytes());
        table.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(bytes);
    }

    let crc32 = if with_crc {
        Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&payload)
    } else {
        0
    };
    let data_size: usize = segments
        .iter()
        .filter(|(t, _)| *t != zplc_abi::SegmentType::Code as u16)
        .map(|(_, b)| b.len())
        .sum();

    let mut image = Vec::new();
    image.extend_from_slice(&zplc_abi::ZPLC_MAGIC);
    image.extend_from_slice(&version_major.to_le_bytes());
    image.extend_from_slice(&zplc_abi::ZPLC_VERSION_MINOR.to_le_bytes());
    let flags: u32 = if with_crc { 1 } else { 0 };
    image.extend_from_slice(&flags.to_le_bytes());
    image.extend_from_slice(&crc32.to_le_bytes());
    image.extend_from_slice(&(code.len() as u32).to_le_bytes());
    image.extend_from_slice(&(data_size as u32).to_le_bytes());
    let entry = tasks.first().map(|t| t.entry_point.get()).unwrap_or(0);
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&table);
    image.extend_from_slice(&payload);
    image
}
