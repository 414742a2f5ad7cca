// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The instruction set, as a table of descriptors.
//!
//! Decode is a single array index: each defined opcode has an
//! [`InsnDesc`] naming its mnemonic, operand width and handler, and the
//! decoder, the disassembler and the tests all read the same table. Adding
//! an instruction is a data change here plus a constant in `zplc-abi`.
//!
//! Handlers run with the pc already advanced past the operand, which is
//! the reference point for relative branches and `CALL` return addresses.
//! A handler either returns a [`Flow`] or a fault; it must not touch
//! memory before its last fallible stack operation has succeeded, so that
//! a faulting instruction leaves memory unmodified.

use crate::hal::Clock;
use crate::memory::Memory;
use crate::strings;
use crate::vm::{Flow, Vm};
use zplc_abi::{op, FaultKind, OperandWidth};

pub(crate) type Handler =
    fn(&mut Vm, &mut Memory, &dyn Clock, u32) -> Result<Flow, FaultKind>;

#[derive(Copy, Clone)]
pub(crate) struct InsnDesc {
    pub name: &'static str,
    pub operand: OperandWidth,
    pub handler: Handler,
}

/// Looks up the descriptor for `opcode`; `None` decodes as
/// `INVALID_OPCODE`.
pub(crate) fn lookup(opcode: u8) -> Option<&'static InsnDesc> {
    TABLE[opcode as usize].as_ref()
}

// === System ===

fn nop(
    _vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Next)
}

fn halt(
    _vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Halt)
}

fn brk(
    _vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Pause)
}

fn get_ticks(
    vm: &mut Vm,
    _mem: &mut Memory,
    clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    vm.push(clock.ticks_ms())?;
    Ok(Flow::Next)
}

fn ret(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Jump(vm.call_pop()?))
}

// === Stack shape ===

fn dup(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.peek(0)?;
    vm.push(v)?;
    Ok(Flow::Next)
}

fn drop_top(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    vm.pop()?;
    Ok(Flow::Next)
}

fn swap(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(b)?;
    vm.push(a)?;
    Ok(Flow::Next)
}

fn over(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.peek(1)?;
    vm.push(v)?;
    Ok(Flow::Next)
}

fn rot(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let c = vm.pop()?;
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(b)?;
    vm.push(c)?;
    vm.push(a)?;
    Ok(Flow::Next)
}

fn pick(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.peek(operand as u16)?;
    vm.push(v)?;
    Ok(Flow::Next)
}

// === Integer arithmetic ===
//
// Signed 32-bit two's-complement, wrapping on overflow. Only a zero
// divisor faults; i32::MIN / -1 wraps.

fn add(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a.wrapping_add(b))?;
    Ok(Flow::Next)
}

fn sub(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a.wrapping_sub(b))?;
    Ok(Flow::Next)
}

fn mul(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a.wrapping_mul(b))?;
    Ok(Flow::Next)
}

fn div(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    if b == 0 {
        return Err(FaultKind::DivByZero);
    }
    vm.push(a.wrapping_div(b) as u32)?;
    Ok(Flow::Next)
}

fn modulo(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    if b == 0 {
        return Err(FaultKind::DivByZero);
    }
    vm.push(a.wrapping_rem(b) as u32)?;
    Ok(Flow::Next)
}

fn neg(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()? as i32;
    vm.push(a.wrapping_neg() as u32)?;
    Ok(Flow::Next)
}

fn abs(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()? as i32;
    vm.push(a.wrapping_abs() as u32)?;
    Ok(Flow::Next)
}

// === Float arithmetic ===
//
// The u32 cell reinterpreted as IEEE-754 binary32. NaNs and infinities
// propagate per the standard; only a divisor of exactly +-0.0 faults.

fn addf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = f32::from_bits(vm.pop()?);
    let a = f32::from_bits(vm.pop()?);
    vm.push((a + b).to_bits())?;
    Ok(Flow::Next)
}

fn subf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = f32::from_bits(vm.pop()?);
    let a = f32::from_bits(vm.pop()?);
    vm.push((a - b).to_bits())?;
    Ok(Flow::Next)
}

fn mulf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = f32::from_bits(vm.pop()?);
    let a = f32::from_bits(vm.pop()?);
    vm.push((a * b).to_bits())?;
    Ok(Flow::Next)
}

fn divf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = f32::from_bits(vm.pop()?);
    let a = f32::from_bits(vm.pop()?);
    if b == 0.0 {
        return Err(FaultKind::DivByZero);
    }
    vm.push((a / b).to_bits())?;
    Ok(Flow::Next)
}

fn negf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = f32::from_bits(vm.pop()?);
    vm.push((-a).to_bits())?;
    Ok(Flow::Next)
}

fn absf(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = f32::from_bits(vm.pop()?);
    vm.push(a.abs().to_bits())?;
    Ok(Flow::Next)
}

// === Logic ===

fn and(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a & b)?;
    Ok(Flow::Next)
}

fn or(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a | b)?;
    Ok(Flow::Next)
}

fn xor(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a ^ b)?;
    Ok(Flow::Next)
}

fn not(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push(!a)?;
    Ok(Flow::Next)
}

// Shift counts are masked to the low 5 bits, like the hardware the
// programs will eventually drive.

fn shl(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a << (b & 31))?;
    Ok(Flow::Next)
}

fn shr(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(a >> (b & 31))?;
    Ok(Flow::Next)
}

fn sar(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()? as i32;
    vm.push((a >> (b & 31)) as u32)?;
    Ok(Flow::Next)
}

// === Compare ===

fn cmp_eq(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push((a == b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_ne(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push((a != b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_lt(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    vm.push((a < b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_le(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    vm.push((a <= b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_gt(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    vm.push((a > b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_ge(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()? as i32;
    let a = vm.pop()? as i32;
    vm.push((a >= b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_ltu(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push((a < b) as u32)?;
    Ok(Flow::Next)
}

fn cmp_gtu(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push((a > b) as u32)?;
    Ok(Flow::Next)
}

// === Immediates ===

fn push8(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    // Sign-extended: PUSH8 0xFF is -1.
    vm.push(operand as u8 as i8 as i32 as u32)?;
    Ok(Flow::Next)
}

fn push16(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    vm.push(operand & 0xFFFF)?;
    Ok(Flow::Next)
}

fn push32(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    vm.push(operand)?;
    Ok(Flow::Next)
}

// === Relative branches ===
//
// The displacement is signed and relative to the byte after the operand,
// where the pc already points.

fn jr_target(vm: &Vm, operand: u32) -> Result<u16, FaultKind> {
    let disp = operand as u8 as i8;
    let target = vm.pc() as i32 + disp as i32;
    if !(0..=0xFFFF).contains(&target) {
        return Err(FaultKind::InvalidPc);
    }
    Ok(target as u16)
}

fn jr(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Jump(jr_target(vm, operand)?))
}

fn jrz(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let target = jr_target(vm, operand)?;
    if vm.pop()? == 0 {
        Ok(Flow::Jump(target))
    } else {
        Ok(Flow::Next)
    }
}

fn jrnz(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let target = jr_target(vm, operand)?;
    if vm.pop()? != 0 {
        Ok(Flow::Jump(target))
    } else {
        Ok(Flow::Next)
    }
}

// === Absolute control ===

fn jmp(
    _vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    Ok(Flow::Jump(operand as u16))
}

fn jz(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    if vm.pop()? == 0 {
        Ok(Flow::Jump(operand as u16))
    } else {
        Ok(Flow::Next)
    }
}

fn jnz(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    if vm.pop()? != 0 {
        Ok(Flow::Jump(operand as u16))
    } else {
        Ok(Flow::Next)
    }
}

fn call(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    vm.call_push(vm.pc())?;
    Ok(Flow::Jump(operand as u16))
}

// === Direct memory ===

fn load8(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = mem.read_u8(operand as u16)?;
    vm.push(v as u32)?;
    Ok(Flow::Next)
}

fn load16(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = mem.read_u16(operand as u16)?;
    vm.push(v as u32)?;
    Ok(Flow::Next)
}

fn load32(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = mem.read_u32(operand as u16)?;
    vm.push(v)?;
    Ok(Flow::Next)
}

fn load64(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = mem.read_u64(operand as u16)?;
    // Low word first, high word on top.
    vm.push(v as u32)?;
    vm.push((v >> 32) as u32)?;
    Ok(Flow::Next)
}

fn store8(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.pop()?;
    mem.write_u8(operand as u16, v as u8)?;
    Ok(Flow::Next)
}

fn store16(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.pop()?;
    mem.write_u16(operand as u16, v as u16)?;
    Ok(Flow::Next)
}

fn store32(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    let v = vm.pop()?;
    mem.write_u32(operand as u16, v)?;
    Ok(Flow::Next)
}

fn store64(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    operand: u32,
) -> Result<Flow, FaultKind> {
    // High word on top, matching LOAD64.
    let high = vm.pop()?;
    let low = vm.pop()?;
    mem.write_u64(operand as u16, (high as u64) << 32 | low as u64)?;
    Ok(Flow::Next)
}

// === Indirect memory ===
//
// The address comes off the stack as a u32 cell; anything that doesn't
// fit the 16-bit space is already out of every region.

fn pop_addr(vm: &mut Vm) -> Result<u16, FaultKind> {
    let addr = vm.pop()?;
    if addr > 0xFFFF {
        return Err(FaultKind::MemViolation);
    }
    Ok(addr as u16)
}

fn loadi8(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = mem.read_u8(addr)?;
    vm.push(v as u32)?;
    Ok(Flow::Next)
}

fn loadi16(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = mem.read_u16(addr)?;
    vm.push(v as u32)?;
    Ok(Flow::Next)
}

fn loadi32(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = mem.read_u32(addr)?;
    vm.push(v)?;
    Ok(Flow::Next)
}

fn storei8(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = vm.pop()?;
    mem.write_u8(addr, v as u8)?;
    Ok(Flow::Next)
}

fn storei16(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = vm.pop()?;
    mem.write_u16(addr, v as u16)?;
    Ok(Flow::Next)
}

fn storei32(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = pop_addr(vm)?;
    let v = vm.pop()?;
    mem.write_u32(addr, v)?;
    Ok(Flow::Next)
}

// === Conversions ===

fn i2f(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()? as i32;
    vm.push((a as f32).to_bits())?;
    Ok(Flow::Next)
}

fn f2i(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = f32::from_bits(vm.pop()?);
    // Truncation toward zero; out-of-range saturates, NaN becomes 0.
    vm.push((a as i32) as u32)?;
    Ok(Flow::Next)
}

fn i2b(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push((a != 0) as u32)?;
    Ok(Flow::Next)
}

fn ext8(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push(a as u8 as i8 as i32 as u32)?;
    Ok(Flow::Next)
}

fn ext16(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push(a as u16 as i16 as i32 as u32)?;
    Ok(Flow::Next)
}

fn zext8(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push(a & 0xFF)?;
    Ok(Flow::Next)
}

fn zext16(
    vm: &mut Vm,
    _mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let a = vm.pop()?;
    vm.push(a & 0xFFFF)?;
    Ok(Flow::Next)
}

// === Strings ===

fn strlen(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = strings::pop_desc_addr(vm)?;
    let len = strings::strlen(mem, addr)?;
    vm.push(len as u32)?;
    Ok(Flow::Next)
}

fn strcpy(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let src = strings::pop_desc_addr(vm)?;
    let dst = strings::pop_desc_addr(vm)?;
    strings::strcpy(mem, dst, src)?;
    Ok(Flow::Next)
}

fn strcat(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let src = strings::pop_desc_addr(vm)?;
    let dst = strings::pop_desc_addr(vm)?;
    strings::strcat(mem, dst, src)?;
    Ok(Flow::Next)
}

fn strcmp(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let b = strings::pop_desc_addr(vm)?;
    let a = strings::pop_desc_addr(vm)?;
    let ord = strings::strcmp(mem, a, b)?;
    vm.push(ord as u32)?;
    Ok(Flow::Next)
}

fn strclr(
    vm: &mut Vm,
    mem: &mut Memory,
    _clock: &dyn Clock,
    _operand: u32,
) -> Result<Flow, FaultKind> {
    let addr = strings::pop_desc_addr(vm)?;
    strings::strclr(mem, addr)?;
    Ok(Flow::Next)
}

// === The table ===

const fn desc(
    name: &'static str,
    operand: OperandWidth,
    handler: Handler,
) -> Option<InsnDesc> {
    Some(InsnDesc {
        name,
        operand,
        handler,
    })
}

static TABLE: [Option<InsnDesc>; 256] = {
    use OperandWidth::{Byte, None as N0, Wide, Word};

    let mut t: [Option<InsnDesc>; 256] = [None; 256];

    t[op::NOP as usize] = desc("NOP", N0, nop);
    t[op::HALT as usize] = desc("HALT", N0, halt);
    t[op::BREAK as usize] = desc("BREAK", N0, brk);
    t[op::GET_TICKS as usize] = desc("GET_TICKS", N0, get_ticks);
    t[op::RET as usize] = desc("RET", N0, ret);

    t[op::DUP as usize] = desc("DUP", N0, dup);
    t[op::DROP as usize] = desc("DROP", N0, drop_top);
    t[op::SWAP as usize] = desc("SWAP", N0, swap);
    t[op::OVER as usize] = desc("OVER", N0, over);
    t[op::ROT as usize] = desc("ROT", N0, rot);

    t[op::ADD as usize] = desc("ADD", N0, add);
    t[op::SUB as usize] = desc("SUB", N0, sub);
    t[op::MUL as usize] = desc("MUL", N0, mul);
    t[op::DIV as usize] = desc("DIV", N0, div);
    t[op::MOD as usize] = desc("MOD", N0, modulo);
    t[op::NEG as usize] = desc("NEG", N0, neg);
    t[op::ABS as usize] = desc("ABS", N0, abs);
    t[op::ADDF as usize] = desc("ADDF", N0, addf);
    t[op::SUBF as usize] = desc("SUBF", N0, subf);
    t[op::MULF as usize] = desc("MULF", N0, mulf);
    t[op::DIVF as usize] = desc("DIVF", N0, divf);
    t[op::NEGF as usize] = desc("NEGF", N0, negf);
    t[op::ABSF as usize] = desc("ABSF", N0, absf);

    t[op::AND as usize] = desc("AND", N0, and);
    t[op::OR as usize] = desc("OR", N0, or);
    t[op::XOR as usize] = desc("XOR", N0, xor);
    t[op::NOT as usize] = desc("NOT", N0, not);
    t[op::SHL as usize] = desc("SHL", N0, shl);
    t[op::SHR as usize] = desc("SHR", N0, shr);
    t[op::SAR as usize] = desc("SAR", N0, sar);
    t[op::EQ as usize] = desc("EQ", N0, cmp_eq);
    t[op::NE as usize] = desc("NE", N0, cmp_ne);
    t[op::LT as usize] = desc("LT", N0, cmp_lt);
    t[op::LE as usize] = desc("LE", N0, cmp_le);
    t[op::GT as usize] = desc("GT", N0, cmp_gt);
    t[op::GE as usize] = desc("GE", N0, cmp_ge);
    t[op::LTU as usize] = desc("LTU", N0, cmp_ltu);
    t[op::GTU as usize] = desc("GTU", N0, cmp_gtu);

    t[op::PUSH8 as usize] = desc("PUSH8", Byte, push8);
    t[op::PICK as usize] = desc("PICK", Byte, pick);
    t[op::JR as usize] = desc("JR", Byte, jr);
    t[op::JRZ as usize] = desc("JRZ", Byte, jrz);
    t[op::JRNZ as usize] = desc("JRNZ", Byte, jrnz);

    t[op::LOADI8 as usize] = desc("LOADI8", N0, loadi8);
    t[op::LOADI16 as usize] = desc("LOADI16", N0, loadi16);
    t[op::LOADI32 as usize] = desc("LOADI32", N0, loadi32);
    t[op::STOREI8 as usize] = desc("STOREI8", N0, storei8);
    t[op::STOREI16 as usize] = desc("STOREI16", N0, storei16);
    t[op::STOREI32 as usize] = desc("STOREI32", N0, storei32);

    t[op::PUSH16 as usize] = desc("PUSH16", Word, push16);
    t[op::LOAD8 as usize] = desc("LOAD8", Word, load8);
    t[op::LOAD16 as usize] = desc("LOAD16", Word, load16);
    t[op::LOAD32 as usize] = desc("LOAD32", Word, load32);
    t[op::LOAD64 as usize] = desc("LOAD64", Word, load64);
    t[op::STORE8 as usize] = desc("STORE8", Word, store8);
    t[op::STORE16 as usize] = desc("STORE16", Word, store16);
    t[op::STORE32 as usize] = desc("STORE32", Word, store32);
    t[op::STORE64 as usize] = desc("STORE64", Word, store64);
    t[op::JMP as usize] = desc("JMP", Word, jmp);
    t[op::JZ as usize] = desc("JZ", Word, jz);
    t[op::JNZ as usize] = desc("JNZ", Word, jnz);
    t[op::CALL as usize] = desc("CALL", Word, call);

    t[op::I2F as usize] = desc("I2F", N0, i2f);
    t[op::F2I as usize] = desc("F2I", N0, f2i);
    t[op::I2B as usize] = desc("I2B", N0, i2b);
    t[op::EXT8 as usize] = desc("EXT8", N0, ext8);
    t[op::EXT16 as usize] = desc("EXT16", N0, ext16);
    t[op::ZEXT8 as usize] = desc("ZEXT8", N0, zext8);
    t[op::ZEXT16 as usize] = desc("ZEXT16", N0, zext16);

    t[op::STRLEN as usize] = desc("STRLEN", N0, strlen);
    t[op::STRCPY as usize] = desc("STRCPY", N0, strcpy);
    t[op::STRCAT as usize] = desc("STRCAT", N0, strcat);
    t[op::STRCMP as usize] = desc("STRCMP", N0, strcmp);
    t[op::STRCLR as usize] = desc("STRCLR", N0, strclr);

    t[op::PUSH32 as usize] = desc("PUSH32", Wide, push32);

    t
};
