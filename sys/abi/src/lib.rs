// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ZPLC wire-format definitions, shared between the runtime core and
//! external tooling (compilers, shells, fieldbus bridges).
//!
//! Everything in this crate describes bytes as they appear in a `.zplc`
//! deployment image or in the VM's instruction stream. The runtime engine
//! lives in `zplc-kern`; this crate deliberately contains no behavior
//! beyond validation and field access, so that a compiler emitting `.zplc`
//! files can depend on it without dragging in the engine.

#![cfg_attr(not(test), no_std)]

use zerocopy::{
    byteorder::little_endian as le, FromBytes, Immutable, IntoBytes,
    KnownLayout, Unaligned,
};

/// Magic number opening every `.zplc` image: the bytes `"ZPLC"`.
pub const ZPLC_MAGIC: [u8; 4] = *b"ZPLC";

/// Major format version understood by this core. A mismatch here is a hard
/// load error; minor versions are additive and ignored.
pub const ZPLC_VERSION_MAJOR: u16 = 1;
pub const ZPLC_VERSION_MINOR: u16 = 0;

/// Fixed persistence keys for the stored program blob. There is exactly one
/// key scheme; `"code_len"` holds a little-endian u32 byte count and
/// `"code"` holds the raw `.zplc` image.
pub const PERSIST_KEY_CODE_LEN: &str = "code_len";
pub const PERSIST_KEY_CODE: &str = "code";

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Task dispatch class carried in a [`TaskDef`] record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskType {
    /// One-shot at boot, before any cyclic task's first cycle; the slot is
    /// freed after a successful run.
    Init = 0,
    /// Scheduled every `interval_us`.
    Cyclic = 1,
    /// Reserved; accepted by the loader but never dispatched.
    Event = 2,
}

impl core::convert::TryFrom<u8> for TaskType {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Init),
            1 => Ok(Self::Cyclic),
            2 => Ok(Self::Event),
            _ => Err(()),
        }
    }
}

/// Record describing a single task, 16 bytes inside a `TASK` segment.
///
/// All multi-byte fields are little-endian on the wire; the typed accessors
/// below return host integers. `reserved` must be zero in well-formed
/// images but is not enforced, for forward compatibility.
#[derive(
    Clone, Debug, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct TaskDef {
    pub id: le::U16,
    pub task_type: u8,
    pub priority: u8,
    pub interval_us: le::U32,
    pub entry_point: le::U16,
    pub stack_size: le::U16,
    pub reserved: [u8; 4],
}

const _: () = assert!(core::mem::size_of::<TaskDef>() == 16);

impl TaskDef {
    /// Builds a record from host values; the canonical constructor for
    /// tooling that emits `TASK` segments.
    pub fn new(
        id: u16,
        task_type: TaskType,
        priority: Priority,
        interval_us: u32,
        entry_point: u16,
        stack_size: u16,
    ) -> Self {
        Self {
            id: le::U16::new(id),
            task_type: task_type as u8,
            priority: priority.0,
            interval_us: le::U32::new(interval_us),
            entry_point: le::U16::new(entry_point),
            stack_size: le::U16::new(stack_size),
            reserved: [0; 4],
        }
    }

    /// Decodes the dispatch class, rejecting unknown type bytes.
    pub fn task_type(&self) -> Result<TaskType, ()> {
        TaskType::try_from(self.task_type)
    }

    pub fn priority(&self) -> Priority {
        Priority(self.priority)
    }
}

bitflags::bitflags! {
    /// Header flag word of a `.zplc` image.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct HeaderFlags: u32 {
        /// Payload CRC must be present and verified.
        const CRC_REQUIRED = 1 << 0;
        /// Image carries a SIGNATURE segment.
        const SIGNED = 1 << 1;

        const RESERVED = !3;
    }
}

/// The 32-byte header opening a `.zplc` image.
#[derive(
    Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct ZplcHeader {
    /// Must equal [`ZPLC_MAGIC`].
    pub magic: [u8; 4],
    pub version_major: le::U16,
    pub version_minor: le::U16,
    /// Bits defined by [`HeaderFlags`]; unknown bits are ignored.
    pub flags: le::U32,
    /// CRC-32 (ISO-HDLC) over the payload, zero if absent.
    pub crc32: le::U32,
    /// Total bytes of `CODE` segment payload.
    pub code_size: le::U32,
    /// Sum of all non-`CODE` segment payload bytes.
    pub data_size: le::U32,
    /// Program counter of the first task, as a code-region offset.
    pub entry_point: le::U16,
    /// Number of 8-byte entries in the segment table that follows.
    pub segment_count: le::U16,
    /// Must be zero.
    pub reserved: le::U32,
}

const _: () = assert!(core::mem::size_of::<ZplcHeader>() == 32);

impl ZplcHeader {
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(self.flags.get())
    }
}

/// One 8-byte entry of the segment table.
#[derive(
    Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C)]
pub struct SegmentEntry {
    pub seg_type: le::U16,
    pub flags: le::U16,
    pub size: le::U32,
}

const _: () = assert!(core::mem::size_of::<SegmentEntry>() == 8);

/// Segment payload types. Unknown values are skipped by the loader for
/// forward compatibility, so this enum lists everything the format
/// defines rather than just what the core happens to consume.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum SegmentType {
    Code = 1,
    Data = 2,
    Symbol = 3,
    Task = 4,
    IoMap = 5,
    Debug = 6,
    Tag = 7,
    Signature = 8,
}

impl core::convert::TryFrom<u16> for SegmentType {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Code),
            2 => Ok(Self::Data),
            3 => Ok(Self::Symbol),
            4 => Ok(Self::Task),
            5 => Ok(Self::IoMap),
            6 => Ok(Self::Debug),
            7 => Ok(Self::Tag),
            8 => Ok(Self::Signature),
            _ => Err(()),
        }
    }
}

/// A fault taken by a VM instance.
///
/// Faults are never recovered inside the VM: the cycle aborts, the fault is
/// latched on the instance for the debug surface, and dispatch continues
/// with other tasks. `BudgetExhausted` is the one soft member: the
/// scheduler reports it as an overrun and re-arms the task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultKind {
    /// Push with the operand stack already at its configured depth.
    StackOverflow,
    /// Pop or peek past the bottom of the operand stack.
    StackUnderflow,
    /// `CALL` nesting beyond the return-stack depth.
    CallOverflow,
    /// `RET` with no pending return address.
    CallUnderflow,
    /// Byte at the program counter names no instruction.
    InvalidOpcode,
    /// Program counter left the task's code slice.
    InvalidPc,
    /// Memory access outside its region, crossing a region boundary, or
    /// writing the code region.
    MemViolation,
    /// Integer or float division with a zero divisor.
    DivByZero,
    /// String descriptor violated `len <= cap` or its byte range.
    StringBounds,
    /// Cycle instruction budget ran out before `HALT`.
    BudgetExhausted,
}

impl FaultKind {
    /// Stable wire name, used in the debug JSON and operator error lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StackOverflow => "STACK_OVERFLOW",
            Self::StackUnderflow => "STACK_UNDERFLOW",
            Self::CallOverflow => "CALL_OVERFLOW",
            Self::CallUnderflow => "CALL_UNDERFLOW",
            Self::InvalidOpcode => "INVALID_OPCODE",
            Self::InvalidPc => "INVALID_PC",
            Self::MemViolation => "MEM_VIOLATION",
            Self::DivByZero => "DIV_BY_ZERO",
            Self::StringBounds => "STRING_BOUNDS",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
        }
    }
}

/// Errors surfaced by the loader. The previously loaded program, if any,
/// keeps running when a load fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    BadMagic,
    VersionMismatch,
    /// Declared sizes exceed the buffer, or a segment walk ran off the end.
    Truncated,
    CrcMismatch,
    NoCode,
    NoTasks,
    CodeTooLarge,
    TaskLimit,
}

impl LoadError {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadMagic => "BAD_MAGIC",
            Self::VersionMismatch => "VERSION_MISMATCH",
            Self::Truncated => "TRUNCATED",
            Self::CrcMismatch => "CRC_MISMATCH",
            Self::NoCode => "NO_CODE",
            Self::NoTasks => "NO_TASKS",
            Self::CodeTooLarge => "CODE_TOO_LARGE",
            Self::TaskLimit => "TASK_LIMIT",
        }
    }
}

/// Operand bytes following an opcode in the instruction stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandWidth {
    /// Opcode stands alone.
    None,
    /// One byte; interpretation (signed/unsigned) is per instruction.
    Byte,
    /// Two bytes, little-endian.
    Word,
    /// Four bytes, little-endian.
    Wide,
}

impl OperandWidth {
    /// Number of operand bytes following the opcode.
    pub const fn bytes(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Word => 2,
            Self::Wide => 4,
        }
    }
}

/// The opcode map.
///
/// Opcodes are single bytes in category-encoded ranges; the operand form is
/// uniform within each range, which is what makes [`operand_width`] a pure
/// range test. Gaps inside a range decode as `INVALID_OPCODE`.
pub mod op {
    // System, 0x00-0x0F, no operand.
    pub const NOP: u8 = 0x00;
    pub const HALT: u8 = 0x01;
    pub const BREAK: u8 = 0x02;
    pub const GET_TICKS: u8 = 0x03;
    pub const RET: u8 = 0x04;

    // Stack shape, 0x10-0x1F, no operand.
    pub const DUP: u8 = 0x10;
    pub const DROP: u8 = 0x11;
    pub const SWAP: u8 = 0x12;
    pub const OVER: u8 = 0x13;
    pub const ROT: u8 = 0x14;

    // Arithmetic, 0x20-0x2F, no operand. Integer ops are signed 32-bit
    // two's-complement; float ops reinterpret the u32 cell as IEEE-754
    // binary32.
    pub const ADD: u8 = 0x20;
    pub const SUB: u8 = 0x21;
    pub const MUL: u8 = 0x22;
    pub const DIV: u8 = 0x23;
    pub const MOD: u8 = 0x24;
    pub const NEG: u8 = 0x25;
    pub const ABS: u8 = 0x26;
    pub const ADDF: u8 = 0x28;
    pub const SUBF: u8 = 0x29;
    pub const MULF: u8 = 0x2A;
    pub const DIVF: u8 = 0x2B;
    pub const NEGF: u8 = 0x2C;
    pub const ABSF: u8 = 0x2D;

    // Logic and compare, 0x30-0x3F, no operand. Comparisons push 1 or 0.
    pub const AND: u8 = 0x30;
    pub const OR: u8 = 0x31;
    pub const XOR: u8 = 0x32;
    pub const NOT: u8 = 0x33;
    pub const SHL: u8 = 0x34;
    pub const SHR: u8 = 0x35;
    pub const SAR: u8 = 0x36;
    pub const EQ: u8 = 0x37;
    pub const NE: u8 = 0x38;
    pub const LT: u8 = 0x39;
    pub const LE: u8 = 0x3A;
    pub const GT: u8 = 0x3B;
    pub const GE: u8 = 0x3C;
    pub const LTU: u8 = 0x3D;
    pub const GTU: u8 = 0x3E;

    // Immediate/short, 0x40-0x5F, 1-byte operand.
    pub const PUSH8: u8 = 0x40;
    pub const PICK: u8 = 0x41;
    pub const JR: u8 = 0x48;
    pub const JRZ: u8 = 0x49;
    pub const JRNZ: u8 = 0x4A;

    // Memory indirect, 0x70-0x7F, no operand; address popped from stack.
    pub const LOADI8: u8 = 0x70;
    pub const LOADI16: u8 = 0x71;
    pub const LOADI32: u8 = 0x72;
    pub const STOREI8: u8 = 0x74;
    pub const STOREI16: u8 = 0x75;
    pub const STOREI32: u8 = 0x76;

    // Memory/control, 0x80-0x9F, 2-byte little-endian operand.
    pub const PUSH16: u8 = 0x80;
    pub const LOAD8: u8 = 0x81;
    pub const LOAD16: u8 = 0x82;
    pub const LOAD32: u8 = 0x83;
    pub const LOAD64: u8 = 0x84;
    pub const STORE8: u8 = 0x85;
    pub const STORE16: u8 = 0x86;
    pub const STORE32: u8 = 0x87;
    pub const STORE64: u8 = 0x88;
    pub const JMP: u8 = 0x90;
    pub const JZ: u8 = 0x91;
    pub const JNZ: u8 = 0x92;
    pub const CALL: u8 = 0x93;

    // Conversions, 0xA0-0xAF, no operand.
    pub const I2F: u8 = 0xA0;
    pub const F2I: u8 = 0xA1;
    pub const I2B: u8 = 0xA2;
    pub const EXT8: u8 = 0xA3;
    pub const EXT16: u8 = 0xA4;
    pub const ZEXT8: u8 = 0xA5;
    pub const ZEXT16: u8 = 0xA6;

    // Strings, 0xB0-0xBF, no operand; descriptor addresses popped from
    // stack.
    pub const STRLEN: u8 = 0xB0;
    pub const STRCPY: u8 = 0xB1;
    pub const STRCAT: u8 = 0xB2;
    pub const STRCMP: u8 = 0xB3;
    pub const STRCLR: u8 = 0xB4;

    // Wide immediate, 0xC0-0xCF, 4-byte little-endian operand.
    pub const PUSH32: u8 = 0xC0;

    use super::OperandWidth;

    /// Operand form implied by an opcode's range. Holds for every defined
    /// opcode; for undefined bytes it is the form a decoder should assume
    /// when skipping.
    pub const fn operand_width(opcode: u8) -> OperandWidth {
        match opcode {
            0x40..=0x5F => OperandWidth::Byte,
            0x80..=0x9F => OperandWidth::Word,
            0xC0..=0xCF => OperandWidth::Wide,
            _ => OperandWidth::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::{FromBytes, IntoBytes};

    #[test]
    fn task_def_round_trips_through_wire_bytes() {
        let def = TaskDef::new(
            3,
            TaskType::Cyclic,
            Priority(7),
            10_000,
            0x0120,
            128,
        );
        let bytes = def.as_bytes();
        assert_eq!(bytes.len(), 16);
        // Spot-check the little-endian layout.
        assert_eq!(&bytes[0..2], &[3, 0]);
        assert_eq!(bytes[2], 1);
        assert_eq!(bytes[3], 7);
        assert_eq!(&bytes[4..8], &10_000u32.to_le_bytes());

        let back = TaskDef::read_from_bytes(bytes).unwrap();
        assert_eq!(back.id.get(), 3);
        assert_eq!(back.task_type().unwrap(), TaskType::Cyclic);
        assert_eq!(back.interval_us.get(), 10_000);
        assert_eq!(back.entry_point.get(), 0x0120);
        assert_eq!(back.stack_size.get(), 128);
    }

    #[test]
    fn header_parses_from_unaligned_bytes() {
        let mut raw = [0u8; 33];
        raw[1..5].copy_from_slice(&ZPLC_MAGIC);
        raw[5..7].copy_from_slice(&1u16.to_le_bytes());
        // segment_count sits at header offset 26.
        raw[27..29].copy_from_slice(&2u16.to_le_bytes());
        // Parse at offset 1 so the struct would be misaligned if it had any
        // alignment requirement.
        let hdr = ZplcHeader::read_from_bytes(&raw[1..]).unwrap();
        assert_eq!(hdr.magic, ZPLC_MAGIC);
        assert_eq!(hdr.version_major.get(), 1);
        assert_eq!(hdr.segment_count.get(), 2);
    }

    #[test]
    fn operand_width_matches_range_encoding() {
        assert_eq!(op::operand_width(op::HALT), OperandWidth::None);
        assert_eq!(op::operand_width(op::PUSH8), OperandWidth::Byte);
        assert_eq!(op::operand_width(op::JRZ), OperandWidth::Byte);
        assert_eq!(op::operand_width(op::STORE64), OperandWidth::Word);
        assert_eq!(op::operand_width(op::PUSH32), OperandWidth::Wide);
        assert_eq!(op::operand_width(op::STRCMP), OperandWidth::None);
    }

    #[test]
    fn unknown_segment_and_task_types_are_rejected() {
        assert!(SegmentType::try_from(9u16).is_err());
        assert_eq!(SegmentType::try_from(4u16), Ok(SegmentType::Task));
        assert!(TaskType::try_from(3u8).is_err());
    }
}
