// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `.zplc` image loader.
//!
//! Validation is two-phase on purpose: the whole image is parsed and
//! checked before a single byte lands in the code region, so a bad load
//! leaves the previously loaded program running. Only after everything
//! checks out does the code segment get copied in.
//!
//! The loader also owns the persistence hooks: after an operator-triggered
//! load the raw image is written through the HAL under two fixed keys, and
//! [`replay`] reads them back at boot before any task becomes ready.

use crate::hal::{Hal, HalError};
use crate::memory::{Memory, CODE_SIZE};
use crate::policy::Policy;
use crate::{DEFAULT_INTERVAL_US, DEFAULT_PRIORITY, MAX_TASKS};
use crc::{Crc, CRC_32_ISO_HDLC};
use heapless::Vec;
use zerocopy::FromBytes;
use zplc_abi::{
    HeaderFlags, LoadError, Priority, SegmentEntry, SegmentType, TaskDef,
    TaskType, ZplcHeader, PERSIST_KEY_CODE, PERSIST_KEY_CODE_LEN, ZPLC_MAGIC,
    ZPLC_VERSION_MAJOR,
};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A validated program: code already copied into the code region, plus the
/// task records for the scheduler to register.
#[derive(Debug, PartialEq)]
pub struct Program {
    pub code_len: u32,
    /// First task's pc, from the header; informational once tasks exist.
    pub entry_point: u16,
    pub tasks: Vec<TaskDef, MAX_TASKS>,
}

/// Parses and validates `bytes` as a `.zplc` image, copying its code
/// segment into `mem` on success.
///
/// `require_tasks` is for callers that have no other source of task
/// definitions; with it set, an image without a `TASK` segment is
/// `NO_TASKS` instead of a zero-task success.
pub fn load(
    mem: &mut Memory,
    bytes: &[u8],
    require_tasks: bool,
    policy: &Policy,
) -> Result<Program, LoadError> {
    if bytes.len() < 4 || bytes[..4] != ZPLC_MAGIC {
        return Err(LoadError::BadMagic);
    }
    let (header, rest) = ZplcHeader::ref_from_prefix(bytes)
        .map_err(|_| LoadError::Truncated)?;

    if header.version_major.get() != ZPLC_VERSION_MAJOR {
        return Err(LoadError::VersionMismatch);
    }

    let table_len = header.segment_count.get() as usize
        * core::mem::size_of::<SegmentEntry>();
    if rest.len() < table_len {
        return Err(LoadError::Truncated);
    }
    let (table_bytes, payload) = rest.split_at(table_len);

    let declared = (header.code_size.get() as usize)
        .checked_add(header.data_size.get() as usize)
        .ok_or(LoadError::Truncated)?;
    if declared > payload.len() {
        return Err(LoadError::Truncated);
    }

    // CRC over the payload. The header flag demands it; a nonzero stored
    // CRC promises it; policy can insist on it for flagless images.
    let stored_crc = header.crc32.get();
    let crc_demanded =
        header.flags().contains(HeaderFlags::CRC_REQUIRED) || policy.require_crc;
    if (crc_demanded || stored_crc != 0)
        && CRC32.checksum(payload) != stored_crc
    {
        return Err(LoadError::CrcMismatch);
    }

    // Walk the segment table. Everything is validated into locals first;
    // memory is only touched once the image as a whole is known good.
    let mut code: Option<&[u8]> = None;
    let mut tasks: Vec<TaskDef, MAX_TASKS> = Vec::new();
    let mut cursor = 0usize;
    for entry_bytes in table_bytes.chunks_exact(8) {
        let entry = SegmentEntry::read_from_bytes(entry_bytes)
            .map_err(|_| LoadError::Truncated)?;
        let size = entry.size.get() as usize;
        let body = payload
            .get(cursor..cursor + size)
            .ok_or(LoadError::Truncated)?;
        cursor += size;

        match SegmentType::try_from(entry.seg_type.get()) {
            Ok(SegmentType::Code) => {
                if code.is_some() {
                    // Two CODE segments is a malformed image, not a
                    // request to concatenate.
                    return Err(LoadError::Truncated);
                }
                if size > CODE_SIZE {
                    return Err(LoadError::CodeTooLarge);
                }
                code = Some(body);
            }
            Ok(SegmentType::Task) => {
                if size % core::mem::size_of::<TaskDef>() != 0 {
                    return Err(LoadError::Truncated);
                }
                for rec in body.chunks_exact(core::mem::size_of::<TaskDef>())
                {
                    let def = TaskDef::read_from_bytes(rec)
                        .map_err(|_| LoadError::Truncated)?;
                    tasks.push(def).map_err(|_| LoadError::TaskLimit)?;
                }
            }
            // Recognised but not consumed by the core; external tooling
            // reads these out of the original image.
            Ok(SegmentType::Data)
            | Ok(SegmentType::Symbol)
            | Ok(SegmentType::IoMap)
            | Ok(SegmentType::Debug)
            | Ok(SegmentType::Tag)
            | Ok(SegmentType::Signature) => {}
            // Unknown types are skipped, for forward compatibility.
            Err(()) => {}
        }
    }

    let code = code.ok_or(LoadError::NoCode)?;
    if require_tasks && tasks.is_empty() {
        return Err(LoadError::NoTasks);
    }

    mem.clear_code();
    mem.load_code(code, 0)?;

    Ok(Program {
        code_len: code.len() as u32,
        entry_point: header.entry_point.get(),
        tasks,
    })
}

/// Raw mode: accepts a bare bytecode buffer (no header) as one anonymous
/// cyclic task at offset 0 with default interval and priority. This is the
/// legacy single-task path; it is an explicit caller choice, never a
/// fallback, so that a corrupt header still surfaces as `BAD_MAGIC`.
pub fn load_raw(mem: &mut Memory, bytes: &[u8]) -> Result<Program, LoadError> {
    if bytes.is_empty() {
        return Err(LoadError::NoCode);
    }
    if bytes.len() > CODE_SIZE {
        return Err(LoadError::CodeTooLarge);
    }

    mem.clear_code();
    mem.load_code(bytes, 0)?;

    let mut tasks: Vec<TaskDef, MAX_TASKS> = Vec::new();
    // Capacity is MAX_TASKS >= 1, so this cannot fail.
    let _ = tasks.push(TaskDef::new(
        0,
        TaskType::Cyclic,
        Priority(DEFAULT_PRIORITY),
        DEFAULT_INTERVAL_US,
        0,
        0,
    ));

    Ok(Program {
        code_len: bytes.len() as u32,
        entry_point: 0,
        tasks,
    })
}

/// Stores `image` under the fixed persistence keys.
pub fn persist(hal: &mut dyn Hal, image: &[u8]) -> Result<(), HalError> {
    hal.persist_write(
        PERSIST_KEY_CODE_LEN,
        &(image.len() as u32).to_le_bytes(),
    )?;
    hal.persist_write(PERSIST_KEY_CODE, image)
}

/// Removes the stored program.
pub fn clear_persisted(hal: &mut dyn Hal) -> Result<(), HalError> {
    hal.persist_clear(PERSIST_KEY_CODE_LEN)?;
    hal.persist_clear(PERSIST_KEY_CODE)
}

/// Length of the stored program, if both keys could plausibly be present.
pub fn persisted_len(hal: &mut dyn Hal) -> Option<u32> {
    let mut len_buf = [0u8; 4];
    match hal.persist_read(PERSIST_KEY_CODE_LEN, &mut len_buf) {
        Ok(4) => Some(u32::from_le_bytes(len_buf)),
        _ => None,
    }
}

/// Boot-time replay: if a program was persisted, load it back.
///
/// An absent or unreadable store is `Ok(None)` -- a fresh controller is
/// not an error. A present-but-inconsistent store is a real load error.
/// `scratch` must be large enough for the stored image.
pub fn replay(
    mem: &mut Memory,
    hal: &mut dyn Hal,
    scratch: &mut [u8],
    policy: &Policy,
) -> Result<Option<Program>, LoadError> {
    let len = match persisted_len(hal) {
        Some(0) | None => return Ok(None),
        Some(len) => len as usize,
    };
    if len > scratch.len() {
        return Err(LoadError::CodeTooLarge);
    }
    let n = match hal.persist_read(PERSIST_KEY_CODE, &mut scratch[..len]) {
        Ok(n) => n,
        Err(_) => return Ok(None),
    };
    if n != len {
        return Err(LoadError::Truncated);
    }
    load(mem, &scratch[..len], false, policy).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{build_image, build_image_with, FakeHal, Prog};
    use zplc_abi::op;

    fn two_task_image() -> std::vec::Vec<u8> {
        let code = Prog::new()
            .push32(1)
            .op(op::HALT)
            .push32(2)
            .op(op::HALT);
        let tasks = [
            TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 64),
            TaskDef::new(1, TaskType::Cyclic, Priority(1), 20_000, 6, 64),
        ];
        build_image(code.bytes(), &tasks)
    }

    #[test]
    fn loads_a_two_task_image() {
        let mut mem = Memory::new();
        let image = two_task_image();
        let program =
            load(&mut mem, &image, true, &Policy::default()).unwrap();
        assert_eq!(program.code_len, 12);
        assert_eq!(program.tasks.len(), 2);
        assert_eq!(program.tasks[0].entry_point.get(), 0);
        assert_eq!(program.tasks[1].entry_point.get(), 6);
        assert_eq!(mem.code_len(), 12);
        assert_eq!(mem.code()[0], op::PUSH32);
    }

    #[test]
    fn wrong_magic_is_bad_magic() {
        let mut mem = Memory::new();
        let mut image = two_task_image();
        image[0] = b'X';
        assert_eq!(
            load(&mut mem, &image, true, &Policy::default()),
            Err(LoadError::BadMagic)
        );
    }

    #[test]
    fn version_and_truncation_checks() {
        let mut mem = Memory::new();
        let code = Prog::new().op(op::HALT);
        let image = build_image_with(
            code.bytes(),
            &[],
            true,
            ZPLC_VERSION_MAJOR + 1,
        );
        assert_eq!(
            load(&mut mem, &image, false, &Policy::default()),
            Err(LoadError::VersionMismatch)
        );

        let image = build_image(code.bytes(), &[]);
        assert_eq!(
            load(&mut mem, &image[..16], false, &Policy::default()),
            Err(LoadError::Truncated)
        );
        // Segment table promises more payload than exists.
        assert_eq!(
            load(
                &mut mem,
                &image[..image.len() - 1],
                false,
                &Policy::default()
            ),
            Err(LoadError::Truncated)
        );
    }

    #[test]
    fn crc_is_verified_when_promised() {
        let mut mem = Memory::new();
        let code = Prog::new().op(op::HALT);
        let mut image = build_image(code.bytes(), &[]);
        // Corrupt one payload byte; the stored CRC is nonzero, so this
        // must be caught even without the policy bit.
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert_eq!(
            load(&mut mem, &image, false, &Policy::default()),
            Err(LoadError::CrcMismatch)
        );

        // An image with no CRC at all passes by default...
        let image = build_image_with(
            code.bytes(),
            &[],
            false,
            ZPLC_VERSION_MAJOR,
        );
        assert!(load(&mut mem, &image, false, &Policy::default()).is_ok());
        // ...but not under a CRC-requiring policy.
        let strict = Policy {
            require_crc: true,
            ..Policy::default()
        };
        assert_eq!(
            load(&mut mem, &image, false, &strict),
            Err(LoadError::CrcMismatch)
        );
    }

    #[test]
    fn missing_segments_are_reported() {
        let mut mem = Memory::new();
        let code = Prog::new().op(op::HALT);
        // Code only: fine without require_tasks, NO_TASKS with it.
        let image = build_image(code.bytes(), &[]);
        let program =
            load(&mut mem, &image, false, &Policy::default()).unwrap();
        assert!(program.tasks.is_empty());
        assert_eq!(
            load(&mut mem, &image, true, &Policy::default()),
            Err(LoadError::NoTasks)
        );
    }

    #[test]
    fn image_without_code_is_no_code() {
        let mut mem = Memory::new();
        // Hand-build an image whose only segment is a TASK segment.
        let task =
            TaskDef::new(0, TaskType::Cyclic, Priority(0), 10_000, 0, 0);
        let mut image = build_image(&[], &[task]);
        // build_image always emits a CODE entry first; rewrite its type to
        // an unknown value so the loader skips it.
        let hdr = core::mem::size_of::<ZplcHeader>();
        image[hdr..hdr + 2].copy_from_slice(&0xFFu16.to_le_bytes());
        assert_eq!(
            load(&mut mem, &image, false, &Policy::default()),
            Err(LoadError::NoCode)
        );
    }

    #[test]
    fn failed_load_keeps_the_previous_program() {
        let mut mem = Memory::new();
        let good = build_image(Prog::new().push8(1).op(op::HALT).bytes(), &[]);
        load(&mut mem, &good, false, &Policy::default()).unwrap();
        let before = mem.code().to_vec();

        let mut bad = two_task_image();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF; // CRC mismatch
        assert!(load(&mut mem, &bad, true, &Policy::default()).is_err());
        assert_eq!(mem.code(), &before[..]);
    }

    #[test]
    fn task_limit_is_enforced() {
        let mut mem = Memory::new();
        let tasks: std::vec::Vec<TaskDef> = (0..MAX_TASKS as u16 + 1)
            .map(|i| {
                TaskDef::new(i, TaskType::Cyclic, Priority(0), 10_000, 0, 0)
            })
            .collect();
        let image =
            build_image(Prog::new().op(op::HALT).bytes(), &tasks);
        assert_eq!(
            load(&mut mem, &image, true, &Policy::default()),
            Err(LoadError::TaskLimit)
        );
    }

    #[test]
    fn raw_mode_synthesizes_one_cyclic_task() {
        let mut mem = Memory::new();
        let prog = Prog::new().push8(1).op(op::HALT);
        let program = load_raw(&mut mem, prog.bytes()).unwrap();
        assert_eq!(program.tasks.len(), 1);
        let t = &program.tasks[0];
        assert_eq!(t.task_type().unwrap(), TaskType::Cyclic);
        assert_eq!(t.interval_us.get(), DEFAULT_INTERVAL_US);
        assert_eq!(t.priority().0, DEFAULT_PRIORITY);
        assert_eq!(t.entry_point.get(), 0);
        assert_eq!(mem.code(), prog.bytes());

        assert_eq!(load_raw(&mut mem, &[]), Err(LoadError::NoCode));
    }

    #[test]
    fn persist_and_replay_round_trip() {
        let mut mem = Memory::new();
        let mut hal = FakeHal::default();
        let image = two_task_image();

        persist(&mut hal, &image).unwrap();
        assert_eq!(persisted_len(&mut hal), Some(image.len() as u32));

        let mut scratch = vec![0u8; 64 * 1024];
        let program =
            replay(&mut mem, &mut hal, &mut scratch, &Policy::default())
                .unwrap()
                .expect("stored program should replay");
        assert_eq!(program.tasks.len(), 2);
        assert_eq!(mem.code_len(), 12);

        clear_persisted(&mut hal).unwrap();
        let mut mem2 = Memory::new();
        assert!(replay(
            &mut mem2,
            &mut hal,
            &mut scratch,
            &Policy::default()
        )
        .unwrap()
        .is_none());
    }
}
