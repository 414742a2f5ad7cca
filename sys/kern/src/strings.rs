// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! String descriptors and the operations behind the string opcodes.
//!
//! A string lives in RAM as `[len:u16][cap:u16][bytes:cap+1]`, with a NUL
//! always present at `bytes[len]`. Capacity is fixed at declaration; there
//! is no growth, ever. Every operation re-reads and re-validates the
//! descriptor it touches -- the bytes are program-writable memory, so
//! nothing read on a previous cycle can be trusted.
//!
//! All violations surface as `STRING_BOUNDS`, including descriptors that
//! point at the code region or whose byte area would cross a region
//! boundary.

use crate::memory::Memory;
use crate::vm::Vm;
use zplc_abi::FaultKind;

/// Validated view of one descriptor. `bytes_base` is the absolute address
/// of `bytes[0]`; the full extent `[addr, bytes_base + cap]` is known to
/// sit inside a single RAM region.
#[derive(Copy, Clone, Debug)]
struct Desc {
    len: u16,
    cap: u16,
    bytes_base: u16,
}

/// Pops a descriptor address off the operand stack. A cell that can't be
/// an address at all is a string-bounds problem, not a memory violation:
/// the memory system never saw an access.
pub(crate) fn pop_desc_addr(vm: &mut Vm) -> Result<u16, FaultKind> {
    let addr = vm.pop()?;
    if addr > 0xFFFF {
        return Err(FaultKind::StringBounds);
    }
    Ok(addr as u16)
}

fn read_desc(mem: &Memory, addr: u16) -> Result<Desc, FaultKind> {
    // Header fields first; we can't know the full extent before cap.
    let (region, _) = mem
        .resolve(addr, 4)
        .map_err(|_| FaultKind::StringBounds)?;
    if !region.is_ram() {
        return Err(FaultKind::StringBounds);
    }
    let len = mem.read_u16(addr).map_err(|_| FaultKind::StringBounds)?;
    let cap = mem.read_u16(addr + 2).map_err(|_| FaultKind::StringBounds)?;
    if len > cap {
        return Err(FaultKind::StringBounds);
    }
    // Whole descriptor, NUL slot included, must fit in one region.
    mem.resolve(addr, 4 + cap as usize + 1)
        .map_err(|_| FaultKind::StringBounds)?;
    Ok(Desc {
        len,
        cap,
        bytes_base: addr + 4,
    })
}

fn set_len(mem: &mut Memory, addr: u16, d: &Desc, len: u16) -> Result<(), FaultKind> {
    mem.write_u16(addr, len).map_err(|_| FaultKind::StringBounds)?;
    mem.write_u8(d.bytes_base + len, 0)
        .map_err(|_| FaultKind::StringBounds)?;
    Ok(())
}

fn copy_bytes(
    mem: &mut Memory,
    dst: u16,
    src: u16,
    n: u16,
) -> Result<(), FaultKind> {
    // Byte-at-a-time through the checked accessors; both extents were
    // validated, so the map-err is belt over braces.
    for i in 0..n {
        let b = mem.read_u8(src + i).map_err(|_| FaultKind::StringBounds)?;
        mem.write_u8(dst + i, b)
            .map_err(|_| FaultKind::StringBounds)?;
    }
    Ok(())
}

pub(crate) fn strlen(mem: &Memory, addr: u16) -> Result<u16, FaultKind> {
    Ok(read_desc(mem, addr)?.len)
}

/// Copies `src` into `dst`, truncating to `dst`'s capacity. Never
/// overruns; always leaves `dst` NUL-terminated.
pub(crate) fn strcpy(
    mem: &mut Memory,
    dst: u16,
    src: u16,
) -> Result<(), FaultKind> {
    let s = read_desc(mem, src)?;
    let d = read_desc(mem, dst)?;
    let n = s.len.min(d.cap);
    copy_bytes(mem, d.bytes_base, s.bytes_base, n)?;
    set_len(mem, dst, &d, n)
}

/// Appends `src` to `dst`, truncating to `dst`'s capacity.
pub(crate) fn strcat(
    mem: &mut Memory,
    dst: u16,
    src: u16,
) -> Result<(), FaultKind> {
    let s = read_desc(mem, src)?;
    let d = read_desc(mem, dst)?;
    let room = d.cap - d.len;
    let n = s.len.min(room);
    copy_bytes(mem, d.bytes_base + d.len, s.bytes_base, n)?;
    set_len(mem, dst, &d, d.len + n)
}

/// Bytewise comparison; a shorter string that is a prefix of the longer
/// one compares less. Returns -1, 0 or 1.
pub(crate) fn strcmp(
    mem: &Memory,
    a: u16,
    b: u16,
) -> Result<i32, FaultKind> {
    let da = read_desc(mem, a)?;
    let db = read_desc(mem, b)?;
    let n = da.len.min(db.len);
    for i in 0..n {
        let ca = mem
            .read_u8(da.bytes_base + i)
            .map_err(|_| FaultKind::StringBounds)?;
        let cb = mem
            .read_u8(db.bytes_base + i)
            .map_err(|_| FaultKind::StringBounds)?;
        if ca != cb {
            return Ok(if ca < cb { -1 } else { 1 });
        }
    }
    Ok(match da.len.cmp(&db.len) {
        core::cmp::Ordering::Less => -1,
        core::cmp::Ordering::Equal => 0,
        core::cmp::Ordering::Greater => 1,
    })
}

/// Empties the string: length zero, NUL at the front. Capacity is
/// untouched.
pub(crate) fn strclr(mem: &mut Memory, addr: u16) -> Result<(), FaultKind> {
    let d = read_desc(mem, addr)?;
    set_len(mem, addr, &d, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CODE_BASE, WORK_BASE};

    /// Lays a descriptor down in memory and returns its address.
    fn put_str(mem: &mut Memory, addr: u16, cap: u16, s: &str) -> u16 {
        assert!(s.len() <= cap as usize);
        mem.write_u16(addr, s.len() as u16).unwrap();
        mem.write_u16(addr + 2, cap).unwrap();
        for (i, b) in s.bytes().enumerate() {
            mem.write_u8(addr + 4 + i as u16, b).unwrap();
        }
        mem.write_u8(addr + 4 + s.len() as u16, 0).unwrap();
        addr
    }

    fn get_str(mem: &Memory, addr: u16) -> String {
        let len = mem.read_u16(addr).unwrap();
        (0..len)
            .map(|i| mem.read_u8(addr + 4 + i).unwrap() as char)
            .collect()
    }

    #[test]
    fn strcpy_truncates_to_capacity() {
        let mut mem = Memory::new();
        let src = put_str(&mut mem, WORK_BASE, 32, "Hello World");
        let dst = put_str(&mut mem, WORK_BASE + 64, 5, "");
        strcpy(&mut mem, dst, src).unwrap();
        assert_eq!(mem.read_u16(dst).unwrap(), 5);
        assert_eq!(get_str(&mem, dst), "Hello");
        // NUL right after the truncated contents.
        assert_eq!(mem.read_u8(dst + 4 + 5).unwrap(), 0);
        // Source untouched.
        assert_eq!(get_str(&mem, src), "Hello World");
    }

    #[test]
    fn strcat_appends_and_truncates() {
        let mut mem = Memory::new();
        let dst = put_str(&mut mem, WORK_BASE, 8, "abc");
        let src = put_str(&mut mem, WORK_BASE + 64, 16, "defghij");
        strcat(&mut mem, dst, src).unwrap();
        assert_eq!(get_str(&mem, dst), "abcdefgh");
        assert_eq!(mem.read_u16(dst).unwrap(), 8);
    }

    #[test]
    fn strcmp_orders_like_memcmp_with_length_tiebreak() {
        let mut mem = Memory::new();
        let a = put_str(&mut mem, WORK_BASE, 16, "abc");
        let b = put_str(&mut mem, WORK_BASE + 32, 16, "abd");
        let c = put_str(&mut mem, WORK_BASE + 64, 16, "ab");
        let a2 = put_str(&mut mem, WORK_BASE + 96, 8, "abc");
        assert_eq!(strcmp(&mem, a, b).unwrap(), -1);
        assert_eq!(strcmp(&mem, b, a).unwrap(), 1);
        assert_eq!(strcmp(&mem, c, a).unwrap(), -1);
        assert_eq!(strcmp(&mem, a, a2).unwrap(), 0);
    }

    #[test]
    fn strclr_zeroes_length_only() {
        let mut mem = Memory::new();
        let s = put_str(&mut mem, WORK_BASE, 16, "abc");
        strclr(&mut mem, s).unwrap();
        assert_eq!(mem.read_u16(s).unwrap(), 0);
        assert_eq!(mem.read_u16(s + 2).unwrap(), 16);
        assert_eq!(mem.read_u8(s + 4).unwrap(), 0);
        // The old bytes past the NUL are allowed to linger.
    }

    #[test]
    fn corrupt_descriptors_are_string_bounds_faults() {
        let mut mem = Memory::new();
        // len > cap.
        mem.write_u16(WORK_BASE, 10).unwrap();
        mem.write_u16(WORK_BASE + 2, 4).unwrap();
        assert_eq!(strlen(&mem, WORK_BASE), Err(FaultKind::StringBounds));

        // Capacity runs past the end of the region.
        let near_end = WORK_BASE + 0x2000 - 8;
        mem.write_u16(near_end, 0).unwrap();
        mem.write_u16(near_end + 2, 64).unwrap();
        assert_eq!(strlen(&mem, near_end), Err(FaultKind::StringBounds));

        // Descriptors can't live in code.
        assert_eq!(strlen(&mem, CODE_BASE), Err(FaultKind::StringBounds));
    }
}
