/// The persistence facade.
///
/// `flush` makes stores at a range visible to the persistence hardware,
/// `drain` waits for previously flushed stores to reach the persistence
/// domain, and `persist` is the composition. The copy entry points return
/// their destination like their libc counterparts and drain unless told
/// otherwise. On ranges that are not persistent memory, `persist` falls
/// back to the msync path.
use bitflags::bitflags;

use crate::arch;
use crate::error::{fail, Error, Result};
use crate::registry;
use crate::util;

bitflags! {
    /// Behavior flags for `memmove`/`memcpy`/`memset`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        /// Skip the trailing drain; the caller will drain later.
        const NODRAIN = 1 << 0;
        /// Leave the bytes dirty in the cache; the caller must flush.
        const NOFLUSH = 1 << 1;
        /// Force streaming stores regardless of the size threshold.
        const NONTEMPORAL = 1 << 2;
        /// Force ordinary stores regardless of the size threshold.
        const TEMPORAL = 1 << 3;
        /// Write-combining hint, equivalent to NONTEMPORAL.
        const WC = 1 << 4;
        /// Write-back hint, equivalent to TEMPORAL.
        const WB = 1 << 5;
    }
}

/// Make stores to `[addr, addr+len)` visible to the persistence hardware.
/// Not necessarily durable until `drain`.
///
/// # Safety
/// The range must be valid mapped memory.
pub unsafe fn flush(addr: *const u8, len: usize) {
    let ops = arch::ops();
    (ops.flush)(addr, len);
}

/// Wait for stores flushed earlier to reach the persistence domain.
pub fn drain() {
    let ops = arch::ops();
    (ops.fence)();
}

/// True iff every byte of the range lies in a registered mapping whose
/// kind guarantees CPU-cache persistence (honoring `IS_PMEM_FORCE`).
pub fn is_pmem(addr: *const u8, len: usize) -> bool {
    let ops = arch::ops();
    if let Some(forced) = ops.is_pmem_force {
        return forced;
    }
    registry::is_pmem(addr as usize, len)
}

/// Make stores to the range durable: flush + drain on persistent memory,
/// msync otherwise.
///
/// # Safety
/// The range must be valid mapped memory.
pub unsafe fn persist(addr: *const u8, len: usize) {
    if is_pmem(addr, len) {
        flush(addr, len);
        drain();
    } else {
        // The msync path reports its own failure through the last-error
        // buffer; persist itself has no error to return.
        let _ = msync(addr, len);
    }
}

/// Page-align the range and issue the OS durability syscall. Works on any
/// file-backed mapping, persistent or not.
///
/// # Safety
/// The range must lie inside a file-backed mapping.
pub unsafe fn msync(addr: *const u8, len: usize) -> Result<()> {
    let pagesize = util::page_size();

    // Round addr down to the page boundary, growing len to compensate.
    let len = len + (addr as usize & (pagesize - 1));
    let uptr = addr as usize & !(pagesize - 1);

    if libc::msync(uptr as *mut libc::c_void, len, libc::MS_SYNC) < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        fail!(Error::Io(errno), "msync {:#x}+{:#x} failed", uptr, len);
    }
    Ok(())
}

/// memmove to persistent memory; drains unless `NODRAIN`.
///
/// # Safety
/// `dst` and `src` must be valid for `len` bytes; ranges may overlap.
pub unsafe fn memmove(dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) -> *mut u8 {
    let ops = arch::ops();
    let ret = (ops.memmove_nodrain)(ops, dst, src, len, flags);
    if !flags.contains(MemFlags::NODRAIN) {
        drain();
    }
    ret
}

/// memcpy to persistent memory; same contract as `memmove` (overlapping
/// ranges are handled rather than undefined).
///
/// # Safety
/// See `memmove`.
pub unsafe fn memcpy(dst: *mut u8, src: *const u8, len: usize, flags: MemFlags) -> *mut u8 {
    memmove(dst, src, len, flags)
}

/// memset to persistent memory; drains unless `NODRAIN`.
///
/// # Safety
/// `dst` must be valid for `len` bytes.
pub unsafe fn memset(dst: *mut u8, c: u8, len: usize, flags: MemFlags) -> *mut u8 {
    let ops = arch::ops();
    let ret = (ops.memset_nodrain)(ops, dst, c, len, flags);
    if !flags.contains(MemFlags::NODRAIN) {
        drain();
    }
    ret
}

/// True iff the platform flushes CPU caches on power failure (eADR).
pub fn has_auto_flush() -> bool {
    arch::ops().auto_flush
}

/// Deprecated notion of a hardware drain instruction; always true for the
/// variants this library selects.
pub fn has_hw_drain() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memcpy_copies_and_drains() {
        let src: Vec<u8> = (0..255u8).collect();
        let mut dst = vec![0u8; 255];
        unsafe {
            let ret = memcpy(dst.as_mut_ptr(), src.as_ptr(), 255, MemFlags::empty());
            assert_eq!(ret, dst.as_mut_ptr());
        }
        assert_eq!(dst, src);
    }

    #[test]
    fn memmove_handles_overlap_through_the_facade() {
        let mut buf: Vec<u8> = (0..200u8).collect();
        let expect = buf[..150].to_vec();
        unsafe {
            let base = buf.as_mut_ptr();
            memmove(base.add(50), base, 150, MemFlags::empty());
        }
        assert_eq!(&buf[50..200], &expect[..]);
    }

    #[test]
    fn memset_fills() {
        let mut buf = vec![0u8; 300];
        unsafe {
            memset(buf.as_mut_ptr().add(1), 0x7e, 298, MemFlags::NODRAIN);
        }
        drain();
        assert_eq!(buf[0], 0);
        assert!(buf[1..299].iter().all(|&b| b == 0x7e));
        assert_eq!(buf[299], 0);
    }

    #[test]
    fn flush_and_drain_are_idempotent() {
        let buf = vec![0xaau8; 4096];
        unsafe {
            for _ in 0..4 {
                flush(buf.as_ptr(), buf.len());
                drain();
            }
        }
        assert!(buf.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn is_pmem_is_false_for_heap_memory() {
        let buf = vec![0u8; 64];
        assert!(!is_pmem(buf.as_ptr(), buf.len()));
    }

    #[test]
    fn hw_drain_is_reported() {
        assert!(has_hw_drain());
    }
}
