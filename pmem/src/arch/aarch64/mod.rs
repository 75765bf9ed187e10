/// aarch64 support.
///
/// Cache maintenance on ARMv8:
///   DC CVAC - clean to Point of Coherency, ARMv8.0, may stop short of the
///             persistence domain on pmem-capable parts.
///   DC CVAP - clean to Point of Persistency, ARMv8.2, exactly what pmem
///             needs; advertised through HWCAP_DCPOP.
/// The drain fence is DMB ISH. Streaming stores do not exist here, so the
/// copy entry points are the portable ones.
use core::arch::asm;

use crate::arch::{generic, PersistOps};
use crate::config::PersistConfig;
use crate::util::CACHELINE_SIZE;

// AT_HWCAP bit for dcpop (asm/hwcap.h).
const HWCAP_DCPOP: libc::c_ulong = 1 << 16;

/// Whether DC CVAP is available, from the auxiliary vector.
pub fn has_dc_cvap() -> bool {
    unsafe { libc::getauxval(libc::AT_HWCAP) } & HWCAP_DCPOP != 0
}

#[inline]
unsafe fn dc_cvac(p: usize) {
    asm!("dc cvac, {}", in(reg) p, options(nostack));
}

#[inline]
unsafe fn dc_cvap(p: usize) {
    // dc cvap; spelled as the generic sys alias so the assembler accepts it
    // without an ARMv8.2 target.
    asm!("sys #3, c7, c12, #1, {}", in(reg) p, options(nostack));
}

/// Clean the given range to the Point of Coherency.
pub unsafe fn flush_poc(addr: *const u8, len: usize) {
    let mut uptr = addr as usize & !(CACHELINE_SIZE - 1);
    let end = addr as usize + len;
    while uptr < end {
        dc_cvac(uptr);
        uptr += CACHELINE_SIZE;
    }
}

/// Clean the given range to the Point of Persistency.
pub unsafe fn flush_pop(addr: *const u8, len: usize) {
    let mut uptr = addr as usize & !(CACHELINE_SIZE - 1);
    let end = addr as usize + len;
    while uptr < end {
        dc_cvap(uptr);
        uptr += CACHELINE_SIZE;
    }
}

/// The drain fence.
pub fn fence_dmb_ish() {
    unsafe { asm!("dmb ish", options(nostack)) }
}

pub(super) fn select(cfg: &PersistConfig) -> PersistOps {
    let flush = if has_dc_cvap() {
        log::info!("synchronizing to the point of persistency (dc cvap)");
        flush_pop as crate::arch::FlushFn
    } else {
        log::info!("synchronizing to the point of coherency (dc cvac)");
        flush_poc as crate::arch::FlushFn
    };

    PersistOps {
        flush,
        fence: fence_dmb_ish,
        memmove_nodrain: generic::memmove_nodrain,
        memset_nodrain: generic::memset_nodrain,
        flush_has_builtin_fence: false,
        auto_flush: false,
        flush_is_noop: false,
        movnt_threshold: cfg.movnt_threshold,
        wc_barrier: false,
        generic_wordcopy: true,
        is_pmem_force: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistConfig;

    #[test]
    fn selection_uses_the_portable_copy() {
        let ops = select(&PersistConfig::default());
        assert_eq!(ops.memmove_nodrain as usize, generic::memmove_nodrain as usize);
        assert!(!ops.flush_has_builtin_fence);
    }

    #[test]
    fn flush_runs_on_ordinary_memory() {
        let buf = vec![0u8; 4096];
        unsafe {
            flush_poc(buf.as_ptr(), buf.len());
        }
        fence_dmb_ish();
    }
}
