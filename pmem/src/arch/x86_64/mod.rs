/// x86-64 support: CPUID feature detection and flush/copy selection.
pub mod flush;
pub mod movnt;

use core::arch::x86_64::{CpuidResult, __cpuid, __cpuid_count, _mm_sfence};

use crate::arch::{fence_empty, generic, PersistOps};
use crate::config::PersistConfig;
use crate::logging;

/// CPUID wrapper; returns zeros for unsupported leaves.
fn cpuid_count(leaf: u32, subleaf: u32) -> CpuidResult {
    let max_leaf = unsafe { __cpuid(0) }.eax;
    if leaf > max_leaf {
        return CpuidResult { eax: 0, ebx: 0, ecx: 0, edx: 0 };
    }
    unsafe { __cpuid_count(leaf, subleaf) }
}

/// Check if CLFLUSH is supported (CPUID.01H:EDX.CLFSH[bit 19]).
pub fn has_clflush() -> bool {
    cpuid_count(1, 0).edx & (1 << 19) != 0
}

/// Check if CLFLUSHOPT is supported (CPUID.07H.0:EBX.CLFLUSHOPT[bit 23]).
pub fn has_clflushopt() -> bool {
    cpuid_count(7, 0).ebx & (1 << 23) != 0
}

/// Check if CLWB is supported (CPUID.07H.0:EBX.CLWB[bit 24]).
pub fn has_clwb() -> bool {
    cpuid_count(7, 0).ebx & (1 << 24) != 0
}

/// XCR0, readable only when the OS advertises OSXSAVE.
fn xcr0() -> u64 {
    if cpuid_count(1, 0).ecx & (1 << 27) == 0 {
        return 0;
    }
    let (lo, hi): (u32, u32);
    unsafe {
        core::arch::asm!(
            "xgetbv",
            in("ecx") 0u32,
            out("eax") lo,
            out("edx") hi,
            options(nostack, nomem),
        );
    }
    (hi as u64) << 32 | lo as u64
}

/// Check if AVX is usable: CPUID.01H:ECX.AVX[bit 28] plus OS-enabled
/// xmm/ymm state.
pub fn has_avx() -> bool {
    cpuid_count(1, 0).ecx & (1 << 28) != 0 && xcr0() & 0x6 == 0x6
}

/// Check if AVX-512F is usable: CPUID.07H.0:EBX.AVX512F[bit 16] plus
/// OS-enabled opmask/zmm state.
pub fn has_avx512f() -> bool {
    cpuid_count(7, 0).ebx & (1 << 16) != 0 && xcr0() & 0xe6 == 0xe6
}

/// Check the vendor string (CPUID.0H EBX/EDX/ECX spell "GenuineIntel").
pub fn is_genuine_intel() -> bool {
    let id = unsafe { __cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&id.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&id.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&id.ecx.to_le_bytes());
    &vendor == b"GenuineIntel"
}

/// The pre-drain store fence.
pub fn fence_sfence() {
    unsafe { _mm_sfence() }
}

/// Pick the flush and copy entry points for this CPU, honoring the
/// configured overrides.
pub(super) fn select(cfg: &PersistConfig) -> PersistOps {
    let mut ops = PersistOps {
        flush: flush::flush_clflush,
        fence: fence_empty,
        memmove_nodrain: generic::memmove_nodrain,
        memset_nodrain: generic::memset_nodrain,
        flush_has_builtin_fence: true,
        auto_flush: false,
        flush_is_noop: false,
        movnt_threshold: cfg.movnt_threshold,
        wc_barrier: false,
        generic_wordcopy: true,
        is_pmem_force: None,
    };

    let mut selected = false;

    if has_clflush() {
        log::info!("clflush supported");
        selected = true;
    }

    if has_clflushopt() {
        log::info!("clflushopt supported");
        if cfg.no_clflushopt {
            log::info!("NO_CLFLUSHOPT forced no clflushopt");
        } else {
            ops.flush = flush::flush_clflushopt;
            ops.fence = fence_sfence;
            ops.flush_has_builtin_fence = false;
            selected = true;
        }
    }

    if has_clwb() {
        log::info!("clwb supported");
        if cfg.no_clwb {
            log::info!("NO_CLWB forced no clwb");
        } else {
            ops.flush = flush::flush_clwb;
            ops.fence = fence_sfence;
            ops.flush_has_builtin_fence = false;
            selected = true;
        }
    }

    if !selected {
        logging::fatal("no cache flush instruction available on this CPU");
    }

    ops.wc_barrier = cfg.wc_workaround.unwrap_or_else(is_genuine_intel);

    if cfg.no_movnt {
        log::info!("NO_MOVNT forced no movnt");
    } else if has_avx512f() {
        log::info!("using movnt AVX512F");
        ops.memmove_nodrain = movnt::memmove_nodrain_avx512f;
        ops.memset_nodrain = movnt::memset_nodrain_avx512f;
    } else if has_avx() {
        log::info!("using movnt AVX");
        ops.memmove_nodrain = movnt::memmove_nodrain_avx;
        ops.memset_nodrain = movnt::memset_nodrain_avx;
    } else {
        // SSE2 is architectural on x86-64.
        log::info!("using movnt SSE2");
        ops.memmove_nodrain = movnt::memmove_nodrain_sse2;
        ops.memset_nodrain = movnt::memset_nodrain_sse2;
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clflush_is_architectural() {
        // Every x86-64 CPU this library can run on has clflush.
        assert!(has_clflush());
    }

    #[test]
    fn overrides_demote_the_flush_instruction() {
        let cfg = PersistConfig {
            no_clwb: true,
            no_clflushopt: true,
            ..PersistConfig::default()
        };
        let ops = select(&cfg);
        assert_eq!(ops.flush as usize, flush::flush_clflush as usize);
        assert!(ops.flush_has_builtin_fence);
        assert_eq!(ops.fence as usize, fence_empty as usize);
    }

    #[test]
    fn no_movnt_selects_the_portable_copy() {
        let cfg = PersistConfig { no_movnt: true, ..PersistConfig::default() };
        let ops = select(&cfg);
        assert_eq!(ops.memmove_nodrain as usize, generic::memmove_nodrain as usize);
        assert_eq!(ops.memset_nodrain as usize, generic::memset_nodrain as usize);
    }
}
