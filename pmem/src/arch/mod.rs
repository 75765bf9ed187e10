/// Architecture dispatch.
///
/// At first use the library builds one immutable `PersistOps` record that
/// holds the selected flush/fence/copy entry points for this CPU, then keeps
/// it in a `spin::Once` for the life of the process. Selection runs exactly
/// once and cannot fail; an impossible combination aborts startup.
pub mod auto_flush;
pub mod generic;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported architecture: pmem requires x86_64 or aarch64");

use spin::Once;

use crate::config::PersistConfig;
use crate::persist::MemFlags;

pub type FlushFn = unsafe fn(*const u8, usize);
pub type FenceFn = fn();
pub type MemmoveFn = unsafe fn(&PersistOps, *mut u8, *const u8, usize, MemFlags) -> *mut u8;
pub type MemsetFn = unsafe fn(&PersistOps, *mut u8, u8, usize, MemFlags) -> *mut u8;

/// The per-CPU persistence entry points, fixed at init.
pub struct PersistOps {
    /// Push stores toward the persistence domain, one cache line at a time.
    pub flush: FlushFn,
    /// Wait for previously flushed stores to reach the persistence domain.
    pub fence: FenceFn,
    /// memmove without the trailing drain.
    pub memmove_nodrain: MemmoveFn,
    /// memset without the trailing drain.
    pub memset_nodrain: MemsetFn,
    /// The selected flush instruction serializes itself (clflush); the
    /// non-temporal copies must fence on their own then.
    pub flush_has_builtin_fence: bool,
    /// Platform flushes CPU caches on power failure (eADR).
    pub auto_flush: bool,
    /// `flush` is the no-op variant (eADR or NO_FLUSH=1).
    pub flush_is_noop: bool,
    /// Copies at or above this size use streaming stores.
    pub movnt_threshold: usize,
    /// Fence periodically during long streaming copies to bound the amount
    /// of write-combining buffer in flight (Intel WC eviction).
    pub wc_barrier: bool,
    /// Portable copy path uses the word-at-a-time loop (false: plain copy).
    pub generic_wordcopy: bool,
    /// `IS_PMEM_FORCE` override of the is_pmem predicate.
    pub is_pmem_force: Option<bool>,
}

/// No-op flush, selected under eADR or NO_FLUSH=1.
pub unsafe fn flush_empty(_addr: *const u8, _len: usize) {}

/// Empty fence, selected when the flush instruction serializes itself.
pub fn fence_empty() {}

/// The architecture's store barrier (sfence / dmb ish).
pub fn store_barrier() {
    #[cfg(target_arch = "x86_64")]
    x86_64::fence_sfence();
    #[cfg(target_arch = "aarch64")]
    aarch64::fence_dmb_ish();
}

static OPS: Once<PersistOps> = Once::new();

/// The process-wide dispatch table, built on first use.
pub fn ops() -> &'static PersistOps {
    OPS.call_once(|| {
        crate::logging::init("PMEM");
        init_from_config(&PersistConfig::from_env("PMEM"))
    })
}

/// Build a dispatch table from an explicit configuration. Pure apart from
/// CPU feature and platform probes; tests feed it hand-made configs.
pub fn init_from_config(cfg: &PersistConfig) -> PersistOps {
    #[cfg(target_arch = "x86_64")]
    let mut ops = x86_64::select(cfg);
    #[cfg(target_arch = "aarch64")]
    let mut ops = aarch64::select(cfg);

    ops.movnt_threshold = cfg.movnt_threshold;
    ops.generic_wordcopy = !cfg.no_generic_memcpy;
    ops.is_pmem_force = cfg.is_pmem_force;

    ops.auto_flush = auto_flush::detect();
    if ops.auto_flush {
        log::info!("eADR detected, skipping explicit cache flushes");
    }

    let noop_flush = cfg.no_flush.unwrap_or(ops.auto_flush);
    if noop_flush {
        ops.flush = flush_empty;
        ops.flush_is_noop = true;
        ops.fence = store_barrier;
        ops.flush_has_builtin_fence = false;
    }

    ops
}
