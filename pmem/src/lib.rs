//! Persistent, byte-addressable heaps backed by memory-mapped files.
//!
//! Applications obtain pools (fixed regions of mapped memory whose contents
//! survive process exit and, on true persistent memory, power loss) and make
//! stores to them durable through the persist facade. The library selects
//! cache flush, fence and streaming copy instructions for the running CPU
//! once at startup and tracks which mapped ranges are genuine persistent
//! memory.

pub mod arch;
pub mod config;
pub mod error;
pub mod logging;
pub mod mmap;
pub mod persist;
pub mod pool;
pub mod rand;
pub mod registry;
pub mod util;

pub use error::{last_error, Error, Result};
pub use persist::{
    drain, flush, has_auto_flush, has_hw_drain, is_pmem, memcpy, memmove, memset, msync, persist,
    MemFlags,
};
pub use pool::{check, create, open, CheckResult, Pool, PoolAttr, POOL_HDR_SIZE};

/// Library interface version.
pub const MAJOR_VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 0;

use spin::Once;

static INIT: Once<()> = Once::new();

/// One-time library initialization: logging from the environment, page
/// size, and the architecture dispatch table. Public entry points call
/// this implicitly; calling it twice is harmless.
pub fn init() {
    INIT.call_once(|| {
        logging::init("PMEM");
        util::page_size();
        arch::ops();
    });
}

/// Library shutdown hook: flush any buffered diagnostics. Optional; every
/// resource the library holds is reclaimed by the OS at process exit.
pub fn fini() {
    log::logger().flush();
}

/// See if the library meets the caller's version requirement. The major
/// version must match exactly; the minor version must be at least the one
/// required.
pub fn check_version(major_required: u32, minor_required: u32) -> Result<()> {
    use crate::error::fail;

    if major_required != MAJOR_VERSION {
        fail!(
            Error::VersionMismatch,
            "libpmem major version mismatch (need {}, found {})",
            major_required,
            MAJOR_VERSION
        );
    }
    if minor_required > MINOR_VERSION {
        fail!(
            Error::VersionMismatch,
            "libpmem minor version mismatch (need {}, found {})",
            minor_required,
            MINOR_VERSION
        );
    }
    Ok(())
}
