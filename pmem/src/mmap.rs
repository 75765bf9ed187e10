/// File and device mapping.
///
/// Wraps the virtual-memory syscalls with the policy the pool layer needs:
/// regular files are probed with the sync-on-fault flag first (falling back
/// to a plain shared mapping), DAX character devices are recognized through
/// sysfs, and every mapping with known persistence semantics is recorded in
/// the range registry.
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;

use crate::error::{fail, Error, Result};
use crate::registry::{self, RangeKind};
use crate::util;

/// Where to place a mapping.
#[derive(Debug, Clone, Copy)]
pub enum MapAt {
    /// Let the kernel choose.
    Anywhere,
    /// Exactly here, replacing whatever reservation covers it.
    Fixed(*mut u8),
    /// Exactly here, failing if the address space is occupied.
    FixedNoReplace(*mut u8),
}

/// One mapped window of a part file.
#[derive(Debug)]
pub struct MappedPart {
    pub base: *mut u8,
    pub len: usize,
    /// Registered kind, or None for a plain file mapping.
    pub kind: Option<RangeKind>,
}

/// What backs a part path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Regular { size: u64 },
    DevDax { size: u64 },
}

impl Backing {
    pub fn size(&self) -> u64 {
        match *self {
            Backing::Regular { size } | Backing::DevDax { size } => size,
        }
    }

    pub fn is_dev_dax(&self) -> bool {
        matches!(self, Backing::DevDax { .. })
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Size of a device-dax character device, from sysfs.
fn dev_dax_size(rdev: libc::dev_t) -> Result<u64> {
    let path = format!("/sys/dev/char/{}:{}/size", libc::major(rdev), libc::minor(rdev));
    let text = std::fs::read_to_string(&path)?;
    match text.trim_end().parse::<u64>() {
        Ok(size) => Ok(size),
        Err(_) => {
            fail!(Error::InvalidArgument, "{}: unparsable device size", path);
        }
    }
}

/// True when the character device's subsystem symlink points at "dax".
fn is_dax_subsystem(rdev: libc::dev_t) -> bool {
    let path = format!("/sys/dev/char/{}:{}/subsystem", libc::major(rdev), libc::minor(rdev));
    match std::fs::read_link(&path) {
        Ok(target) => target.file_name().map(|n| n == "dax").unwrap_or(false),
        Err(_) => false,
    }
}

/// Classify the file backing a part.
pub fn classify(file: &File, path: &Path) -> Result<Backing> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(file.as_raw_fd(), &mut st) } < 0 {
        let errno = last_errno();
        fail!(Error::Io(errno), "fstat {} failed", path.display());
    }

    match st.st_mode & libc::S_IFMT {
        libc::S_IFREG => Ok(Backing::Regular { size: st.st_size as u64 }),
        libc::S_IFCHR => {
            if !is_dax_subsystem(st.st_rdev) {
                fail!(
                    Error::InvalidArgument,
                    "{} is a character device but not device dax",
                    path.display()
                );
            }
            Ok(Backing::DevDax { size: dev_dax_size(st.st_rdev)? })
        }
        _ => {
            fail!(Error::InvalidArgument, "{} is not a regular file or device dax", path.display());
        }
    }
}

/// Reserve a contiguous window of address space, unbacked and inaccessible.
pub fn reserve(len: usize) -> Result<*mut u8> {
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let errno = last_errno();
        fail!(Error::Io(errno), "cannot reserve {} bytes of address space", len);
    }
    Ok(base as *mut u8)
}

/// Drop part of a reservation (or any mapping) without registry bookkeeping.
pub fn release(base: *mut u8, len: usize) {
    if len > 0 {
        unsafe {
            libc::munmap(base as *mut libc::c_void, len);
        }
    }
}

fn raw_map(
    at: MapAt,
    len: usize,
    flags: libc::c_int,
    fd: libc::c_int,
    offset: u64,
) -> std::result::Result<*mut u8, i32> {
    let (hint, place) = match at {
        MapAt::Anywhere => (ptr::null_mut(), 0),
        MapAt::Fixed(p) => (p as *mut libc::c_void, libc::MAP_FIXED),
        MapAt::FixedNoReplace(p) => (p as *mut libc::c_void, libc::MAP_FIXED_NOREPLACE),
    };
    let base = unsafe {
        libc::mmap(
            hint,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags | place,
            fd,
            offset as libc::off_t,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(last_errno());
    }
    Ok(base as *mut u8)
}

/// Map `len` bytes of `file` starting at `offset`.
///
/// Regular files are first mapped with the sync-on-fault flag; if the
/// filesystem rejects it the mapping is retried as a plain shared mapping
/// and left unregistered. DAX devices always map shared and register as
/// `DevDax`. On success the registered window is recorded before returning.
pub fn map_part(
    at: MapAt,
    file: &File,
    path: &Path,
    len: usize,
    offset: u64,
    dev_dax: bool,
) -> Result<MappedPart> {
    if len == 0 || offset % util::page_size() as u64 != 0 {
        fail!(
            Error::InvalidArgument,
            "bad mapping request for {} ({} bytes at {})",
            path.display(),
            len,
            offset
        );
    }
    let len = util::align_up(len, util::page_size());

    let fd = file.as_raw_fd();

    let (base, kind) = if dev_dax {
        let base = match raw_map(at, len, libc::MAP_SHARED, fd, offset) {
            Ok(b) => b,
            Err(errno) => {
                fail!(Error::Io(errno), "mmap {} ({} bytes) failed", path.display(), len);
            }
        };
        (base, Some(RangeKind::DevDax))
    } else {
        match raw_map(at, len, libc::MAP_SHARED_VALIDATE | libc::MAP_SYNC, fd, offset) {
            Ok(base) => (base, Some(RangeKind::MapSync)),
            Err(libc::EOPNOTSUPP) | Err(libc::EINVAL) => {
                log::debug!("MAP_SYNC rejected for {}, retrying without", path.display());
                match raw_map(at, len, libc::MAP_SHARED, fd, offset) {
                    Ok(base) => (base, None),
                    Err(errno) => {
                        fail!(Error::Io(errno), "mmap {} ({} bytes) failed", path.display(), len);
                    }
                }
            }
            Err(errno) => {
                fail!(Error::Io(errno), "mmap {} ({} bytes) failed", path.display(), len);
            }
        }
    };

    if let Some(kind) = kind {
        if let Err(e) = registry::register(base as usize, len, path, kind) {
            unsafe {
                libc::munmap(base as *mut libc::c_void, len);
            }
            return Err(e);
        }
    }

    Ok(MappedPart { base, len, kind })
}

/// Unmap a window previously returned by `map_part`, dropping its registry
/// entry first.
pub fn unmap_part(part: &MappedPart) {
    if part.kind.is_some() {
        // A missing entry here means a registry bug, but unmapping must
        // proceed regardless.
        if let Err(e) = registry::unregister(part.base as usize, part.len) {
            log::warn!("unregister {:#x}+{:#x}: {}", part.base as usize, part.len, e);
        }
    }
    unsafe {
        libc::munmap(part.base as *mut libc::c_void, part.len);
    }
}

/// Set a memory range read-only, page-rounded. Best effort.
pub fn range_ro(addr: *mut u8, len: usize) -> Result<()> {
    mprotect(addr, len, libc::PROT_READ)
}

/// Set a memory range read-write, page-rounded.
pub fn range_rw(addr: *mut u8, len: usize) -> Result<()> {
    mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE)
}

fn mprotect(addr: *mut u8, len: usize, prot: libc::c_int) -> Result<()> {
    let pagesize = util::page_size();
    let len = len + (addr as usize & (pagesize - 1));
    let uptr = addr as usize & !(pagesize - 1);

    if unsafe { libc::mprotect(uptr as *mut libc::c_void, len, prot) } < 0 {
        let errno = last_errno();
        fail!(Error::Io(errno), "mprotect {:#x}+{:#x} failed", uptr, len);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(len: usize) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!(
            "pmem-mmap-test-{}-{:x}",
            std::process::id(),
            crate::rand::Xoshiro256::new(0).next()
        ));
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        (path, f)
    }

    #[test]
    fn classify_regular_file() {
        let (path, f) = temp_file(8192);
        let backing = classify(&f, &path).unwrap();
        assert_eq!(backing, Backing::Regular { size: 8192 });
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn map_and_unmap_regular_file() {
        let len = 4 * util::page_size();
        let (path, f) = temp_file(len);

        let part = map_part(MapAt::Anywhere, &f, &path, len, 0, false).unwrap();
        unsafe {
            *part.base = 0x42;
            assert_eq!(*part.base, 0x42);
        }
        // tmpfs/ext4-without-dax never grants MAP_SYNC here.
        if part.kind.is_none() {
            assert!(!registry::is_pmem(part.base as usize, len));
        }
        unmap_part(&part);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn fixed_mapping_lands_inside_a_reservation() {
        let len = 4 * util::page_size();
        let (path, f) = temp_file(len);

        let resv = reserve(2 * len).unwrap();
        let at = unsafe { resv.add(len) };
        let part = map_part(MapAt::Fixed(at), &f, &path, len, 0, false).unwrap();
        assert_eq!(part.base, at);

        unmap_part(&part);
        release(resv, len);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn lengths_round_up_to_page_size() {
        let (path, f) = temp_file(8192);

        let part = map_part(MapAt::Anywhere, &f, &path, 100, 0, false).unwrap();
        assert_eq!(part.len, util::page_size());
        unmap_part(&part);

        let err = map_part(MapAt::Anywhere, &f, &path, 4096, 123, false).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn protection_toggles() {
        let len = util::page_size();
        let (path, f) = temp_file(len);
        let part = map_part(MapAt::Anywhere, &f, &path, len, 0, false).unwrap();

        range_ro(part.base, len).unwrap();
        unsafe {
            assert_eq!(*part.base, 0);
        }
        range_rw(part.base, len).unwrap();
        unsafe {
            *part.base = 1;
        }

        unmap_part(&part);
        std::fs::remove_file(&path).unwrap();
    }
}
