/// Pool lifecycle: create, open, close, check, extend.
///
/// A pool is one or more replicas; a replica is one or more part files
/// mapped back to back into a single reserved address window so the usable
/// region is contiguous. Part files after the first map at an offset that
/// skips their own header, keeping headers out of the data window; the
/// first part's header stays in-window and is protected read-only after
/// setup.
mod hdr;
mod set;


pub use hdr::{HdrInfo, PoolAttr, PoolHdr, POOL_HDR_LEN, POOL_HDR_SIZE};
pub use set::{HdrMode, PartSpec, ReplicaSpec, SetSpec, MIN_PART_SIZE, SET_MAGIC};

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{fail, Error, Result};
use crate::mmap::{self, Backing, MapAt, MappedPart};
use crate::persist;
use crate::rand::{uuid_generate, Xoshiro256};
use crate::util;

/// A part file opened and locked, not yet mapped.
struct PartIo {
    path: PathBuf,
    file: File,
    backing: Backing,
}

/// A mapped part of a replica.
struct Part {
    path: PathBuf,
    file: File,
    backing: Backing,
    has_hdr: bool,
    /// Offset of the data window within the file (skips the header for
    /// non-first parts).
    map_off: u64,
    map: MappedPart,
}

struct Replica {
    parts: Vec<Part>,
    base: *mut u8,
    resv_len: usize,
    /// Bytes of the reservation already replaced by part mappings.
    mapped_len: usize,
    repsize: u64,
}

impl Drop for Replica {
    fn drop(&mut self) {
        for part in &self.parts {
            mmap::unmap_part(&part.map);
        }
        if self.mapped_len < self.resv_len {
            mmap::release(
                unsafe { self.base.add(self.mapped_len) },
                self.resv_len - self.mapped_len,
            );
        }
    }
}

/// An open pool. Dropping the handle closes it: every part is unmapped,
/// its registry entry removed, and the file locks released. Files are
/// never deleted by close.
pub struct Pool {
    replicas: Vec<Replica>,
    hdr_mode: HdrMode,
    set_path: Option<PathBuf>,
    poolsize: u64,
    read_only: bool,
    uuid: [u8; 16],
    crtime: u64,
    attr: PoolAttr,
}

// The handle owns its mappings; the raw pointers do not alias anything
// outside the pool.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn lock_file(file: &File, path: &Path) -> Result<()> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } < 0 {
        let errno = last_errno();
        if errno == libc::EWOULDBLOCK {
            fail!(Error::InUse, "{} is in use by another process", path.display());
        }
        fail!(Error::Io(errno), "cannot lock {}", path.display());
    }
    Ok(())
}

/// Create a part file of the declared size, or accept an existing DAX
/// device in its place. Freshly created paths are appended to `created`
/// for rollback.
fn create_part_file(path: &Path, size: u64, created: &mut Vec<PathBuf>) -> Result<PartIo> {
    match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
        Ok(file) => {
            created.push(path.to_path_buf());
            lock_file(&file, path)?;
            let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
            if ret != 0 {
                fail!(Error::Io(ret), "cannot allocate {} bytes for {}", size, path.display());
            }
            Ok(PartIo { path: path.to_path_buf(), file, backing: Backing::Regular { size } })
        }
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
            // An existing device DAX node is usable as-is.
            let file = match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    let errno = e.raw_os_error().unwrap_or(libc::EIO);
                    fail!(Error::Io(errno), "cannot open {}", path.display());
                }
            };
            let backing = mmap::classify(&file, path)?;
            if !backing.is_dev_dax() {
                fail!(Error::Io(libc::EEXIST), "{} already exists", path.display());
            }
            if size > backing.size() {
                fail!(
                    Error::InvalidArgument,
                    "declared size {} exceeds device size {} for {}",
                    size,
                    backing.size(),
                    path.display()
                );
            }
            lock_file(&file, path)?;
            Ok(PartIo { path: path.to_path_buf(), file, backing })
        }
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            fail!(Error::Io(errno), "cannot create {}", path.display());
        }
    }
}

fn open_part_file(path: &Path, declared: u64) -> Result<PartIo> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            fail!(Error::Io(errno), "cannot open {}", path.display());
        }
    };
    let backing = mmap::classify(&file, path)?;
    if declared > 0 && backing.size() < declared {
        fail!(
            Error::InvalidHeader,
            "truncated part {}: {} bytes, declared {}",
            path.display(),
            backing.size(),
            declared
        );
    }
    lock_file(&file, path)?;
    Ok(PartIo { path: path.to_path_buf(), file, backing })
}

struct Geometry {
    map_off: u64,
    map_len: usize,
    data_len: usize,
}

fn part_geometry(path: &Path, backing_size: u64, has_hdr: bool, first: bool) -> Result<Geometry> {
    let aligned = util::align_down(backing_size as usize, util::mmap_align());
    let overhead = if has_hdr { POOL_HDR_SIZE } else { 0 };
    if aligned < MIN_PART_SIZE as usize || aligned <= overhead {
        fail!(Error::InvalidHeader, "truncated part {} ({} usable bytes)", path.display(), aligned);
    }

    if has_hdr && first {
        // Header stays in the data window; the usable region starts after it.
        Ok(Geometry { map_off: 0, map_len: aligned, data_len: aligned - POOL_HDR_SIZE })
    } else if has_hdr {
        Ok(Geometry {
            map_off: POOL_HDR_SIZE as u64,
            map_len: aligned - POOL_HDR_SIZE,
            data_len: aligned - POOL_HDR_SIZE,
        })
    } else {
        Ok(Geometry { map_off: 0, map_len: aligned, data_len: aligned })
    }
}

/// Map every part of one replica consecutively into a reserved window.
/// On failure the partially built replica unwinds its own mappings.
fn map_replica(parts_io: Vec<PartIo>, hdr_mode: HdrMode) -> Result<Replica> {
    let mut geoms = Vec::with_capacity(parts_io.len());
    let mut resv_len = 0usize;
    for (i, pio) in parts_io.iter().enumerate() {
        let g = part_geometry(&pio.path, pio.backing.size(), hdr_mode.part_has_hdr(i), i == 0)?;
        resv_len += g.map_len;
        geoms.push(g);
    }

    let base = mmap::reserve(resv_len)?;
    let mut rep = Replica { parts: Vec::new(), base, resv_len, mapped_len: 0, repsize: 0 };

    for (i, (pio, g)) in parts_io.into_iter().zip(geoms).enumerate() {
        let at = unsafe { base.add(rep.mapped_len) };
        let map = mmap::map_part(
            MapAt::Fixed(at),
            &pio.file,
            &pio.path,
            g.map_len,
            g.map_off,
            pio.backing.is_dev_dax(),
        )?;
        rep.mapped_len += g.map_len;
        rep.repsize += g.data_len as u64;
        rep.parts.push(Part {
            path: pio.path,
            file: pio.file,
            backing: pio.backing,
            has_hdr: hdr_mode.part_has_hdr(i),
            map_off: g.map_off,
            map,
        });
    }

    Ok(rep)
}

fn read_hdr(part: &Part) -> Result<[u8; POOL_HDR_LEN]> {
    let mut image = [0u8; POOL_HDR_LEN];
    if part.has_hdr && part.map_off == 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(part.map.base, image.as_mut_ptr(), POOL_HDR_LEN);
        }
    } else {
        let tmp = mmap::map_part(
            MapAt::Anywhere,
            &part.file,
            &part.path,
            POOL_HDR_SIZE,
            0,
            part.backing.is_dev_dax(),
        )?;
        unsafe {
            std::ptr::copy_nonoverlapping(tmp.base, image.as_mut_ptr(), POOL_HDR_LEN);
        }
        mmap::unmap_part(&tmp);
    }
    Ok(image)
}

fn write_hdr(part: &Part, image: &[u8; POOL_HDR_LEN]) -> Result<()> {
    unsafe fn store(base: *mut u8, image: &[u8; POOL_HDR_LEN]) {
        std::ptr::copy_nonoverlapping(image.as_ptr(), base, POOL_HDR_LEN);
        std::ptr::write_bytes(base.add(POOL_HDR_LEN), 0, POOL_HDR_SIZE - POOL_HDR_LEN);
        persist::persist(base as *const u8, POOL_HDR_SIZE);
    }

    if part.has_hdr && part.map_off == 0 {
        unsafe { store(part.map.base, image) };
    } else {
        let tmp = mmap::map_part(
            MapAt::Anywhere,
            &part.file,
            &part.path,
            POOL_HDR_SIZE,
            0,
            part.backing.is_dev_dax(),
        )?;
        unsafe { store(tmp.base, image) };
        mmap::unmap_part(&tmp);
    }
    Ok(())
}

fn protect_headers(replicas: &[Replica], hdr_mode: HdrMode) {
    if !hdr_mode.part_has_hdr(0) {
        return;
    }
    for rep in replicas {
        // Best effort; huge-page mappings may refuse partial protection.
        if let Err(e) = mmap::range_ro(rep.base, POOL_HDR_SIZE) {
            log::info!("cannot write-protect pool header: {}", e);
        }
    }
}

/// Create a pool.
///
/// With `poolsize > 0`, `path` names a single backing file to be created
/// with exactly that size (or an existing DAX device). With `poolsize == 0`,
/// `path` names a pool set descriptor whose parts are created. On any
/// failure nothing is left behind: freshly created files are deleted and
/// no range stays registered.
pub fn create(path: &Path, poolsize: u64, attr: &PoolAttr) -> Result<Pool> {
    crate::init();
    log::info!("create pool {} size {}", path.display(), poolsize);

    let (spec, set_path) = if poolsize == 0 {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                fail!(Error::Io(errno), "cannot read pool set file {}", path.display());
            }
        };
        if !set::looks_like_set(text.as_bytes()) {
            fail!(Error::InvalidArgument, "{} is not a pool set file", path.display());
        }
        let dir = path.parent().unwrap_or(Path::new("."));
        (SetSpec::parse(&text, dir)?, Some(path.to_path_buf()))
    } else {
        if poolsize < MIN_PART_SIZE {
            fail!(
                Error::InvalidArgument,
                "pool size {} smaller than the {} byte minimum",
                poolsize,
                MIN_PART_SIZE
            );
        }
        (SetSpec::single(path, poolsize), None)
    };

    let mut created: Vec<PathBuf> = Vec::new();
    let result = create_inner(&spec, attr, set_path, &mut created);
    if result.is_err() {
        for p in created.iter().rev() {
            let _ = std::fs::remove_file(p);
        }
    }
    result
}

fn create_inner(
    spec: &SetSpec,
    attr: &PoolAttr,
    set_path: Option<PathBuf>,
    created: &mut Vec<PathBuf>,
) -> Result<Pool> {
    let mut replicas = Vec::with_capacity(spec.replicas.len());
    for rspec in &spec.replicas {
        let mut parts_io = Vec::with_capacity(rspec.parts.len());
        for pspec in &rspec.parts {
            parts_io.push(create_part_file(&pspec.path, pspec.size, created)?);
        }
        replicas.push(map_replica(parts_io, spec.hdr_mode)?);
    }

    let poolsize = replicas.iter().map(|r| r.repsize).min().unwrap_or(0);

    // Headerless pools carry no identity.
    let (uuid, crtime) = if spec.hdr_mode == HdrMode::None {
        ([0u8; 16], 0)
    } else {
        let mut rng = Xoshiro256::new(0);
        let uuid = uuid_generate(&mut rng);
        let crtime =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        let image = PoolHdr::new(attr, uuid, crtime).encode();
        for rep in &replicas {
            for part in rep.parts.iter().filter(|p| p.has_hdr) {
                write_hdr(part, &image)?;
            }
        }
        (uuid, crtime)
    };

    protect_headers(&replicas, spec.hdr_mode);

    Ok(Pool {
        replicas,
        hdr_mode: spec.hdr_mode,
        set_path,
        poolsize,
        read_only: false,
        uuid,
        crtime,
        attr: *attr,
    })
}

/// Open an existing pool (single backing file or set descriptor; the two
/// are told apart by content, not by name).
pub fn open(path: &Path, attr: &PoolAttr) -> Result<Pool> {
    crate::init();
    log::info!("open pool {}", path.display());

    let probe = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(libc::EIO);
            fail!(Error::Io(errno), "cannot open {}", path.display());
        }
    };
    let probe_backing = mmap::classify(&probe, path)?;

    let is_set = !probe_backing.is_dev_dax() && {
        let mut head = [0u8; 4096];
        let n = (&probe).read(&mut head).unwrap_or(0);
        set::looks_like_set(&head[..n])
    };

    let (spec, set_path) = if is_set {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                fail!(Error::Io(errno), "cannot read pool set file {}", path.display());
            }
        };
        let dir = path.parent().unwrap_or(Path::new("."));
        (SetSpec::parse(&text, dir)?, Some(path.to_path_buf()))
    } else {
        (SetSpec::single(path, 0), None)
    };
    drop(probe);

    let mut replicas = Vec::with_capacity(spec.replicas.len());
    for rspec in &spec.replicas {
        let mut parts_io = Vec::with_capacity(rspec.parts.len());
        for pspec in &rspec.parts {
            parts_io.push(open_part_file(&pspec.path, pspec.size)?);
        }
        replicas.push(map_replica(parts_io, spec.hdr_mode)?);
    }

    let poolsize = replicas.iter().map(|r| r.repsize).min().unwrap_or(0);

    let mut read_only = false;
    let (uuid, crtime) = if spec.hdr_mode == HdrMode::None {
        ([0u8; 16], 0)
    } else {
        let mut reference: Option<HdrInfo> = None;
        for rep in &replicas {
            for part in rep.parts.iter().filter(|p| p.has_hdr) {
                let image = read_hdr(part)?;
                let info = PoolHdr::validate(&image, attr)?;
                read_only |= info.read_only;
                match reference {
                    None => reference = Some(info),
                    Some(first) => {
                        if first.uuid != info.uuid
                            || first.compat_features != info.compat_features
                            || first.incompat_features != info.incompat_features
                            || first.ro_compat_features != info.ro_compat_features
                        {
                            fail!(
                                Error::ReplicaMismatch,
                                "part {} disagrees on pool identity",
                                part.path.display()
                            );
                        }
                    }
                }
            }
        }
        let first = reference.unwrap();
        (first.uuid, first.crtime)
    };

    protect_headers(&replicas, spec.hdr_mode);

    Ok(Pool {
        replicas,
        hdr_mode: spec.hdr_mode,
        set_path,
        poolsize,
        read_only,
        uuid,
        crtime,
        attr: *attr,
    })
}

impl Pool {
    /// Base address of the usable region (the first replica's data,
    /// directly after its in-window header when there is one).
    pub fn as_mut_ptr(&self) -> *mut u8 {
        let overhead = if self.hdr_mode.part_has_hdr(0) { POOL_HDR_SIZE } else { 0 };
        unsafe { self.replicas[0].base.add(overhead) }
    }

    /// Usable pool size: the smallest replica's data size.
    pub fn len(&self) -> usize {
        self.poolsize as usize
    }

    pub fn is_empty(&self) -> bool {
        self.poolsize == 0
    }

    /// True iff every byte of the usable region lies in a mapping whose
    /// kind guarantees CPU-cache persistence.
    pub fn is_pmem(&self) -> bool {
        persist::is_pmem(self.as_mut_ptr() as *const u8, self.len())
    }

    /// Unsupported ro_compat feature bits forced read-only mode.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// Creation time, seconds since the epoch.
    pub fn crtime(&self) -> u64 {
        self.crtime
    }

    pub fn attr(&self) -> &PoolAttr {
        &self.attr
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Base address of a replica's data region.
    pub fn replica_ptr(&self, idx: usize) -> Option<*mut u8> {
        let overhead = if self.hdr_mode.part_has_hdr(0) { POOL_HDR_SIZE } else { 0 };
        self.replicas.get(idx).map(|r| unsafe { r.base.add(overhead) })
    }

    /// Close the pool: unmap every part and release the locks. Equivalent
    /// to dropping the handle; files are untouched.
    pub fn close(self) {}

    /// Grow the pool by appending a part to its (single) replica. The new
    /// part must map directly after the current end of the replica so
    /// pointers already handed out stay valid; if the address space there
    /// is taken the call fails and the pool is unchanged.
    pub fn extend(&mut self, size: u64) -> Result<*mut u8> {
        if self.read_only {
            fail!(Error::InvalidArgument, "cannot extend a read-only pool");
        }
        let Some(set_path) = self.set_path.clone() else {
            fail!(Error::InvalidArgument, "cannot extend a pool that is not backed by a set file");
        };
        if self.replicas.len() > 1 {
            fail!(Error::InvalidArgument, "extending replicated pool sets is not supported");
        }
        if size < MIN_PART_SIZE {
            fail!(
                Error::InvalidArgument,
                "part size {} smaller than the {} byte minimum",
                size,
                MIN_PART_SIZE
            );
        }

        let hdr_mode = self.hdr_mode;
        let has_hdr = hdr_mode == HdrMode::PerPart;
        let idx = self.replicas[0].parts.len();
        let new_path = PathBuf::from(format!("{}.part{}", set_path.display(), idx));

        let mut created: Vec<PathBuf> = Vec::new();
        let result = (|| -> Result<*mut u8> {
            let pio = create_part_file(&new_path, size, &mut created)?;
            let g = part_geometry(&pio.path, pio.backing.size(), has_hdr, false)?;

            let rep = &mut self.replicas[0];
            let at = unsafe { rep.base.add(rep.resv_len) };
            let map = mmap::map_part(
                MapAt::FixedNoReplace(at),
                &pio.file,
                &pio.path,
                g.map_len,
                g.map_off,
                pio.backing.is_dev_dax(),
            )?;

            let part = Part {
                path: pio.path,
                file: pio.file,
                backing: pio.backing,
                has_hdr,
                map_off: g.map_off,
                map,
            };

            if has_hdr {
                let image = PoolHdr::new(&self.attr, self.uuid, self.crtime).encode();
                if let Err(e) = write_hdr(&part, &image) {
                    mmap::unmap_part(&part.map);
                    return Err(e);
                }
            }

            // Record the new part in the descriptor before publishing it.
            let line = format!("{} {}\n", size, part.path.display());
            let append = OpenOptions::new().append(true).open(&set_path).and_then(
                |mut f| {
                    use std::io::Write;
                    f.write_all(line.as_bytes())
                },
            );
            if let Err(e) = append {
                mmap::unmap_part(&part.map);
                let errno = e.raw_os_error().unwrap_or(libc::EIO);
                fail!(Error::Io(errno), "cannot append part to {}", set_path.display());
            }

            let data = part.map.base;
            let rep = &mut self.replicas[0];
            rep.resv_len += g.map_len;
            rep.mapped_len += g.map_len;
            rep.repsize += g.data_len as u64;
            rep.parts.push(part);
            self.poolsize = self.replicas.iter().map(|r| r.repsize).min().unwrap_or(0);
            Ok(data)
        })();

        if result.is_err() {
            for p in created.iter().rev() {
                let _ = std::fs::remove_file(p);
            }
        }
        result
    }
}

/// Outcome of a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Consistent,
    Inconsistent,
}

/// Check a pool without keeping it open: open, then close immediately,
/// mapping consistency failures to `Inconsistent` and everything else to
/// an error.
pub fn check(path: &Path, attr: &PoolAttr) -> Result<CheckResult> {
    match open(path, attr) {
        Ok(pool) => {
            drop(pool);
            Ok(CheckResult::Consistent)
        }
        Err(
            Error::InvalidHeader
            | Error::WrongType
            | Error::VersionMismatch
            | Error::UnsupportedIncompat
            | Error::ReplicaMismatch,
        ) => Ok(CheckResult::Inconsistent),
        Err(e) => Err(e),
    }
}
