//! Pool lifecycle on real files: create/open/close, header corruption,
//! version and feature handling, pool sets, in-use detection.
//!
//! Runs against ordinary files in the temp directory, so mappings take the
//! msync path and `is_pmem` is false throughout.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use pmem::pool::{self, CheckResult, PoolAttr, MIN_PART_SIZE, POOL_HDR_SIZE};
use pmem::{Error, MemFlags};

const MIB: u64 = 1024 * 1024;

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(tag: &str) -> TempDir {
        let path = std::env::temp_dir().join(format!(
            "pmem-{}-{}-{:x}",
            tag,
            std::process::id(),
            pmem::rand::Xoshiro256::new(0).next()
        ));
        fs::create_dir_all(&path).unwrap();
        TempDir { path }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn attr() -> PoolAttr {
    PoolAttr::new("PMEMOBJ").unwrap()
}

/// Patch `bytes` into the pool file at `offset`, recomputing the header
/// checksum so only the intended field is off.
fn patch_header(path: &PathBuf, offset: u64, bytes: &[u8]) {
    let mut f = fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut hdr = vec![0u8; 4096];
    f.read_exact(&mut hdr).unwrap();
    hdr[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
    pmem::util::checksum(&mut hdr, 4088, true);
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(&hdr).unwrap();
}

#[test]
fn create_then_open_roundtrip() {
    let dir = TempDir::new("roundtrip");
    let path = dir.file("pool");

    let pool = pool::create(&path, 16 * MIB, &attr()).unwrap();
    assert_eq!(pool.len() as u64, 16 * MIB - POOL_HDR_SIZE as u64);
    assert!(!pool.read_only());
    let uuid = pool.uuid();
    assert_ne!(uuid, [0u8; 16]);

    // Store through the persist facade and make it durable.
    unsafe {
        let p = pool.as_mut_ptr();
        pmem::memset(p, 0xab, 4096, MemFlags::empty());
        pmem::persist(p, 4096);
    }
    pool.close();

    let pool = pool::open(&path, &attr()).unwrap();
    assert_eq!(pool.len() as u64, 16 * MIB - POOL_HDR_SIZE as u64);
    assert_eq!(pool.uuid(), uuid);
    unsafe {
        assert_eq!(*pool.as_mut_ptr(), 0xab);
    }
    pool.close();
}

#[test]
fn create_rejects_existing_file_and_tiny_pools() {
    let dir = TempDir::new("reject");
    let path = dir.file("pool");

    pool::create(&path, 16 * MIB, &attr()).unwrap().close();
    assert!(matches!(pool::create(&path, 16 * MIB, &attr()), Err(Error::Io(_))));

    let tiny = dir.file("tiny");
    assert!(matches!(
        pool::create(&tiny, MIN_PART_SIZE - 1, &attr()),
        Err(Error::InvalidArgument)
    ));
    assert!(!tiny.exists());
}

#[test]
fn corrupt_signature_fails_checksum() {
    let dir = TempDir::new("corrupt");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    // Flip bit 0 of the first signature byte directly on disk (without
    // fixing the checksum): open must report an invalid header.
    let mut f = fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut byte = [0u8; 1];
    f.read_exact(&mut byte).unwrap();
    byte[0] ^= 1;
    f.seek(SeekFrom::Start(0)).unwrap();
    f.write_all(&byte).unwrap();
    drop(f);

    assert!(matches!(pool::open(&path, &attr()), Err(Error::InvalidHeader)));
    assert_eq!(pool::check(&path, &attr()).unwrap(), CheckResult::Inconsistent);
}

#[test]
fn newer_major_version_is_rejected() {
    let dir = TempDir::new("version");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    patch_header(&path, 8, &2u32.to_le_bytes());

    assert!(matches!(pool::open(&path, &attr()), Err(Error::VersionMismatch)));
    assert_eq!(pool::check(&path, &attr()).unwrap(), CheckResult::Inconsistent);
}

#[test]
fn wrong_signature_with_valid_checksum() {
    let dir = TempDir::new("wrongtype");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    patch_header(&path, 0, b"PMEMLOG\0");

    assert!(matches!(pool::open(&path, &attr()), Err(Error::WrongType)));
}

#[test]
fn unknown_ro_compat_bit_forces_read_only() {
    let dir = TempDir::new("rocompat");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    patch_header(&path, 20, &(1u32 << 7).to_le_bytes());

    let pool = pool::open(&path, &attr()).unwrap();
    assert!(pool.read_only());
    pool.close();
}

#[test]
fn unknown_incompat_bit_refuses_open() {
    let dir = TempDir::new("incompat");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    patch_header(&path, 16, &(1u32 << 2).to_le_bytes());

    assert!(matches!(pool::open(&path, &attr()), Err(Error::UnsupportedIncompat)));
}

#[test]
fn second_open_reports_in_use() {
    let dir = TempDir::new("inuse");
    let path = dir.file("pool");

    let pool = pool::create(&path, 16 * MIB, &attr()).unwrap();
    assert!(matches!(pool::open(&path, &attr()), Err(Error::InUse)));
    pool.close();

    let pool = pool::open(&path, &attr()).unwrap();
    pool.close();
}

#[test]
fn open_missing_pool_is_an_io_error() {
    let dir = TempDir::new("missing");
    assert!(matches!(pool::open(&dir.file("nope"), &attr()), Err(Error::Io(_))));
}

#[test]
fn multi_part_set_concatenates_usable_sizes() {
    let dir = TempDir::new("set");
    let setfile = dir.file("pool.set");
    fs::write(
        &setfile,
        format!(
            "PMEMPOOLSET\n2M {}\n4M {}\n",
            dir.file("part0").display(),
            dir.file("part1").display()
        ),
    )
    .unwrap();

    let pool = pool::create(&setfile, 0, &attr()).unwrap();
    // Per-part headers: each part donates its size minus one header.
    assert_eq!(pool.len() as u64, 2 * MIB + 4 * MIB - 2 * POOL_HDR_SIZE as u64);
    let uuid = pool.uuid();

    // The usable region is contiguous across the part boundary.
    let len = pool.len();
    unsafe {
        let p = pool.as_mut_ptr();
        pmem::memset(p, 0x11, len, MemFlags::empty());
        pmem::persist(p, len);
    }
    pool.close();

    let pool = pool::open(&setfile, &attr()).unwrap();
    assert_eq!(pool.uuid(), uuid);
    unsafe {
        assert_eq!(*pool.as_mut_ptr().add(len - 1), 0x11);
    }
    pool.close();
}

#[test]
fn single_header_set_has_one_header_of_overhead() {
    let dir = TempDir::new("singlehdr");
    let setfile = dir.file("pool.set");
    fs::write(
        &setfile,
        format!(
            "PMEMPOOLSET\nOPTION SINGLEHDR\n2M {}\n2M {}\n",
            dir.file("p0").display(),
            dir.file("p1").display()
        ),
    )
    .unwrap();

    let pool = pool::create(&setfile, 0, &attr()).unwrap();
    assert_eq!(pool.len() as u64, 4 * MIB - POOL_HDR_SIZE as u64);
    pool.close();

    pool::open(&setfile, &attr()).unwrap().close();
}

#[test]
fn headerless_set_uses_every_byte() {
    let dir = TempDir::new("nohdrs");
    let setfile = dir.file("pool.set");
    fs::write(
        &setfile,
        format!("PMEMPOOLSET\nOPTION NOHDRS\n2M {}\n", dir.file("p0").display()),
    )
    .unwrap();

    let pool = pool::create(&setfile, 0, &attr()).unwrap();
    assert_eq!(pool.len() as u64, 2 * MIB);
    // Headerless pools carry no identity.
    assert_eq!(pool.uuid(), [0u8; 16]);
    pool.close();

    let pool = pool::open(&setfile, &attr()).unwrap();
    assert_eq!(pool.len() as u64, 2 * MIB);
    pool.close();
}

#[test]
fn replicated_set_opens_and_reports_min_size() {
    let dir = TempDir::new("replica");
    let setfile = dir.file("pool.set");
    fs::write(
        &setfile,
        format!(
            "PMEMPOOLSET\n4M {}\nREPLICA\n2M {}\n",
            dir.file("r0p0").display(),
            dir.file("r1p0").display()
        ),
    )
    .unwrap();

    let pool = pool::create(&setfile, 0, &attr()).unwrap();
    // Pool size is the smallest replica.
    assert_eq!(pool.len() as u64, 2 * MIB - POOL_HDR_SIZE as u64);
    assert_eq!(pool.replica_count(), 2);
    assert!(pool.replica_ptr(1).is_some());
    pool.close();

    pool::open(&setfile, &attr()).unwrap().close();
}

#[test]
fn replica_uuid_mismatch_is_detected() {
    let dir = TempDir::new("mismatch");
    let setfile = dir.file("pool.set");
    let r0 = dir.file("r0p0");
    let r1 = dir.file("r1p0");
    fs::write(
        &setfile,
        format!("PMEMPOOLSET\n2M {}\nREPLICA\n2M {}\n", r0.display(), r1.display()),
    )
    .unwrap();

    pool::create(&setfile, 0, &attr()).unwrap().close();

    // Rewrite the second replica's UUID.
    patch_header(&r1, 24, &[0x5a; 16]);

    assert!(matches!(pool::open(&setfile, &attr()), Err(Error::ReplicaMismatch)));
    assert_eq!(pool::check(&setfile, &attr()).unwrap(), CheckResult::Inconsistent);
}

#[test]
fn failed_set_create_rolls_back_created_parts() {
    let dir = TempDir::new("rollback");
    let setfile = dir.file("pool.set");
    let p0 = dir.file("part0");
    // Second part lives in a directory that does not exist.
    let p1 = dir.file("nodir/part1");
    fs::write(
        &setfile,
        format!("PMEMPOOLSET\n2M {}\n2M {}\n", p0.display(), p1.display()),
    )
    .unwrap();

    assert!(pool::create(&setfile, 0, &attr()).is_err());
    assert!(!p0.exists(), "rollback must delete freshly created parts");
}

#[test]
fn extend_appends_a_part_and_grows_the_pool() {
    let dir = TempDir::new("extend");
    let setfile = dir.file("pool.set");
    fs::write(
        &setfile,
        format!("PMEMPOOLSET\n4M {}\n", dir.file("part0").display()),
    )
    .unwrap();

    let mut pool = pool::create(&setfile, 0, &attr()).unwrap();
    let before = pool.len();
    let base = pool.as_mut_ptr();

    match pool.extend(2 * MIB) {
        Ok(_) => {
            assert_eq!(pool.len() as u64, before as u64 + 2 * MIB - POOL_HDR_SIZE as u64);
            // Existing pointers stay valid.
            assert_eq!(pool.as_mut_ptr(), base);
            let len = pool.len();
            unsafe {
                pmem::memset(base, 0x3c, len, MemFlags::empty());
                pmem::persist(base, len);
            }
            pool.close();

            // The appended part is recorded in the descriptor.
            let pool = pool::open(&setfile, &attr()).unwrap();
            assert_eq!(pool.len(), before + 2 * MIB as usize - POOL_HDR_SIZE);
            pool.close();
        }
        // The contiguity requirement may be unsatisfiable; the pool must
        // then be unchanged.
        Err(Error::Io(_)) => {
            assert_eq!(pool.len(), before);
            pool.close();
            pool::open(&setfile, &attr()).unwrap().close();
        }
        Err(e) => panic!("unexpected extend failure: {}", e),
    }
}

#[test]
fn check_reports_consistent_for_a_healthy_pool() {
    let dir = TempDir::new("check");
    let path = dir.file("pool");
    pool::create(&path, 16 * MIB, &attr()).unwrap().close();

    assert_eq!(pool::check(&path, &attr()).unwrap(), CheckResult::Consistent);
    assert!(matches!(pool::check(&dir.file("absent"), &attr()), Err(Error::Io(_))));
}

#[test]
fn persist_on_a_file_backed_pool_uses_msync() {
    let dir = TempDir::new("msync");
    let path = dir.file("pool");
    let pool = pool::create(&path, 16 * MIB, &attr()).unwrap();

    assert!(!pool.is_pmem());
    unsafe {
        let p = pool.as_mut_ptr();
        pmem::memcpy(p, b"durable".as_ptr(), 7, MemFlags::empty());
        pmem::persist(p, 7);
        pmem::msync(p, 7).unwrap();
    }
    pool.close();

    // The bytes reached the file.
    let mut f = fs::File::open(&path).unwrap();
    f.seek(SeekFrom::Start(POOL_HDR_SIZE as u64)).unwrap();
    let mut buf = [0u8; 7];
    f.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"durable");
}
