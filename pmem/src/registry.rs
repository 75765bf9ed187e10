/// Process-wide registry of mapped persistent-memory ranges.
///
/// Disjoint address ranges map to `(path, kind)`. Point queries run in
/// logarithmic time through the ordered map; readers (`is_pmem`) take the
/// shared side of the lock, writers are serialized on the exclusive side.
/// No syscalls are made while the lock is held.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use spin::RwLock;

use crate::error::{fail, Error, Result};

/// How durable stores to a mapped range are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    /// A DAX character device mapping.
    DevDax,
    /// A file mapping that accepted the sync-on-fault flag.
    MapSync,
    /// An ordinary file mapping; durability requires msync.
    Regular,
}

impl RangeKind {
    /// True for kinds where flush + drain from the CPU cache is durable.
    pub fn is_pmem(self) -> bool {
        matches!(self, RangeKind::DevDax | RangeKind::MapSync)
    }
}

#[derive(Debug, Clone)]
struct Range {
    len: usize,
    path: PathBuf,
    kind: RangeKind,
}

#[derive(Debug)]
pub struct RangeRegistry {
    // Keyed by base address; invariant: entries never overlap.
    ranges: BTreeMap<usize, Range>,
}

impl RangeRegistry {
    pub const fn new() -> Self {
        RangeRegistry { ranges: BTreeMap::new() }
    }

    /// The entry containing `addr`, if any.
    fn find(&self, addr: usize) -> Option<(usize, &Range)> {
        let (&base, range) = self.ranges.range(..=addr).next_back()?;
        if addr < base + range.len {
            Some((base, range))
        } else {
            None
        }
    }

    /// Insert `[base, base + len)`. Fails with `Overlap` if it intersects
    /// any registered range.
    pub fn register(&mut self, base: usize, len: usize, path: &Path, kind: RangeKind) -> Result<()> {
        if len == 0 || base.checked_add(len).is_none() {
            fail!(Error::InvalidArgument, "bad range {:#x}+{:#x}", base, len);
        }

        if let Some((prev_base, prev)) = self.ranges.range(..=base).next_back() {
            if prev_base + prev.len > base {
                fail!(
                    Error::Overlap,
                    "range {:#x}+{:#x} overlaps {:#x}+{:#x} ({})",
                    base,
                    len,
                    prev_base,
                    prev.len,
                    prev.path.display()
                );
            }
        }
        if let Some((&next_base, next)) = self.ranges.range(base..).next() {
            if next_base < base + len {
                fail!(
                    Error::Overlap,
                    "range {:#x}+{:#x} overlaps {:#x}+{:#x} ({})",
                    base,
                    len,
                    next_base,
                    next.len,
                    next.path.display()
                );
            }
        }

        log::debug!("registered {:#x}+{:#x} {:?} {}", base, len, kind, path.display());
        self.ranges.insert(base, Range { len, path: path.to_path_buf(), kind });
        Ok(())
    }

    /// Remove `[base, base + len)`. The range must lie entirely within one
    /// registered entry; removing an interior piece splits the entry in two.
    pub fn unregister(&mut self, base: usize, len: usize) -> Result<()> {
        if len == 0 || base.checked_add(len).is_none() {
            fail!(Error::InvalidArgument, "bad range {:#x}+{:#x}", base, len);
        }

        let Some((entry_base, entry)) = self.find(base) else {
            fail!(Error::NotFound, "no registered range covers {:#x}+{:#x}", base, len);
        };
        let entry_end = entry_base + entry.len;
        if base + len > entry_end {
            fail!(Error::NotFound, "no registered range covers {:#x}+{:#x}", base, len);
        }

        let removed = self.ranges.remove(&entry_base).unwrap();
        if base > entry_base {
            self.ranges.insert(
                entry_base,
                Range { len: base - entry_base, path: removed.path.clone(), kind: removed.kind },
            );
        }
        if base + len < entry_end {
            self.ranges.insert(
                base + len,
                Range { len: entry_end - (base + len), path: removed.path, kind: removed.kind },
            );
        }

        log::debug!("unregistered {:#x}+{:#x}", base, len);
        Ok(())
    }

    /// True iff every byte of `[base, base + len)` lies in registered
    /// entries whose kind guarantees CPU-cache persistence. Any gap, any
    /// `Regular` entry, or any unknown-origin byte yields false.
    pub fn is_pmem(&self, base: usize, len: usize) -> bool {
        let Some(end) = base.checked_add(len) else {
            return false;
        };

        let mut addr = base;
        while addr < end {
            let Some((entry_base, entry)) = self.find(addr) else {
                return false;
            };
            if !entry.kind.is_pmem() {
                return false;
            }
            addr = entry_base + entry.len;
        }
        true
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.ranges.len()
    }
}

static REGISTRY: RwLock<RangeRegistry> = RwLock::new(RangeRegistry::new());

pub fn register(base: usize, len: usize, path: &Path, kind: RangeKind) -> Result<()> {
    REGISTRY.write().register(base, len, path, kind)
}

pub fn unregister(base: usize, len: usize) -> Result<()> {
    REGISTRY.write().unregister(base, len)
}

pub fn is_pmem(base: usize, len: usize) -> bool {
    REGISTRY.read().is_pmem(base, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> RangeRegistry {
        RangeRegistry::new()
    }

    #[test]
    fn register_then_overlap_fails() {
        let mut r = reg();
        r.register(0x1000, 0x2000, Path::new("/dev/dax0.0"), RangeKind::DevDax).unwrap();

        // [0x2000, 0x4000) intersects [0x1000, 0x3000).
        assert_eq!(
            r.register(0x2000, 0x2000, Path::new("/dev/dax0.1"), RangeKind::DevDax),
            Err(Error::Overlap)
        );

        // After dropping the first range the second fits.
        r.unregister(0x1000, 0x2000).unwrap();
        r.register(0x2000, 0x2000, Path::new("/dev/dax0.1"), RangeKind::DevDax).unwrap();
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let mut r = reg();
        r.register(0x1000, 0x1000, Path::new("a"), RangeKind::MapSync).unwrap();
        r.register(0x2000, 0x1000, Path::new("b"), RangeKind::MapSync).unwrap();
        r.register(0x0, 0x1000, Path::new("c"), RangeKind::MapSync).unwrap();
        assert_eq!(r.entry_count(), 3);
    }

    #[test]
    fn unregister_splits_entries() {
        let mut r = reg();
        r.register(0x10000, 0x4000, Path::new("a"), RangeKind::MapSync).unwrap();

        // Carve a page out of the middle; both remainders stay registered.
        r.unregister(0x11000, 0x1000).unwrap();
        assert_eq!(r.entry_count(), 2);
        assert!(r.is_pmem(0x10000, 0x1000));
        assert!(r.is_pmem(0x12000, 0x2000));
        assert!(!r.is_pmem(0x11000, 0x1000));
        assert!(!r.is_pmem(0x10000, 0x4000));
    }

    #[test]
    fn unregister_requires_containment() {
        let mut r = reg();
        r.register(0x1000, 0x1000, Path::new("a"), RangeKind::MapSync).unwrap();
        assert_eq!(r.unregister(0x1800, 0x1000), Err(Error::NotFound));
        assert_eq!(r.unregister(0x3000, 0x1000), Err(Error::NotFound));
        r.unregister(0x1000, 0x1000).unwrap();
        assert_eq!(r.entry_count(), 0);
    }

    #[test]
    fn is_pmem_spans_contiguous_entries() {
        let mut r = reg();
        r.register(0x1000, 0x1000, Path::new("a"), RangeKind::DevDax).unwrap();
        r.register(0x2000, 0x1000, Path::new("b"), RangeKind::MapSync).unwrap();
        assert!(r.is_pmem(0x1800, 0x1000));
        assert!(r.is_pmem(0x1000, 0x2000));
    }

    #[test]
    fn is_pmem_rejects_gaps_and_regular() {
        let mut r = reg();
        r.register(0x1000, 0x1000, Path::new("a"), RangeKind::DevDax).unwrap();
        r.register(0x3000, 0x1000, Path::new("b"), RangeKind::DevDax).unwrap();
        assert!(!r.is_pmem(0x1000, 0x3000)); // hole at 0x2000

        r.register(0x2000, 0x1000, Path::new("c"), RangeKind::Regular).unwrap();
        assert!(!r.is_pmem(0x1000, 0x3000)); // Regular in the middle
        assert!(!r.is_pmem(0x0, 0x100)); // unknown origin
    }

    #[test]
    fn disjointness_is_preserved() {
        let mut r = reg();
        r.register(0x1000, 0x4000, Path::new("a"), RangeKind::MapSync).unwrap();
        r.unregister(0x2000, 0x1000).unwrap();
        r.register(0x2000, 0x800, Path::new("b"), RangeKind::MapSync).unwrap();
        assert_eq!(
            r.register(0x2400, 0x1000, Path::new("c"), RangeKind::MapSync),
            Err(Error::Overlap)
        );
    }
}
