/// General utilities: the Fletcher64 header checksum, alignment math and
/// the cached system page size.
use spin::Once;

/// Cache line size on x86-64 and aarch64.
pub const CACHELINE_SIZE: usize = 64;

static PAGE_SIZE: Once<usize> = Once::new();

/// System page size, queried once.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Alignment of file-backed mappings. Part sizes are rounded down to this.
pub fn mmap_align() -> usize {
    page_size()
}

#[inline]
pub fn is_pow2(x: usize) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

#[inline]
pub fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align));
    x & !(align - 1)
}

#[inline]
pub fn align_up(x: usize, align: usize) -> usize {
    debug_assert!(is_pow2(align));
    (x + align - 1) & !(align - 1)
}

/// Compute the Fletcher64 checksum of `data`, treating the 8 bytes at
/// `csum_off` as zero. Input is read as little-endian u32 words, so the
/// result is the same on every host for a given on-disk image.
///
/// `data.len()` and `csum_off` must be multiples of 4.
pub fn checksum_compute(data: &[u8], csum_off: usize) -> u64 {
    debug_assert!(data.len() % 4 == 0);
    debug_assert!(csum_off % 4 == 0 && csum_off + 8 <= data.len());

    let mut lo32: u32 = 0;
    let mut hi32: u32 = 0;

    let mut off = 0;
    while off < data.len() {
        if off == csum_off {
            // Both 32-bit halves of the checksum slot count as zero.
            hi32 = hi32.wrapping_add(lo32);
            hi32 = hi32.wrapping_add(lo32);
            off += 8;
            continue;
        }
        let word = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
        lo32 = lo32.wrapping_add(word);
        hi32 = hi32.wrapping_add(lo32);
        off += 4;
    }

    (hi32 as u64) << 32 | lo32 as u64
}

/// Insert (`insert == true`) or verify the Fletcher64 checksum stored
/// little-endian at `csum_off`. Returns true when inserting, or the
/// verification result.
pub fn checksum(data: &mut [u8], csum_off: usize, insert: bool) -> bool {
    let csum = checksum_compute(data, csum_off);

    if insert {
        data[csum_off..csum_off + 8].copy_from_slice(&csum.to_le_bytes());
        return true;
    }

    let stored = u64::from_le_bytes(data[csum_off..csum_off + 8].try_into().unwrap());
    stored == csum
}
