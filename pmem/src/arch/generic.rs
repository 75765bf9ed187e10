/// Portable copy and set, used where streaming stores are unavailable
/// (aarch64, or NO_MOVNT on x86-64): ordinary stores followed by a cache
/// flush of the written range.
use core::ptr;

use crate::arch::PersistOps;
use crate::persist::MemFlags;

/// Word-at-a-time forward copy: byte head until the destination is 8-byte
/// aligned, u64 body, byte tail.
unsafe fn copy_words_fw(mut dst: *mut u8, mut src: *const u8, mut len: usize) {
    while len > 0 && dst as usize % 8 != 0 {
        *dst = *src;
        dst = dst.add(1);
        src = src.add(1);
        len -= 1;
    }

    while len >= 8 {
        let word = ptr::read_unaligned(src as *const u64);
        *(dst as *mut u64) = word;
        dst = dst.add(8);
        src = src.add(8);
        len -= 8;
    }

    while len > 0 {
        *dst = *src;
        dst = dst.add(1);
        src = src.add(1);
        len -= 1;
    }
}

unsafe fn copy_words_bw(dst: *mut u8, src: *const u8, mut len: usize) {
    let mut d = dst.add(len);
    let mut s = src.add(len);

    while len > 0 && d as usize % 8 != 0 {
        d = d.sub(1);
        s = s.sub(1);
        *d = *s;
        len -= 1;
    }

    while len >= 8 {
        d = d.sub(8);
        s = s.sub(8);
        let word = ptr::read_unaligned(s as *const u64);
        *(d as *mut u64) = word;
        len -= 8;
    }

    while len > 0 {
        d = d.sub(1);
        s = s.sub(1);
        *d = *s;
        len -= 1;
    }
}

pub unsafe fn memmove_nodrain(
    ops: &PersistOps,
    dst: *mut u8,
    src: *const u8,
    len: usize,
    flags: MemFlags,
) -> *mut u8 {
    if len == 0 || core::ptr::eq(dst as *const u8, src) {
        return dst;
    }

    if ops.generic_wordcopy {
        // Copy direction mirrors memmove: go backward when the ranges
        // overlap with dst above src.
        if (dst as usize).wrapping_sub(src as usize) >= len {
            copy_words_fw(dst, src, len);
        } else {
            copy_words_bw(dst, src, len);
        }
    } else {
        ptr::copy(src, dst, len);
    }

    if !flags.contains(MemFlags::NOFLUSH) {
        (ops.flush)(dst as *const u8, len);
    }
    dst
}

pub unsafe fn memset_nodrain(
    ops: &PersistOps,
    dst: *mut u8,
    c: u8,
    len: usize,
    flags: MemFlags,
) -> *mut u8 {
    if len == 0 {
        return dst;
    }

    if ops.generic_wordcopy {
        let mut d = dst;
        let mut n = len;
        while n > 0 && d as usize % 8 != 0 {
            *d = c;
            d = d.add(1);
            n -= 1;
        }
        let word = u64::from_ne_bytes([c; 8]);
        while n >= 8 {
            *(d as *mut u64) = word;
            d = d.add(8);
            n -= 8;
        }
        while n > 0 {
            *d = c;
            d = d.add(1);
            n -= 1;
        }
    } else {
        ptr::write_bytes(dst, c, len);
    }

    if !flags.contains(MemFlags::NOFLUSH) {
        (ops.flush)(dst as *const u8, len);
    }
    dst
}
