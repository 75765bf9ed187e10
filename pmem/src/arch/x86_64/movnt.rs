/// Non-temporal memcpy/memset.
///
/// Copies stream whole cache lines past the CPU cache: an unaligned prefix
/// of up to 63 bytes goes through ordinary stores plus flush so the main
/// loop starts cache-line-aligned at the destination, the body runs in
/// 16x/8x/4x/2x/1x 64-byte blocks of streaming stores, power-of-two tails
/// (32/16/8/4) use a single streaming store of that width, and anything
/// else falls back to ordinary stores plus flush. The backward variant
/// covers overlapping moves with dst above src.
///
/// A trailing sfence is emitted only when the drain stage will not issue
/// one (i.e. the selected flush instruction serializes itself).
use core::arch::x86_64::*;
use core::ptr;

use crate::arch::PersistOps;
use crate::persist::MemFlags;
use crate::util::CACHELINE_SIZE;

/// Ordinary (temporal) copy of a short chunk, optionally flushed.
/// Overlap-safe.
#[inline]
unsafe fn copy_small(ops: &PersistOps, dst: *mut u8, src: *const u8, len: usize, flush: bool) {
    ptr::copy(src, dst, len);
    if flush {
        (ops.flush)(dst as *const u8, len);
    }
}

#[inline]
unsafe fn set_small(ops: &PersistOps, dst: *mut u8, c: u8, len: usize, flush: bool) {
    ptr::write_bytes(dst, c, len);
    if flush {
        (ops.flush)(dst as *const u8, len);
    }
}

#[inline]
unsafe fn copy_flush(ops: &PersistOps, dst: *mut u8, src: *const u8, len: usize) {
    ptr::copy(src, dst, len);
    (ops.flush)(dst as *const u8, len);
}

#[inline]
unsafe fn set_flush(ops: &PersistOps, dst: *mut u8, c: u8, len: usize) {
    ptr::write_bytes(dst, c, len);
    (ops.flush)(dst as *const u8, len);
}

// ---- power-of-two tails, shared by every ISA (dst is line-aligned) ----

#[inline]
unsafe fn movnt1x32b(dst: *mut u8, src: *const u8) {
    let d = dst as *mut __m128i;
    let s = src as *const __m128i;
    _mm_stream_si128(d, _mm_loadu_si128(s));
    _mm_stream_si128(d.add(1), _mm_loadu_si128(s.add(1)));
}

#[inline]
unsafe fn movnt1x16b(dst: *mut u8, src: *const u8) {
    _mm_stream_si128(dst as *mut __m128i, _mm_loadu_si128(src as *const __m128i));
}

#[inline]
unsafe fn movnt1x8b(dst: *mut u8, src: *const u8) {
    _mm_stream_si64(dst as *mut i64, ptr::read_unaligned(src as *const i64));
}

#[inline]
unsafe fn movnt1x4b(dst: *mut u8, src: *const u8) {
    _mm_stream_si32(dst as *mut i32, ptr::read_unaligned(src as *const i32));
}

/// There is no point in more than one nt store for a partial cache line:
/// pow2 tails get one store of the right width, the rest goes temporal.
#[inline]
unsafe fn movnt_tail_fw(ops: &PersistOps, dst: *mut u8, src: *const u8, len: usize) {
    match len {
        0 => {}
        32 => movnt1x32b(dst, src),
        16 => movnt1x16b(dst, src),
        8 => movnt1x8b(dst, src),
        4 => movnt1x4b(dst, src),
        _ => copy_small(ops, dst, src, len, true),
    }
}

#[inline]
unsafe fn movnt_tail_bw(ops: &PersistOps, dst: *mut u8, src: *const u8, len: usize) {
    match len {
        0 => {}
        32 => movnt1x32b(dst.sub(32), src.sub(32)),
        16 => movnt1x16b(dst.sub(16), src.sub(16)),
        8 => movnt1x8b(dst.sub(8), src.sub(8)),
        4 => movnt1x4b(dst.sub(4), src.sub(4)),
        _ => copy_small(ops, dst.sub(len), src.sub(len), len, true),
    }
}

#[inline]
unsafe fn memset_tail(ops: &PersistOps, dst: *mut u8, c: u8, len: usize) {
    match len {
        0 => {}
        32 => {
            let v = _mm_set1_epi8(c as i8);
            let d = dst as *mut __m128i;
            _mm_stream_si128(d, v);
            _mm_stream_si128(d.add(1), v);
        }
        16 => _mm_stream_si128(dst as *mut __m128i, _mm_set1_epi8(c as i8)),
        8 => _mm_stream_si64(dst as *mut i64, i64::from_ne_bytes([c; 8])),
        4 => _mm_stream_si32(dst as *mut i32, i32::from_ne_bytes([c; 4])),
        _ => set_small(ops, dst, c, len, true),
    }
}

// ---- per-ISA streaming blocks ----

mod sse2 {
    use core::arch::x86_64::*;

    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn movnt_lines(dst: *mut u8, src: *const u8, lines: usize) {
        let d = dst as *mut __m128i;
        let s = src as *const __m128i;
        for i in 0..4 * lines {
            _mm_stream_si128(d.add(i), _mm_loadu_si128(s.add(i)));
        }
    }

    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn memset_lines(dst: *mut u8, c: u8, lines: usize) {
        let v = _mm_set1_epi8(c as i8);
        let d = dst as *mut __m128i;
        for i in 0..4 * lines {
            _mm_stream_si128(d.add(i), v);
        }
    }

    #[target_feature(enable = "sse2")]
    pub(super) unsafe fn cleanup() {}
}

mod avx {
    use core::arch::x86_64::*;

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn movnt_lines(dst: *mut u8, src: *const u8, lines: usize) {
        let d = dst as *mut __m256i;
        let s = src as *const __m256i;
        for i in 0..2 * lines {
            _mm256_stream_si256(d.add(i), _mm256_loadu_si256(s.add(i)));
        }
    }

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn memset_lines(dst: *mut u8, c: u8, lines: usize) {
        let v = _mm256_set1_epi8(c as i8);
        let d = dst as *mut __m256i;
        for i in 0..2 * lines {
            _mm256_stream_si256(d.add(i), v);
        }
    }

    #[target_feature(enable = "avx")]
    pub(super) unsafe fn cleanup() {
        _mm256_zeroupper();
    }
}

mod avx512f {
    use core::arch::x86_64::*;

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn movnt_lines(dst: *mut u8, src: *const u8, lines: usize) {
        for i in 0..lines {
            let zmm = _mm512_loadu_si512(src.add(64 * i).cast());
            _mm512_stream_si512(dst.add(64 * i).cast(), zmm);
        }
    }

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn memset_lines(dst: *mut u8, c: u8, lines: usize) {
        let v = _mm512_set1_epi32(i32::from_ne_bytes([c; 4]));
        for i in 0..lines {
            _mm512_stream_si512(dst.add(64 * i).cast(), v);
        }
    }

    #[target_feature(enable = "avx512f")]
    pub(super) unsafe fn cleanup() {
        _mm256_zeroupper();
    }
}

// ---- drivers, one set per ISA ----

macro_rules! movnt_variant {
    ($feat:literal, $isa:ident, $fw:ident, $bw:ident, $movnt:ident, $memset:ident,
     $nodrain_move:ident, $nodrain_set:ident) => {
        #[target_feature(enable = $feat)]
        unsafe fn $fw(ops: &PersistOps, mut dst: *mut u8, mut src: *const u8, mut len: usize) {
            let head = dst as usize & (CACHELINE_SIZE - 1);
            if head > 0 {
                let cnt = (CACHELINE_SIZE - head).min(len);
                copy_small(ops, dst, src, cnt, true);
                dst = dst.add(cnt);
                src = src.add(cnt);
                len -= cnt;
            }

            while len >= 16 * CACHELINE_SIZE {
                $isa::movnt_lines(dst, src, 16);
                dst = dst.add(16 * CACHELINE_SIZE);
                src = src.add(16 * CACHELINE_SIZE);
                len -= 16 * CACHELINE_SIZE;
                if len > 0 && ops.wc_barrier {
                    _mm_sfence();
                }
            }
            if len >= 8 * CACHELINE_SIZE {
                $isa::movnt_lines(dst, src, 8);
                dst = dst.add(8 * CACHELINE_SIZE);
                src = src.add(8 * CACHELINE_SIZE);
                len -= 8 * CACHELINE_SIZE;
            }
            if len >= 4 * CACHELINE_SIZE {
                $isa::movnt_lines(dst, src, 4);
                dst = dst.add(4 * CACHELINE_SIZE);
                src = src.add(4 * CACHELINE_SIZE);
                len -= 4 * CACHELINE_SIZE;
            }
            if len >= 2 * CACHELINE_SIZE {
                $isa::movnt_lines(dst, src, 2);
                dst = dst.add(2 * CACHELINE_SIZE);
                src = src.add(2 * CACHELINE_SIZE);
                len -= 2 * CACHELINE_SIZE;
            }
            if len >= CACHELINE_SIZE {
                $isa::movnt_lines(dst, src, 1);
                dst = dst.add(CACHELINE_SIZE);
                src = src.add(CACHELINE_SIZE);
                len -= CACHELINE_SIZE;
            }

            movnt_tail_fw(ops, dst, src, len);
            $isa::cleanup();
        }

        #[target_feature(enable = $feat)]
        unsafe fn $bw(ops: &PersistOps, dst: *mut u8, src: *const u8, mut len: usize) {
            let mut dst = dst.add(len);
            let mut src = src.add(len);

            let head = dst as usize & (CACHELINE_SIZE - 1);
            if head > 0 {
                let cnt = head.min(len);
                dst = dst.sub(cnt);
                src = src.sub(cnt);
                len -= cnt;
                copy_small(ops, dst, src, cnt, true);
            }

            while len >= 16 * CACHELINE_SIZE {
                dst = dst.sub(16 * CACHELINE_SIZE);
                src = src.sub(16 * CACHELINE_SIZE);
                len -= 16 * CACHELINE_SIZE;
                $isa::movnt_lines(dst, src, 16);
                if len > 0 && ops.wc_barrier {
                    _mm_sfence();
                }
            }
            if len >= 8 * CACHELINE_SIZE {
                dst = dst.sub(8 * CACHELINE_SIZE);
                src = src.sub(8 * CACHELINE_SIZE);
                len -= 8 * CACHELINE_SIZE;
                $isa::movnt_lines(dst, src, 8);
            }
            if len >= 4 * CACHELINE_SIZE {
                dst = dst.sub(4 * CACHELINE_SIZE);
                src = src.sub(4 * CACHELINE_SIZE);
                len -= 4 * CACHELINE_SIZE;
                $isa::movnt_lines(dst, src, 4);
            }
            if len >= 2 * CACHELINE_SIZE {
                dst = dst.sub(2 * CACHELINE_SIZE);
                src = src.sub(2 * CACHELINE_SIZE);
                len -= 2 * CACHELINE_SIZE;
                $isa::movnt_lines(dst, src, 2);
            }
            if len >= CACHELINE_SIZE {
                dst = dst.sub(CACHELINE_SIZE);
                src = src.sub(CACHELINE_SIZE);
                len -= CACHELINE_SIZE;
                $isa::movnt_lines(dst, src, 1);
            }

            movnt_tail_bw(ops, dst, src, len);
            $isa::cleanup();
        }

        unsafe fn $movnt(ops: &PersistOps, dst: *mut u8, src: *const u8, len: usize) {
            if (dst as usize).wrapping_sub(src as usize) >= len {
                $fw(ops, dst, src, len);
            } else {
                $bw(ops, dst, src, len);
            }
            if ops.flush_has_builtin_fence {
                _mm_sfence();
            }
        }

        #[target_feature(enable = $feat)]
        unsafe fn $memset(ops: &PersistOps, mut dst: *mut u8, c: u8, mut len: usize) {
            let head = dst as usize & (CACHELINE_SIZE - 1);
            if head > 0 {
                let cnt = (CACHELINE_SIZE - head).min(len);
                set_small(ops, dst, c, cnt, true);
                dst = dst.add(cnt);
                len -= cnt;
            }

            while len >= 16 * CACHELINE_SIZE {
                $isa::memset_lines(dst, c, 16);
                dst = dst.add(16 * CACHELINE_SIZE);
                len -= 16 * CACHELINE_SIZE;
                if len > 0 && ops.wc_barrier {
                    _mm_sfence();
                }
            }
            if len >= 8 * CACHELINE_SIZE {
                $isa::memset_lines(dst, c, 8);
                dst = dst.add(8 * CACHELINE_SIZE);
                len -= 8 * CACHELINE_SIZE;
            }
            if len >= 4 * CACHELINE_SIZE {
                $isa::memset_lines(dst, c, 4);
                dst = dst.add(4 * CACHELINE_SIZE);
                len -= 4 * CACHELINE_SIZE;
            }
            if len >= 2 * CACHELINE_SIZE {
                $isa::memset_lines(dst, c, 2);
                dst = dst.add(2 * CACHELINE_SIZE);
                len -= 2 * CACHELINE_SIZE;
            }
            if len >= CACHELINE_SIZE {
                $isa::memset_lines(dst, c, 1);
                dst = dst.add(CACHELINE_SIZE);
                len -= CACHELINE_SIZE;
            }

            memset_tail(ops, dst, c, len);
            $isa::cleanup();
        }

        pub unsafe fn $nodrain_move(
            ops: &PersistOps,
            dst: *mut u8,
            src: *const u8,
            len: usize,
            flags: MemFlags,
        ) -> *mut u8 {
            if len == 0 || core::ptr::eq(dst.cast_const(), src) {
                return dst;
            }
            if flags.contains(MemFlags::NOFLUSH) {
                ptr::copy(src, dst, len);
            } else if flags.intersects(MemFlags::NONTEMPORAL | MemFlags::WC) {
                $movnt(ops, dst, src, len);
            } else if flags.intersects(MemFlags::TEMPORAL | MemFlags::WB) {
                copy_flush(ops, dst, src, len);
            } else if ops.flush_is_noop || len < ops.movnt_threshold {
                copy_flush(ops, dst, src, len);
            } else {
                $movnt(ops, dst, src, len);
            }
            dst
        }

        pub unsafe fn $nodrain_set(
            ops: &PersistOps,
            dst: *mut u8,
            c: u8,
            len: usize,
            flags: MemFlags,
        ) -> *mut u8 {
            if len == 0 {
                return dst;
            }
            if flags.contains(MemFlags::NOFLUSH) {
                ptr::write_bytes(dst, c, len);
            } else if flags.intersects(MemFlags::NONTEMPORAL | MemFlags::WC) {
                $memset(ops, dst, c, len);
                if ops.flush_has_builtin_fence {
                    _mm_sfence();
                }
            } else if flags.intersects(MemFlags::TEMPORAL | MemFlags::WB) {
                set_flush(ops, dst, c, len);
            } else if ops.flush_is_noop || len < ops.movnt_threshold {
                set_flush(ops, dst, c, len);
            } else {
                $memset(ops, dst, c, len);
                if ops.flush_has_builtin_fence {
                    _mm_sfence();
                }
            }
            dst
        }
    };
}

movnt_variant!(
    "sse2",
    sse2,
    memmove_movnt_fw_sse2,
    memmove_movnt_bw_sse2,
    memmove_movnt_sse2,
    memset_movnt_sse2,
    memmove_nodrain_sse2,
    memset_nodrain_sse2
);

movnt_variant!(
    "avx",
    avx,
    memmove_movnt_fw_avx,
    memmove_movnt_bw_avx,
    memmove_movnt_avx,
    memset_movnt_avx,
    memmove_nodrain_avx,
    memset_nodrain_avx
);

movnt_variant!(
    "avx512f",
    avx512f,
    memmove_movnt_fw_avx512f,
    memmove_movnt_bw_avx512f,
    memmove_movnt_avx512f,
    memset_movnt_avx512f,
    memmove_nodrain_avx512f,
    memset_nodrain_avx512f
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::init_from_config;
    use crate::config::PersistConfig;

    fn test_ops() -> PersistOps {
        init_from_config(&PersistConfig::default())
    }

    fn pattern(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
    }

    #[test]
    fn streaming_copy_matches_reference_across_alignments() {
        let ops = test_ops();
        let flags = MemFlags::NONTEMPORAL;

        for &len in &[1usize, 63, 64, 65, 127, 128, 4096, 4097] {
            for d_off in (0..64).step_by(4) {
                for s_off in (0..64).step_by(4) {
                    let src_buf = pattern(s_off + len, 7);
                    let mut dst_buf = vec![0u8; d_off + len];
                    unsafe {
                        (ops.memmove_nodrain)(
                            &ops,
                            dst_buf.as_mut_ptr().add(d_off),
                            src_buf.as_ptr().add(s_off),
                            len,
                            flags,
                        );
                        (ops.fence)();
                    }
                    assert_eq!(
                        &dst_buf[d_off..d_off + len],
                        &src_buf[s_off..s_off + len],
                        "len {} d_off {} s_off {}",
                        len,
                        d_off,
                        s_off
                    );
                }
            }
        }
    }

    #[test]
    fn streaming_copy_handles_large_buffers() {
        let ops = test_ops();
        for &len in &[1048575usize, 1048576] {
            let src_buf = pattern(len + 8, 3);
            let mut dst_buf = vec![0u8; len + 8];
            unsafe {
                (ops.memmove_nodrain)(
                    &ops,
                    dst_buf.as_mut_ptr().add(8),
                    src_buf.as_ptr().add(4),
                    len,
                    MemFlags::NONTEMPORAL,
                );
                (ops.fence)();
            }
            assert_eq!(&dst_buf[8..8 + len], &src_buf[4..4 + len]);
        }
    }

    #[test]
    fn overlapping_moves_both_directions() {
        let ops = test_ops();
        for &len in &[200usize, 4096] {
            for &shift in &[1usize, 64, 100] {
                // dst above src
                let mut buf = pattern(len + shift, 9);
                let expect = buf[..len].to_vec();
                unsafe {
                    let base = buf.as_mut_ptr();
                    (ops.memmove_nodrain)(&ops, base.add(shift), base, len, MemFlags::NONTEMPORAL);
                    (ops.fence)();
                }
                assert_eq!(&buf[shift..shift + len], &expect[..], "fw len {} shift {}", len, shift);

                // dst below src
                let mut buf = pattern(len + shift, 11);
                let expect = buf[shift..shift + len].to_vec();
                unsafe {
                    let base = buf.as_mut_ptr();
                    (ops.memmove_nodrain)(&ops, base, base.add(shift), len, MemFlags::NONTEMPORAL);
                    (ops.fence)();
                }
                assert_eq!(&buf[..len], &expect[..], "bw len {} shift {}", len, shift);
            }
        }
    }

    #[test]
    fn streaming_memset_across_alignments() {
        let ops = test_ops();
        for &len in &[1usize, 63, 64, 65, 128, 4097] {
            for d_off in (0..64).step_by(4) {
                let mut dst_buf = vec![0u8; d_off + len + 8];
                unsafe {
                    (ops.memset_nodrain)(
                        &ops,
                        dst_buf.as_mut_ptr().add(d_off),
                        0x5a,
                        len,
                        MemFlags::NONTEMPORAL,
                    );
                    (ops.fence)();
                }
                assert!(dst_buf[..d_off].iter().all(|&b| b == 0));
                assert!(dst_buf[d_off..d_off + len].iter().all(|&b| b == 0x5a));
                assert!(dst_buf[d_off + len..].iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn noflush_leaves_plain_copy() {
        let ops = test_ops();
        let src_buf = pattern(300, 1);
        let mut dst_buf = vec![0u8; 300];
        unsafe {
            (ops.memmove_nodrain)(
                &ops,
                dst_buf.as_mut_ptr(),
                src_buf.as_ptr(),
                300,
                MemFlags::NOFLUSH,
            );
        }
        assert_eq!(dst_buf, src_buf);
    }

    #[test]
    fn temporal_flag_bypasses_the_threshold() {
        let ops = test_ops();
        let src_buf = pattern(8192, 5);
        let mut dst_buf = vec![0u8; 8192];
        unsafe {
            (ops.memmove_nodrain)(
                &ops,
                dst_buf.as_mut_ptr(),
                src_buf.as_ptr(),
                8192,
                MemFlags::TEMPORAL,
            );
            (ops.fence)();
        }
        assert_eq!(dst_buf, src_buf);
    }
}
