/// Deterministic RNG: xoshiro256** seeded through hash64.
///
/// Sub-nanosecond per draw, period 2^256 - 1 excluding the all-zero state;
/// the seeding path guarantees a non-zero state. Seed 0 asks the kernel for
/// entropy, falling back to the pid on ancient kernels.
use rand_core::{impls, RngCore};

/// A u64 -> u64 mix (splitmix64 finalizer).
pub fn hash64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[derive(Debug, Clone)]
pub struct Xoshiro256 {
    s: [u64; 4],
}

impl Xoshiro256 {
    /// Seed of 0 means random.
    pub fn new(seed: u64) -> Self {
        if seed == 0 {
            let mut s = [0u64; 4];
            if getrandom_state(&mut s) {
                return Xoshiro256 { s };
            }
            return Self::new_deterministic(unsafe { libc::getpid() } as u64);
        }
        Self::new_deterministic(seed)
    }

    fn new_deterministic(seed: u64) -> Self {
        let mut s = [0u64; 4];
        s[0] = hash64(seed);
        s[1] = hash64(s[0]);
        s[2] = hash64(s[1]);
        s[3] = hash64(s[2]);
        Xoshiro256 { s }
    }

    pub fn next(&mut self) -> u64 {
        let s = &mut self.s;
        let result = s[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);
        let t = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];

        s[2] ^= t;
        s[3] = s[3].rotate_left(45);

        result
    }
}

impl RngCore for Xoshiro256 {
    fn next_u32(&mut self) -> u32 {
        self.next() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> core::result::Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Fill the RNG state from getrandom(2). We want getentropy() but older
/// glibc lacks it, so go through the raw syscall like the state is small
/// enough to never short-read.
fn getrandom_state(s: &mut [u64; 4]) -> bool {
    let len = core::mem::size_of_val(s);
    let ret = unsafe { libc::syscall(libc::SYS_getrandom, s.as_mut_ptr() as *mut libc::c_void, len, 0) };
    ret == len as i64 && s.iter().any(|&w| w != 0)
}

/// A fresh version-4 UUID.
pub fn uuid_generate(rng: &mut Xoshiro256) -> [u8; 16] {
    let mut uuid = [0u8; 16];
    rng.fill_bytes(&mut uuid);
    uuid[6] = (uuid[6] & 0x0f) | 0x40; // version 4
    uuid[8] = (uuid[8] & 0x3f) | 0x80; // RFC 4122 variant
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Xoshiro256::new(42);
        let mut b = Xoshiro256::new(42);
        for _ in 0..64 {
            assert_eq!(a.next(), b.next());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Xoshiro256::new(1);
        let mut b = Xoshiro256::new(2);
        let same = (0..64).filter(|_| a.next() == b.next()).count();
        assert_eq!(same, 0);
    }

    #[test]
    fn seeded_state_is_never_zero() {
        for seed in [1u64, 0xdead_beef, u64::MAX] {
            let rng = Xoshiro256::new(seed);
            assert!(rng.s.iter().any(|&w| w != 0));
        }
    }

    #[test]
    fn entropy_seeding_works() {
        let mut a = Xoshiro256::new(0);
        let mut b = Xoshiro256::new(0);
        // Two entropy-seeded generators colliding would mean getrandom
        // returned identical state twice.
        assert_ne!(a.next(), b.next());
    }

    #[test]
    fn uuid_has_version_and_variant_bits() {
        let mut rng = Xoshiro256::new(7);
        let uuid = uuid_generate(&mut rng);
        assert_eq!(uuid[6] >> 4, 4);
        assert_eq!(uuid[8] >> 6, 0b10);
    }

    #[test]
    fn fill_bytes_covers_partial_words() {
        let mut rng = Xoshiro256::new(3);
        let mut buf = [0u8; 13];
        rng.fill_bytes(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
