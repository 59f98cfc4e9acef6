//! Minimal PCG32 random number generator.
//!
//! Used for connection-id generation in the transport. Connection ids must be
//! hard to guess (the handshake echoes them as a weak authenticity check) but
//! have no cryptographic requirements, so a small statistically good PRNG is
//! enough and keeps `rand` out of the dependency tree.
//!
//! Reference: <https://www.pcg-random.org/>

/// Default increment for single-stream PCG32, from the PCG paper.
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// Standard multiplier for 64-bit state PCG.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG32 random number generator (PCG-XSH-RR, 64-bit state, 32-bit output).
///
/// Not cryptographically secure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator seeded from a single `u64`.
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        let mut rng = Pcg32 {
            state: 0,
            inc: PCG_DEFAULT_INCREMENT | 1,
        };
        // Standard PCG initialization: advance once, add seed, advance again.
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Returns the next 32-bit value.
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Returns a value uniformly distributed in `[low, high)`.
    ///
    /// Uses rejection sampling so the result is unbiased. `low` must be less
    /// than `high`; an empty range returns `low`.
    pub fn gen_range_u32(&mut self, low: u32, high: u32) -> u32 {
        if low >= high {
            return low;
        }
        let span = high - low;
        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return low + (value % span);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..16).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 16);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(7);
        for _ in 0..1000 {
            let v = rng.gen_range_u32(1000, 2000);
            assert!((1000..2000).contains(&v));
        }
    }

    #[test]
    fn gen_range_empty_returns_low() {
        let mut rng = Pcg32::seed_from_u64(7);
        assert_eq!(rng.gen_range_u32(5, 5), 5);
        assert_eq!(rng.gen_range_u32(9, 3), 9);
    }
}
