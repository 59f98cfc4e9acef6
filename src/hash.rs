//! Deterministic hashing for desync detection.
//!
//! Lockstep peers exchange state hashes to detect divergence, so every peer
//! must compute the exact same hash for the same state. The std
//! `DefaultHasher` is randomly seeded per process and therefore unusable here;
//! this module provides FNV-1a, which is fixed, fast and portable.
//!
//! FNV-1a is not cryptographically secure. For comparing simulation states
//! between trusting peers, it does not need to be.

use std::hash::{Hash, Hasher};

/// FNV-1a 64-bit offset basis constant.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime constant.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// A deterministic [`Hasher`] using the FNV-1a algorithm.
///
/// Produces identical results across processes, platforms and runs.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// Creates a hasher with the standard FNV-1a offset basis.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        DeterministicHasher {
            state: FNV_OFFSET_BASIS,
        }
    }
}

impl Default for DeterministicHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for DeterministicHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Hashes any `Hash` value deterministically.
#[must_use]
pub fn fnv1a_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DeterministicHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hashes a raw byte slice deterministically.
#[must_use]
pub fn fnv1a_hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_same_hash() {
        assert_eq!(fnv1a_hash(&"state"), fnv1a_hash(&"state"));
        assert_eq!(fnv1a_hash_bytes(b"abc"), fnv1a_hash_bytes(b"abc"));
    }

    #[test]
    fn different_input_different_hash() {
        assert_ne!(fnv1a_hash_bytes(b"abc"), fnv1a_hash_bytes(b"abd"));
    }

    #[test]
    fn empty_input_is_offset_basis() {
        assert_eq!(fnv1a_hash_bytes(&[]), FNV_OFFSET_BASIS);
    }

    #[test]
    fn known_vector() {
        // FNV-1a("a") reference value.
        assert_eq!(fnv1a_hash_bytes(b"a"), 0xaf63dc4c8601ec8c);
    }
}
