//! A seedless hasher for values every peer must hash identically.
//!
//! `std`'s `DefaultHasher` is randomly seeded per process, so two peers hashing the same
//! state would disagree. [`DeterministicHasher`] is 64-bit FNV-1a with the standard offset
//! basis and prime. It is not collision resistant against an adversary.
//!
//! ```
//! use lockstep_rollback::hash::{fnv1a_bytes, DeterministicHasher};
//! use std::hash::Hasher;
//!
//! let mut hasher = DeterministicHasher::new();
//! hasher.write(b"left");
//! assert_eq!(hasher.finish(), fnv1a_bytes(b"left"));
//! ```

use std::hash::Hasher;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// 64-bit FNV-1a.
#[derive(Debug, Clone)]
pub struct DeterministicHasher {
    state: u64,
}

impl DeterministicHasher {
    /// A hasher that has consumed no bytes.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
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
        self.state = bytes.iter().fold(self.state, |acc, &byte| {
            (acc ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        });
    }
}

/// Hashes raw bytes, bypassing `Hash` (which would prefix slices with their length).
#[inline]
#[must_use]
pub fn fnv1a_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = DeterministicHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn matches_published_fnv1a_vectors() {
        assert_eq!(fnv1a_bytes(b""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a_bytes(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_bytes(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn split_writes_equal_one_write() {
        let mut split = DeterministicHasher::new();
        split.write(b"foo");
        split.write(b"bar");
        assert_eq!(split.finish(), fnv1a_bytes(b"foobar"));
    }
}
