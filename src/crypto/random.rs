//! Secure random number generation.
//!
//! Provides cryptographically secure randomness using the operating system's
//! entropy source. Only the operations the protocol actually needs are
//! exported; there is no seedable generator to misuse.

use rand::{rngs::OsRng, Rng, RngCore};

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u64.
    pub fn u64() -> u64 {
        OsRng.next_u64()
    }

    /// Generate a uniformly distributed integer in `[min, max]`, inclusive on
    /// both ends.
    ///
    /// # Panics
    ///
    /// Panics if `max < min`.
    pub fn int_in_range(min: usize, max: usize) -> usize {
        assert!(min <= max, "int_in_range: min > max ({}, {})", min, max);
        OsRng.gen_range(min..=max)
    }

    /// Generate a random f64 in `[0.0, 1.0)` with 53 bits of precision.
    pub fn float64() -> f64 {
        (OsRng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
