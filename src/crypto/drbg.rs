//! Deterministic random bit generator.
//!
//! `HashDrbg` is SipHash-2-4 in OFB mode: the first 16 bytes of the seed key
//! the hash, the remaining 16 bytes are the initial OFB state. Each output
//! rekeys the state with its own digest, so two instances built from the same
//! seed produce identical streams. This is what lets a bridge dictate a
//! client's padding distribution with a single 32-byte message.
//!
//! The DRBG is not used for anything security critical; values that must be
//! unpredictable come from [`SecureRandom`](super::random::SecureRandom).

use std::hash::Hasher;

use base64::{engine::general_purpose::STANDARD, Engine};
use siphasher::sip::SipHasher24;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of a DRBG seed in bytes.
pub const SEED_LENGTH: usize = 32;

/// A 32-byte seed for the deterministic generator.
///
/// The seed splits into a 16-byte SipHash-2-4 key and 16 bytes of initial
/// OFB state.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; SEED_LENGTH]);

impl Seed {
    /// Generate a fresh random seed.
    pub fn generate() -> Self {
        Self(super::random::SecureRandom::bytes())
    }

    /// Create a seed from raw bytes. Fails unless exactly 32 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; SEED_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::arg(format!("invalid seed length: {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Create a seed from a standard base64 string.
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(s)
            .map_err(|e| Error::arg(format!("invalid base64 seed: {}", e)))?;
        Self::from_bytes(&raw)
    }

    /// Encode the seed as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Get the raw seed bytes.
    pub fn as_bytes(&self) -> &[u8; SEED_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print seed material.
        f.write_str("Seed(..)")
    }
}

/// SipHash-2-4 in OFB mode.
pub struct HashDrbg {
    k0: u64,
    k1: u64,
    // 16 bytes from the seed until the first update, 8 bytes thereafter.
    ofb: Vec<u8>,
}

impl HashDrbg {
    /// Create a new generator from a seed.
    pub fn new(seed: &Seed) -> Self {
        let raw = seed.as_bytes();
        Self {
            k0: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            k1: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            ofb: raw[16..32].to_vec(),
        }
    }

    /// Produce the next 64-bit output: OFB := SipHash(key, OFB).
    pub fn next_u64(&mut self) -> u64 {
        let mut sip = SipHasher24::new_with_keys(self.k0, self.k1);
        sip.write(&self.ofb);
        let digest = sip.finish();
        self.ofb = digest.to_be_bytes().to_vec();
        digest
    }

    /// Produce a non-negative 63-bit value.
    pub fn int63(&mut self) -> i64 {
        (self.next_u64() & 0x7fff_ffff_ffff_ffff) as i64
    }

    /// Produce an f64 in `[0.0, 1.0)` with 53 bits of precision.
    pub fn float64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Produce a uniformly distributed value in `[0, n)`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero.
    pub fn int_n(&mut self, n: usize) -> usize {
        assert!(n > 0, "int_n: n must be positive");
        let n = n as u64;
        // Rejection sampling keeps the output unbiased.
        let limit = u64::MAX - (u64::MAX % n);
        loop {
            let v = self.next_u64();
            if v < limit {
                return (v % n) as usize;
            }
        }
    }

    /// Produce a random permutation of `0..n`.
    pub fn perm(&mut self, n: usize) -> Vec<usize> {
        let mut out: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            let j = self.int_n(i + 1);
            out.swap(i, j);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_seed() -> Seed {
        Seed::from_bytes(&[
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b,
            0x1c, 0x1d, 0x1e, 0x1f,
        ])
        .unwrap()
    }

    #[test]
    fn test_seed_length() {
        assert!(Seed::from_bytes(&[0u8; 31]).is_err());
        assert!(Seed::from_bytes(&[0u8; 33]).is_err());
        assert!(Seed::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_seed_base64_roundtrip() {
        let seed = Seed::generate();
        let restored = Seed::from_base64(&seed.to_base64()).unwrap();
        assert_eq!(seed.as_bytes(), restored.as_bytes());

        assert!(Seed::from_base64("not base64 at all!").is_err());
    }

    #[test]
    fn test_drbg_determinism() {
        let seed = test_seed();
        let mut a = HashDrbg::new(&seed);
        let mut b = HashDrbg::new(&seed);

        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_drbg_seed_sensitivity() {
        let mut a = HashDrbg::new(&test_seed());
        let mut other = *test_seed().as_bytes();
        other[31] ^= 0x01;
        let mut b = HashDrbg::new(&Seed::from_bytes(&other).unwrap());

        // The streams diverge immediately.
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn test_int63_non_negative() {
        let mut drbg = HashDrbg::new(&test_seed());
        for _ in 0..1000 {
            assert!(drbg.int63() >= 0);
        }
    }

    #[test]
    fn test_int_n_bounds() {
        let mut drbg = HashDrbg::new(&test_seed());
        for _ in 0..1000 {
            assert!(drbg.int_n(7) < 7);
        }
    }

    #[test]
    fn test_perm_is_permutation() {
        let mut drbg = HashDrbg::new(&test_seed());
        let p = drbg.perm(100);

        let mut sorted = p.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());

        // Deterministic under the same seed.
        let mut drbg2 = HashDrbg::new(&test_seed());
        assert_eq!(p, drbg2.perm(100));
    }

    #[test]
    fn test_float64_bounds() {
        let mut drbg = HashDrbg::new(&test_seed());
        for _ in 0..1000 {
            let f = drbg.float64();
            assert!((0.0..1.0).contains(&f));
        }
    }
}
