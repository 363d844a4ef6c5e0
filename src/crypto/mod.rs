//! Cryptographic primitives for obfs4.
//!
//! This module provides:
//! - The ntor key agreement over Elligator2-obfuscated Curve25519
//! - A SipHash-2-4/OFB deterministic generator for seeded distributions
//! - Secure random number generation
//!
//! All secret material is zeroized on drop to prevent memory leakage.

pub mod drbg;
pub mod ntor;
pub mod random;

pub use drbg::{HashDrbg, Seed, SEED_LENGTH};
pub use ntor::{Auth, Keypair, KeySeed, NodeID, PublicKey, Representative};
pub use random::SecureRandom;
