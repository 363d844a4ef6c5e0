//! Weighted length distributions.
//!
//! A `WeightedDist` assigns seeded, biased probabilities to every value in an
//! integer interval. The table construction is fully determined by a 32-byte
//! seed, so a bridge can dictate a client's padding distribution with a
//! single message, while the draws themselves use high-entropy randomness so
//! that the sampler's output sequence is not itself a distinguisher.

use crate::crypto::drbg::{HashDrbg, Seed};
use crate::crypto::random::SecureRandom;

/// A weighted distribution over the integers in `[min, max]`.
#[derive(Debug)]
pub struct WeightedDist {
    min: usize,
    max: usize,

    // Deterministic under the seed: a permutation of the bucket indices and
    // their probabilities.
    values: Vec<usize>,
    probs: Vec<f64>,
}

impl WeightedDist {
    /// Create a distribution of values ranging from `min` to `max` based on
    /// a generator seeded with `seed`.
    ///
    /// # Panics
    ///
    /// Panics unless `min < max`.
    pub fn new(seed: &Seed, min: usize, max: usize) -> Self {
        assert!(min < max, "WeightedDist: min >= max ({}, {})", min, max);

        let mut dist = Self {
            min,
            max,
            values: Vec::new(),
            probs: Vec::new(),
        };
        dist.reset(seed);
        dist
    }

    /// Regenerate the tables with the same interval from a new seed.
    pub fn reset(&mut self, seed: &Seed) {
        let mut drbg = HashDrbg::new(seed);
        let n = (self.max + 1) - self.min;

        let values = drbg.perm(n);

        // Biased probabilities: each bucket claims a random share of the
        // remaining mass, the final bucket takes whatever is left.
        let mut probs = Vec::with_capacity(n);
        let mut total = 0.0f64;
        for i in 0..n {
            let p = if i == n - 1 {
                1.0 - total
            } else {
                drbg.float64() * (1.0 - total)
            };
            probs.push(p);
            total += p;
        }

        self.values = values;
        self.probs = probs;
    }

    /// Sample a value according to the distribution.
    ///
    /// The draw comes from the OS CSPRNG, not the seeded generator.
    pub fn sample(&self) -> usize {
        let target = SecureRandom::float64();

        let mut cumulative = 0.0f64;
        let mut idx = self.values.len() - 1;
        for (i, p) in self.probs.iter().enumerate() {
            cumulative += p;
            if target <= cumulative {
                idx = i;
                break;
            }
        }

        self.min + self.values[idx]
    }
}

impl PartialEq for WeightedDist {
    /// Two distributions compare equal when they were built over the same
    /// interval from the same seed.
    fn eq(&self, other: &Self) -> bool {
        self.min == other.min
            && self.max == other.max
            && self.values == other.values
            && self.probs == other.probs
    }
}
