//! Handshake replay detection.
//!
//! `ReplayFilter` answers one question: has this byte sequence been seen
//! before? It stores SipHash-2-4 digests under a random per-startup key, so
//! collisions are possible and are deliberately treated as replays; at
//! 64-bit digests the false-positive rate is negligible next to the cost of
//! accepting a replayed handshake.
//!
//! Entries only need to live as long as the handshake MAC they guard: the
//! MAC embeds an hour-resolution timestamp accepted with ±1 hour of skew, so
//! anything older than 2 hours is dead weight and is evicted.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hasher;

use parking_lot::Mutex;
use siphasher::sip::SipHasher24;

use crate::crypto::random::SecureRandom;

/// Maximum number of entries the filter retains.
///
/// The busiest known bridges process on the order of thousands of
/// connections per day, and no entry lives longer than 2 hours, so this is
/// generous.
const MAX_FILTER_SIZE: usize = 100 * 1024;

/// Entries older than this are purged (handshake epoch tolerance ±1 h).
const ENTRY_TTL_SECS: i64 = 3600 * 2;

struct Inner {
    filter: HashMap<u64, i64>,
    fifo: VecDeque<(u64, i64)>,
}

/// An approximate set of recently seen handshake digests.
pub struct ReplayFilter {
    k0: u64,
    k1: u64,
    inner: Mutex<Inner>,
}

impl ReplayFilter {
    /// Create a new filter keyed with fresh randomness.
    pub fn new() -> Self {
        Self {
            k0: SecureRandom::u64(),
            k1: SecureRandom::u64(),
            inner: Mutex::new(Inner {
                filter: HashMap::new(),
                fifo: VecDeque::new(),
            }),
        }
    }

    /// Query the filter for `buf`, inserting it if absent.
    ///
    /// Returns true when the sequence (or a colliding digest) was already
    /// present. `now` is seconds since the UNIX epoch. The test-and-set is
    /// atomic; the filter is safe to share across connections.
    pub fn test_and_set(&self, now: i64, buf: &[u8]) -> bool {
        let mut sip = SipHasher24::new_with_keys(self.k0, self.k1);
        sip.write(buf);
        let hash = sip.finish();

        let mut inner = self.inner.lock();
        Self::compact(&mut inner, now);

        if inner.filter.contains_key(&hash) {
            return true;
        }

        inner.filter.insert(hash, now);
        inner.fifo.push_back((hash, now));
        false
    }

    /// Purge entries that are too old to be relevant. When the filter is at
    /// capacity, force-purge from the head regardless of age.
    fn compact(inner: &mut Inner, now: i64) {
        while let Some(&(hash, first_seen)) = inner.fifo.front() {
            if inner.fifo.len() < MAX_FILTER_SIZE {
                let delta = now - first_seen;
                if delta < 0 {
                    // The system time jumped backwards, potentially by a
                    // lot. Eviction ordering is meaningless now; jettison
                    // the entire filter.
                    inner.filter.clear();
                    inner.fifo.clear();
                    return;
                }
                if delta < ENTRY_TTL_SECS {
                    break;
                }
            }
            inner.fifo.pop_front();
            inner.filter.remove(&hash);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().fifo.len()
    }
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::new()
    }
}
