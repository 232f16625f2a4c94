//! Seeded random source for bandwidth draws.
//!
//! Training draws one bandwidth per batch on the root worker. Seeding that
//! draw makes a run reproducible; MT19937-64 gives the same sequence on every
//! platform for a given seed.

use rand_mt::Mt64;

/// Mersenne Twister seeded with `seed`.
pub fn seeded_rng(seed: u64) -> Mt64 {
    Mt64::new(seed)
}
