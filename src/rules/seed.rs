//! Deterministic seeds for random rules.
//!
//! Random rules never read entropy from the environment. The scheduling
//! date is turned into a daily key (`YYYYMMDD`), which seeds a generator
//! that hands out one sub-seed per consumer. Re-running the same day gives
//! the same plan.

use chrono::{DateTime, Datelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::models::Block;

/// Seed derived from a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DailyKey(u64);

impl DailyKey {
    /// Key for the UTC date of `t`.
    pub fn for_time(t: DateTime<Utc>) -> Self {
        let date = t.date_naive();
        let key = date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64;
        Self(key.unsigned_abs())
    }

    /// Key for the date of the earliest block, if any.
    pub fn for_blocks(blocks: &[Block]) -> Option<Self> {
        blocks.iter().map(Block::t0).min().map(Self::for_time)
    }

    /// Raw seed value.
    pub fn seed(&self) -> u64 {
        self.0
    }

    /// Splits the key into `n` independent sub-seeds.
    pub fn split(&self, n: usize) -> Vec<u64> {
        let mut rng = StdRng::seed_from_u64(self.0);
        (0..n).map(|_| rng.random::<u64>()).collect()
    }
}
