//! Round-robin conflict resolution between competing candidate sequences.
//!
//! # Algorithm
//!
//! Candidates are visited in priority order, one cursor each. The block
//! under the current cursor is accepted iff it does not overlap anything
//! accepted so far and the optional sun rule leaves it unchanged.
//!
//! - Accept: emit its value counterpart, advance the cursor, rotate to the
//!   next candidate.
//! - Reject: advance the cursor only; the same candidate tries again.
//! - Exhausted candidates are rotated past.
//!
//! Every step advances one cursor or rotates past an exhausted candidate,
//! so resolution terminates after at most `total blocks + candidates`
//! visits per emitted block. Greedy, no backtracking.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::models::tree::has_overlap_with;
use crate::models::{Block, BlockTree};
use crate::rules::Rule;

/// Why a candidate block was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    /// Overlaps an already accepted block.
    Overlap,
    /// Changed by the sun-avoidance rule.
    SunAvoidance,
}

/// A candidate block the resolver turned down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// Index of the candidate sequence.
    pub candidate: usize,
    /// The rejected (value) block.
    pub block: Block,
    /// Reason.
    pub reason: RejectionReason,
}

/// Round-robin resolver over candidate sequences.
///
/// Query blocks decide acceptance; value blocks are what gets emitted.
/// Without explicit values the queries are emitted.
///
/// # Example
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use skysched::models::Block;
/// use skysched::policy::RoundRobin;
///
/// let t = |h: i64| Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(h);
/// let b = |name: &str, s, e| Block::maintenance(name, t(s), t(e)).unwrap();
///
/// let resolved: Vec<Block> =
///     RoundRobin::new(vec![vec![b("a", 1, 2), b("b", 3, 4)], vec![b("c", 5, 6)]]).collect();
/// let names: Vec<&str> = resolved.iter().map(|b| b.name()).collect();
/// assert_eq!(names, vec!["a", "c", "b"]);
/// ```
#[derive(Debug, Clone)]
pub struct RoundRobin {
    queries: Vec<Vec<Block>>,
    values: Vec<Vec<Block>>,
    sun: Option<Arc<dyn Rule>>,
    cursors: Vec<usize>,
    current: usize,
    accepted: Vec<Block>,
    rejections: Vec<Rejection>,
}

impl RoundRobin {
    /// Creates a resolver over `queries`, in priority order.
    pub fn new(queries: Vec<Vec<Block>>) -> Self {
        let cursors = vec![0; queries.len()];
        Self {
            queries,
            values: Vec::new(),
            sun: None,
            cursors,
            current: 0,
            accepted: Vec::new(),
            rejections: Vec::new(),
        }
    }

    /// Sets the value sequences emitted in place of the queries.
    ///
    /// # Errors
    /// [`Error::ValueLengthMismatch`] unless every query sequence has a
    /// value sequence of the same length.
    pub fn with_values(mut self, values: Vec<Vec<Block>>) -> Result<Self> {
        let n = self.queries.len().max(values.len());
        for candidate in 0..n {
            let queries = self.queries.get(candidate).map_or(0, Vec::len);
            let given = values.get(candidate).map_or(0, Vec::len);
            if queries != given || candidate >= values.len() || candidate >= self.queries.len() {
                return Err(Error::ValueLengthMismatch {
                    candidate,
                    queries,
                    values: given,
                });
            }
        }
        self.values = values;
        Ok(self)
    }

    /// Sets the sun-avoidance rule every accepted block must survive.
    pub fn with_sun_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.sun = Some(rule);
        self
    }

    /// Query blocks accepted so far.
    pub fn accepted(&self) -> &[Block] {
        &self.accepted
    }

    /// Rejections so far.
    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    /// Runs to completion, returning emitted blocks and rejections.
    pub fn resolve(mut self) -> (Vec<Block>, Vec<Rejection>) {
        let emitted: Vec<Block> = self.by_ref().collect();
        (emitted, self.rejections)
    }

    fn exhausted(&self) -> bool {
        self.cursors
            .iter()
            .zip(&self.queries)
            .all(|(&c, q)| c >= q.len())
    }

    fn rotate(&mut self) {
        self.current = (self.current + 1) % self.queries.len();
    }

    fn survives_sun(&self, block: &Block) -> bool {
        match &self.sun {
            Some(rule) => {
                let leaf = BlockTree::Leaf(block.clone());
                rule.apply(&leaf) == leaf
            }
            None => true,
        }
    }

    fn reject(&mut self, candidate: usize, block: Block, reason: RejectionReason) {
        info!(
            block = block.name(),
            candidate,
            ?reason,
            "calibration block rejected"
        );
        self.rejections.push(Rejection {
            candidate,
            block,
            reason,
        });
    }
}

impl Iterator for RoundRobin {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        loop {
            if self.exhausted() {
                return None;
            }
            let i = self.current;
            let cursor = self.cursors[i];
            let Some(query) = self.queries[i].get(cursor).cloned() else {
                self.rotate();
                continue;
            };
            // value lengths match the queries (checked in with_values)
            let value = match self.values.get(i) {
                Some(values) => values[cursor].clone(),
                None => query.clone(),
            };
            self.cursors[i] += 1;

            if has_overlap_with(&self.accepted, &query) {
                self.reject(i, value, RejectionReason::Overlap);
                continue;
            }
            if !self.survives_sun(&query) {
                self.reject(i, value, RejectionReason::SunAvoidance);
                continue;
            }

            self.accepted.push(query);
            self.rotate();
            return Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::builtin::SunAvoidanceParams;
    use crate::rules::{StaticSunModel, SunAvoidance};
    use crate::models::{Pointing, TimeWindow};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    /// A block spanning `[s, e]` in units of 100 s.
    fn b(s: i64, e: i64) -> Block {
        Block::scan(
            format!("{s}-{e}"),
            t(s * 100),
            t(e * 100),
            Pointing::new(100.0, 50.0, 10.0),
        )
        .unwrap()
    }

    fn spans(blocks: &[Block]) -> Vec<(i64, i64)> {
        blocks
            .iter()
            .map(|blk| ((blk.t0() - t(0)).num_seconds() / 100, (blk.t1() - t(0)).num_seconds() / 100))
            .collect()
    }

    #[test]
    fn test_interleaves_candidates() {
        let out: Vec<Block> = RoundRobin::new(vec![vec![b(1, 2), b(3, 4)], vec![b(5, 6)]]).collect();
        assert_eq!(spans(&out), vec![(1, 2), (5, 6), (3, 4)]);
    }

    #[test]
    fn test_values_emitted_for_queries() {
        let resolver = RoundRobin::new(vec![vec![b(1, 3), b(2, 4)], vec![b(6, 7)]])
            .with_values(vec![vec![b(10, 15), b(20, 25)], vec![b(30, 35)]])
            .unwrap();
        let (out, rejections) = resolver.resolve();
        assert_eq!(spans(&out), vec![(10, 15), (30, 35)]);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason, RejectionReason::Overlap);
        assert_eq!(spans(&[rejections[0].block.clone()]), vec![(20, 25)]);
    }

    #[test]
    fn test_short_value_sequence_rejected() {
        let err = RoundRobin::new(vec![vec![b(1, 3), b(2, 4)], vec![b(6, 7)]])
            .with_values(vec![vec![b(10, 15)], vec![b(30, 35)]])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ValueLengthMismatch {
                candidate: 0,
                queries: 2,
                values: 1
            }
        ));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_value_sequence_rejected() {
        let err = RoundRobin::new(vec![vec![b(1, 3)], vec![b(6, 7)]])
            .with_values(vec![vec![b(10, 15)]])
            .unwrap_err();
        assert!(matches!(err, Error::ValueLengthMismatch { candidate: 1, .. }));

        // an empty candidate still needs its (empty) value sequence
        let err = RoundRobin::new(vec![vec![b(1, 3)], Vec::new()])
            .with_values(vec![vec![b(10, 15)]])
            .unwrap_err();
        assert!(matches!(err, Error::ValueLengthMismatch { candidate: 1, .. }));
    }

    #[test]
    fn test_sun_rejection_retries_same_candidate() {
        // sun exclusion cuts [1,3] but leaves [2,4] and [6,7] alone
        let model = StaticSunModel::new(vec![TimeWindow::new(t(50), t(150))]);
        let sun = SunAvoidance::new(
            SunAvoidanceParams {
                min_angle: 45.0,
                min_sun_time: 0.0,
            },
            Arc::new(model),
        );
        let resolver = RoundRobin::new(vec![vec![b(1, 3), b(2, 4)], vec![b(6, 7)]])
            .with_values(vec![vec![b(10, 15), b(20, 25)], vec![b(30, 35)]])
            .unwrap()
            .with_sun_rule(Arc::new(sun));
        let (out, rejections) = resolver.resolve();
        assert_eq!(spans(&out), vec![(20, 25), (30, 35)]);
        assert_eq!(rejections[0].reason, RejectionReason::SunAvoidance);
    }

    #[test]
    fn test_touching_blocks_both_accepted() {
        let out: Vec<Block> = RoundRobin::new(vec![vec![b(1, 2)], vec![b(2, 3)]]).collect();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(RoundRobin::new(Vec::new()).count(), 0);
        assert_eq!(RoundRobin::new(vec![Vec::new(), Vec::new()]).count(), 0);
    }

    #[test]
    fn test_exhausted_candidate_rotated_past() {
        let out: Vec<Block> =
            RoundRobin::new(vec![vec![b(1, 2)], vec![b(3, 4), b(5, 6), b(7, 8)]]).collect();
        assert_eq!(spans(&out), vec![(1, 2), (3, 4), (5, 6), (7, 8)]);
    }

    fn arb_seqs() -> impl Strategy<Value = Vec<Vec<Block>>> {
        prop::collection::vec(
            prop::collection::vec((0i64..50, 1i64..10), 0..8).prop_map(|spans| {
                spans
                    .into_iter()
                    .map(|(s, d)| b(s, s + d))
                    .collect::<Vec<_>>()
            }),
            0..5,
        )
    }

    proptest! {
        #[test]
        fn prop_output_never_overlaps(seqs in arb_seqs()) {
            let out: Vec<Block> = RoundRobin::new(seqs).collect();
            for (i, x) in out.iter().enumerate() {
                for y in &out[i + 1..] {
                    prop_assert!(!x.overlaps(y));
                }
            }
        }

        #[test]
        fn prop_deterministic(seqs in arb_seqs()) {
            let a: Vec<Block> = RoundRobin::new(seqs.clone()).collect();
            let c: Vec<Block> = RoundRobin::new(seqs).collect();
            prop_assert_eq!(a, c);
        }

        #[test]
        fn prop_every_block_accounted(seqs in arb_seqs()) {
            let total: usize = seqs.iter().map(Vec::len).sum();
            let (out, rejections) = RoundRobin::new(seqs).resolve();
            prop_assert_eq!(out.len() + rejections.len(), total);
        }
    }
}
