//! Run summary metrics.
//!
//! Computes timeline indicators from a completed sequencing run.
//!
//! # Metrics
//!
//! | Metric | Definition |
//! |--------|-----------|
//! | Span | First operation start to last operation end |
//! | Observing time | Time spent in scan operations |
//! | Setup time | Time spent in any other operation |
//! | Idle time | Time spent in `wait-until` |
//! | Efficiency | Observing time / span |

use std::collections::BTreeMap;

use serde::Serialize;

use super::SequenceOutcome;

/// Timeline indicators of a run. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// First start to last end (s).
    pub span_secs: f64,
    /// Time in scan operations (s).
    pub observing_secs: f64,
    /// Time in setup operations (s).
    pub setup_secs: f64,
    /// Time waiting for blocks to start (s).
    pub idle_secs: f64,
    /// Observing time / span (0.0..1.0).
    pub efficiency: f64,
    /// Number of blocks sequenced.
    pub blocks_sequenced: usize,
    /// Number of blocks skipped.
    pub blocks_skipped: usize,
    /// Operation count per name.
    pub operation_counts: BTreeMap<String, usize>,
}

fn secs(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

impl RunSummary {
    /// Computes the summary of `outcome`.
    pub fn calculate(outcome: &SequenceOutcome) -> Self {
        let mut observing = 0.0;
        let mut setup = 0.0;
        let mut idle = 0.0;
        let mut operation_counts = BTreeMap::new();

        for op in &outcome.operations {
            let d = secs(op.duration());
            match op.name.as_str() {
                "cmb-scan" | "source-scan" => observing += d,
                "wait-until" => idle += d,
                _ => setup += d,
            }
            *operation_counts.entry(op.name.clone()).or_insert(0) += 1;
        }

        let start = outcome.operations.iter().map(|op| op.start).min();
        let span_secs = match (start, outcome.end_time()) {
            (Some(s), Some(e)) => secs(e - s),
            _ => 0.0,
        };
        let efficiency = if span_secs > 0.0 {
            observing / span_secs
        } else {
            0.0
        };

        Self {
            span_secs,
            observing_secs: observing,
            setup_secs: setup,
            idle_secs: idle,
            efficiency,
            blocks_sequenced: outcome.sequenced_blocks().len(),
            blocks_skipped: outcome.skipped.len(),
            operation_counts,
        }
    }

    /// Whether the run meets the given quality thresholds.
    pub fn meets_thresholds(&self, min_efficiency: f64, max_skipped: usize) -> bool {
        self.efficiency >= min_efficiency && self.blocks_skipped <= max_skipped
    }
}
