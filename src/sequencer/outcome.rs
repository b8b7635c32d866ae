//! Sequencing outcome model.
//!
//! The outcome of one run is the timeline of operations, the blocks that
//! could not be set up before their deadline, and the instrument state the
//! run ended in.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{seconds, Block, InstrumentState};

/// An operation placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimedOperation {
    /// Operation name (e.g. "det-setup").
    pub name: String,
    /// Start time.
    pub start: DateTime<Utc>,
    /// End time. `end - start` is the duration charged to the clock.
    pub end: DateTime<Utc>,
    /// Parameters handed to the renderer.
    pub params: Map<String, Value>,
    /// Block the operation belongs to; `None` for session operations.
    pub block: Option<String>,
}

impl TimedOperation {
    /// Duration charged to the clock.
    #[inline]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// A block dropped because its setup did not fit before the block ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedBlock {
    /// The dropped block.
    pub block: Block,
    /// Clock when the block came up.
    pub available_at: DateTime<Utc>,
    /// Setup time the block would have needed.
    pub setup_secs: f64,
}

impl SkippedBlock {
    /// Time the setup would have finished.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.available_at
            .checked_add_signed(seconds(self.setup_secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Result of one sequencing run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceOutcome {
    /// Operations in time order.
    pub operations: Vec<TimedOperation>,
    /// Blocks dropped as infeasible.
    pub skipped: Vec<SkippedBlock>,
    /// Instrument state at the end of the run.
    pub final_state: InstrumentState,
}

impl SequenceOutcome {
    /// Whether every block was sequenced.
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    /// End of the last operation, if any.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.operations.iter().map(|op| op.end).max()
    }

    /// Operations belonging to `block`.
    pub fn operations_for_block(&self, block: &str) -> Vec<&TimedOperation> {
        self.operations
            .iter()
            .filter(|op| op.block.as_deref() == Some(block))
            .collect()
    }

    /// Operations named `name`.
    pub fn operations_named(&self, name: &str) -> Vec<&TimedOperation> {
        self.operations.iter().filter(|op| op.name == name).collect()
    }

    /// Names of the blocks that were sequenced, in order.
    pub fn sequenced_blocks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for op in &self.operations {
            if let Some(b) = op.block.as_deref() {
                if names.last() != Some(&b) {
                    names.push(b);
                }
            }
        }
        names
    }
}
