//! Operation sequencing.
//!
//! Turns a sorted, non-overlapping block sequence into a timeline of
//! hardware operations, tracking the instrument state across blocks and
//! dropping blocks whose setup no longer fits.
//!
//! # Phases
//!
//! | Phase | Runs |
//! |-------|------|
//! | pre-session | once, before the first block |
//! | pre-block | before each block, counted as setup time |
//! | in-block | first matching scan operation, until the block ends |
//! | post-block | after each block |
//! | post-session | once, after the last block |

mod engine;
mod operation;
mod outcome;
mod summary;

pub use engine::Sequencer;
pub use operation::{Operation, OperationSpec, SchedPhase};
pub use outcome::{SequenceOutcome, SkippedBlock, TimedOperation};
pub use summary::RunSummary;

impl SequenceOutcome {
    /// Computes the run summary.
    pub fn summary(&self) -> RunSummary {
        RunSummary::calculate(self)
    }
}
