//! Scheduling domain models.
//!
//! Provides the value types shared by rules, policies and the sequencer:
//! blocks, block trees (with the tree algebra), and the run-scoped
//! instrument state.
//!
//! # Domain Mappings
//!
//! | skysched | Meaning |
//! |----------|---------|
//! | Block | A pointing, calibration or maintenance window |
//! | BlockTree | Blocks grouped by source / category |
//! | InstrumentState | Telescope configuration during one run |

mod block;
mod state;
pub mod tree;

pub(crate) use block::seconds;
pub use block::{Block, BlockKind, DriftMode, Pointing, SourceWindow, TimeWindow};
pub use state::InstrumentState;
pub use tree::BlockTree;
