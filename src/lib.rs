//! Observation scheduling for a ground-based telescope.
//!
//! Builds a night's observing plan from nested block sequences (master
//! schedule scans, source visibility windows), then compiles the plan into
//! a timeline of hardware operations.
//!
//! # Modules
//!
//! - **`models`**: Domain types: `Block`, `BlockTree` and its algebra,
//!   `InstrumentState`
//! - **`rules`**: Named block transformations (`sun-avoidance`,
//!   `min-duration`, `make-source-scan`, ...) and their registry
//! - **`policy`**: Two-phase policies (`BasicPolicy`, `SatPolicy`) and the
//!   round-robin calibration resolver
//! - **`sequencer`**: Operation table compilation and block sequencing
//! - **`config`**: TOML / JSON policy configuration
//! - **`validation`**: Batch input checks (duplicate names, ordering,
//!   operation tables, rule parameters)
//!
//! # Pipeline
//!
//! ```text
//! SequenceLoader ─▶ init_seqs ─▶ transform ─▶ merge ─▶ Sequencer::run
//!                    (tree)       (tree)      (Vec)     (operations)
//! ```
//!
//! The library installs no `tracing` subscriber; callers choose one.

pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod rules;
pub mod sequencer;
pub mod validation;

pub use error::{Error, Result};
