//! Observing policies.
//!
//! A policy turns raw block trees into a sorted, non-overlapping block
//! sequence in two phases:
//!
//! - **transform**: rule chains that keep the tree structure (so the
//!   intermediate result can still be inspected per source / category)
//! - **merge**: flatten, interleave, sequence-level rules, final sort
//!
//! # Policies
//!
//! | Policy | Description |
//! |--------|-------------|
//! | [`BasicPolicy`] | Master schedule plus seeded calibration scans |
//! | [`SatPolicy`] | Calibration targets resolved round-robin, full operation table |

pub mod basic;
pub mod resolver;
pub mod sat;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Block, BlockTree};
use crate::rules::Rule;

pub use basic::BasicPolicy;
pub use resolver::{Rejection, RejectionReason, RoundRobin};
pub use sat::{CalTarget, SatPolicy};

/// Result of applying a policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    /// Final sequence, sorted by start time.
    pub blocks: Vec<Block>,
    /// Candidates turned down during conflict resolution.
    pub rejections: Vec<Rejection>,
}

/// Policies address parts of the tree by group key; a bare sequence has
/// none and would be dropped by the first keyed insert.
pub(crate) fn check_layout(tree: &BlockTree) -> Result<()> {
    match tree {
        BlockTree::Group(_) | BlockTree::Empty => Ok(()),
        BlockTree::Leaf(_) | BlockTree::List(_) => Err(Error::UnsupportedLayout(
            "blocks must be keyed by category, got a bare sequence".into(),
        )),
    }
}

/// Two-phase block-tree policy.
pub trait Policy {
    /// Structure-preserving phase. Also returns the conflict rejections it
    /// recorded.
    fn transform(&self, tree: BlockTree) -> Result<(BlockTree, Vec<Rejection>)>;

    /// Flattening phase.
    fn merge(&self, tree: BlockTree) -> Result<Vec<Block>>;

    /// Runs `transform` then `merge`.
    fn apply(&self, tree: BlockTree) -> Result<Plan> {
        let (tree, rejections) = self.transform(tree)?;
        Ok(Plan {
            blocks: self.merge(tree)?,
            rejections,
        })
    }
}

/// Source of raw block trees.
///
/// Implemented by the ephemeris and schedule-file collaborators.
pub trait SequenceLoader {
    /// Visibility windows of `source` within `[t0, t1]`.
    fn source_windows(&self, source: &str, t0: DateTime<Utc>, t1: DateTime<Utc>)
        -> Result<BlockTree>;

    /// Blocks parsed from a master schedule file.
    fn master_schedule(&self, path: &str) -> Result<BlockTree>;
}

/// An ordered chain of rules applied left to right.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use skysched::policy::RuleChain;
/// use skysched::rules::MinDuration;
///
/// let chain = RuleChain::new().with_rule(Arc::new(MinDuration::new(600.0)));
/// assert_eq!(chain.names(), vec!["min-duration"]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleChain {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule.
    pub fn with_rule(mut self, rule: Arc<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Appends a rule in place.
    pub fn push(&mut self, rule: Arc<dyn Rule>) {
        self.rules.push(rule);
    }

    /// Applies every rule in order.
    pub fn apply(&self, tree: &BlockTree) -> BlockTree {
        self.rules
            .iter()
            .fold(tree.clone(), |acc, rule| rule.apply(&acc))
    }

    /// Rule names, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Strategy for resolving conflicts between calibration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CalibrationPolicy {
    /// Cycle through targets in priority order.
    #[default]
    RoundRobin,
}

impl CalibrationPolicy {
    /// Configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationPolicy::RoundRobin => "round-robin",
        }
    }
}

impl FromStr for CalibrationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "round-robin" => Ok(CalibrationPolicy::RoundRobin),
            other => Err(Error::UnsupportedCalibrationPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for CalibrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
