//! Built-in observing rules.
//!
//! # Categories
//!
//! - **Constraint**: `sun-avoidance`, `alt-range`, `az-range`
//! - **Filter**: `min-duration`, `drift-mode`, `day-mod`
//! - **Plan construction**: `make-source-scan`
//!
//! Every rule is constructed from a JSON parameter object deserialized into
//! a typed config with unknown fields rejected.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{Rule, RuleParams, SunModel};
use crate::error::{Error, Result};
use crate::models::{seconds, Block, BlockKind, BlockTree, DriftMode, Pointing, TimeWindow};

fn parse<T: DeserializeOwned>(rule: &str, params: &RuleParams) -> Result<T> {
    serde_json::from_value(params.clone()).map_err(|e| Error::invalid_rule_params(rule, e))
}

/// Directions a block looks at: scan start and end of throw, or the
/// reference pointing of a source window.
fn directions(block: &Block) -> Vec<(f64, f64)> {
    match block.kind() {
        BlockKind::Scan(p) => vec![(p.az, p.alt), (p.az + p.throw, p.alt)],
        BlockKind::Source(w) => vec![(w.az, w.alt)],
        BlockKind::Iv | BlockKind::Maintenance => Vec::new(),
    }
}

// ======================== Constraint rules ========================

/// Sun avoidance parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SunAvoidanceParams {
    /// Minimum angular distance to the sun (deg).
    pub min_angle: f64,
    /// Time a direction must stay clear of the sun after a block ends (s).
    #[serde(default)]
    pub min_sun_time: f64,
}

/// Removes the parts of blocks that point too close to the sun.
///
/// Exclusion windows come from a [`SunModel`] and are extended backwards by
/// `min_sun_time`. A block crossing an exclusion is cut: a single remaining
/// piece keeps the block name, several pieces are named `<name>/<k>`.
/// Blocks without a pointing pass through.
#[derive(Debug, Clone)]
pub struct SunAvoidance {
    params: SunAvoidanceParams,
    model: Arc<dyn SunModel>,
}

impl SunAvoidance {
    /// Creates the rule.
    pub fn new(params: SunAvoidanceParams, model: Arc<dyn SunModel>) -> Self {
        Self { params, model }
    }

    /// Creates the rule from a parameter object.
    ///
    /// `min_sun_time` must be finite and non-negative.
    pub fn from_params(params: &RuleParams, model: Arc<dyn SunModel>) -> Result<Self> {
        let p: SunAvoidanceParams = parse("sun-avoidance", params)?;
        if !p.min_sun_time.is_finite() || p.min_sun_time < 0.0 {
            return Err(Error::invalid_rule_params(
                "sun-avoidance",
                format!("min_sun_time must be non-negative, got {}", p.min_sun_time),
            ));
        }
        Ok(Self::new(p, model))
    }

    /// Sun-safe pieces of `block`, in time order.
    pub fn safe_pieces(&self, block: &Block) -> Vec<Block> {
        let dirs = directions(block);
        if dirs.is_empty() {
            return vec![block.clone()];
        }

        let margin = seconds(self.params.min_sun_time);
        // margins past the calendar range saturate at its bounds
        let query_end = block
            .t1()
            .checked_add_signed(margin)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let query = TimeWindow::new(block.t0(), query_end);
        let mut exclusions: Vec<TimeWindow> = dirs
            .iter()
            .flat_map(|&(az, alt)| {
                self.model
                    .exclusion_windows(az, alt, &query, self.params.min_angle)
            })
            .map(|w| {
                let start = w.t0.checked_sub_signed(margin).unwrap_or(DateTime::<Utc>::MIN_UTC);
                TimeWindow::new(start, w.t1)
            })
            .filter(|w| w.overlaps(&block.window()))
            .collect();
        if exclusions.is_empty() {
            return vec![block.clone()];
        }
        exclusions.sort_by_key(|w| w.t0);

        let mut free = Vec::new();
        let mut cursor = block.t0();
        for w in &exclusions {
            if w.t0 > cursor {
                free.push(TimeWindow::new(cursor, w.t0.min(block.t1())));
            }
            cursor = cursor.max(w.t1);
            if cursor >= block.t1() {
                break;
            }
        }
        if cursor < block.t1() {
            free.push(TimeWindow::new(cursor, block.t1()));
        }

        let pieces: Vec<Block> = free
            .iter()
            .filter_map(|w| block.clipped(w))
            .collect();
        if pieces.len() <= 1 {
            return pieces;
        }
        pieces
            .iter()
            .enumerate()
            .map(|(k, b)| b.with_name(format!("{}/{}", block.name(), k)))
            .collect()
    }

    /// Whether the rule leaves `block` unchanged.
    pub fn is_safe(&self, block: &Block) -> bool {
        matches!(self.safe_pieces(block).as_slice(), [only] if only == block)
    }
}

impl Rule for SunAvoidance {
    fn name(&self) -> &'static str {
        "sun-avoidance"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.flat_map(&mut |b: &Block| self.safe_pieces(b))
    }

    fn description(&self) -> &'static str {
        "Cut blocks pointing within min_angle of the sun"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AltRangeParams {
    alt_range: [f64; 2],
}

/// Drops pointed blocks whose altitude lies outside `[lo, hi]`.
#[derive(Debug, Clone, Copy)]
pub struct AltRange {
    lo: f64,
    hi: f64,
}

impl AltRange {
    /// Creates the rule.
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        let p: AltRangeParams = parse("alt-range", params)?;
        Ok(Self::new(p.alt_range[0], p.alt_range[1]))
    }
}

impl Rule for AltRange {
    fn name(&self) -> &'static str {
        "alt-range"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.filter(|b| {
            directions(b)
                .iter()
                .all(|&(_, alt)| alt >= self.lo && alt <= self.hi)
        })
    }

    fn description(&self) -> &'static str {
        "Altitude range"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct AzRangeParams {
    az_range: [f64; 2],
}

/// Drops pointed blocks whose azimuth span leaves `[lo, hi]`.
#[derive(Debug, Clone, Copy)]
pub struct AzRange {
    lo: f64,
    hi: f64,
}

impl AzRange {
    /// Creates the rule.
    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        let p: AzRangeParams = parse("az-range", params)?;
        Ok(Self::new(p.az_range[0], p.az_range[1]))
    }
}

impl Rule for AzRange {
    fn name(&self) -> &'static str {
        "az-range"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.filter(|b| {
            directions(b)
                .iter()
                .all(|&(az, _)| az >= self.lo && az <= self.hi)
        })
    }

    fn description(&self) -> &'static str {
        "Azimuth range"
    }
}

// ======================== Filter rules ========================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MinDurationParams {
    min_duration: f64,
}

/// Drops blocks shorter than a minimum duration.
#[derive(Debug, Clone, Copy)]
pub struct MinDuration {
    min: Duration,
}

impl MinDuration {
    /// Creates the rule with a minimum in seconds.
    pub fn new(min_duration_secs: f64) -> Self {
        Self {
            min: seconds(min_duration_secs),
        }
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        let p: MinDurationParams = parse("min-duration", params)?;
        Ok(Self::new(p.min_duration))
    }
}

impl Rule for MinDuration {
    fn name(&self) -> &'static str {
        "min-duration"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.filter(|b| b.duration() >= self.min)
    }

    fn description(&self) -> &'static str {
        "Minimum block duration"
    }
}

/// Which source windows `drift-mode` keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftFilter {
    Rising,
    Setting,
    Both,
}

impl DriftFilter {
    fn accepts(self, mode: DriftMode) -> bool {
        match self {
            DriftFilter::Both => true,
            DriftFilter::Rising => mode == DriftMode::Rising,
            DriftFilter::Setting => mode == DriftMode::Setting,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DriftModeParams {
    mode: DriftFilter,
}

/// Keeps source windows of the requested drift mode.
#[derive(Debug, Clone, Copy)]
pub struct DriftModeRule {
    mode: DriftFilter,
}

impl DriftModeRule {
    /// Creates the rule.
    pub fn new(mode: DriftFilter) -> Self {
        Self { mode }
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        let p: DriftModeParams = parse("drift-mode", params)?;
        Ok(Self::new(p.mode))
    }
}

impl Rule for DriftModeRule {
    fn name(&self) -> &'static str {
        "drift-mode"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.filter(|b| match b.kind() {
            BlockKind::Source(w) => self.mode.accepts(w.mode),
            _ => true,
        })
    }

    fn description(&self) -> &'static str {
        "Rising / setting source windows"
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DayModParams {
    day: i64,
    day_mod: i64,
    day_ref: DateTime<Utc>,
}

/// Keeps blocks starting on every `day_mod`-th day, offset by `day`.
///
/// A block is kept when `(whole days from day_ref to t0) mod day_mod == day`.
#[derive(Debug, Clone, Copy)]
pub struct DayMod {
    day: i64,
    day_mod: i64,
    day_ref: DateTime<Utc>,
}

impl DayMod {
    /// Creates the rule. `day_mod` must be positive.
    pub fn new(day: i64, day_mod: i64, day_ref: DateTime<Utc>) -> Result<Self> {
        if day_mod <= 0 {
            return Err(Error::invalid_rule_params("day-mod", "day_mod must be positive"));
        }
        Ok(Self {
            day,
            day_mod,
            day_ref,
        })
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        let p: DayModParams = parse("day-mod", params)?;
        Self::new(p.day, p.day_mod, p.day_ref)
    }

    fn keeps(&self, t: DateTime<Utc>) -> bool {
        let days = (t - self.day_ref).num_seconds().div_euclid(86_400);
        days.rem_euclid(self.day_mod) == self.day
    }
}

impl Rule for DayMod {
    fn name(&self) -> &'static str {
        "day-mod"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        tree.filter(|b| self.keeps(b.t0()))
    }

    fn description(&self) -> &'static str {
        "Observe every n-th day"
    }
}

// ======================== Plan construction ========================

/// Source scan planning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MakeSourceScanParams {
    /// Azimuth throw of the planned scans (deg).
    #[serde(default)]
    pub throw: f64,
    /// Upper bound of the random start delay (s).
    #[serde(default)]
    pub max_phase_shift: f64,
    /// Seed for the start delays.
    #[serde(default)]
    pub rng_seed: u64,
    /// Boresight rotation of the planned scans (deg).
    #[serde(default)]
    pub boresight_rot: Option<f64>,
}

/// Turns source visibility windows into calibration scans.
///
/// Each scan starts at the window start delayed by a random phase shift in
/// `[0, max_phase_shift)`, drawn from a generator seeded with `rng_seed`
/// and consumed in traversal order, so the same seed plans the same scans.
/// The scan points at the window's reference direction, gets subtype `cal`
/// and the source name appended to its tag. Other blocks pass through.
#[derive(Debug, Clone)]
pub struct MakeSourceScan {
    params: MakeSourceScanParams,
}

impl MakeSourceScan {
    /// Creates the rule.
    pub fn new(params: MakeSourceScanParams) -> Self {
        Self { params }
    }

    /// Creates the rule from a parameter object.
    pub fn from_params(params: &RuleParams) -> Result<Self> {
        Ok(Self::new(parse("make-source-scan", params)?))
    }
}

impl Rule for MakeSourceScan {
    fn name(&self) -> &'static str {
        "make-source-scan"
    }

    fn apply(&self, tree: &BlockTree) -> BlockTree {
        let mut rng = StdRng::seed_from_u64(self.params.rng_seed);
        tree.map(|b| {
            let BlockKind::Source(window) = b.kind() else {
                return b.clone();
            };
            let shift = if self.params.max_phase_shift > 0.0 {
                seconds(rng.random_range(0.0..self.params.max_phase_shift)).min(b.duration())
            } else {
                Duration::zero()
            };
            let mut pointing = Pointing::new(window.az, window.alt, self.params.throw);
            if let Some(rot) = self.params.boresight_rot {
                pointing = pointing.with_boresight_rot(rot);
            }
            let source = window.source.clone();
            // shift is clamped to the duration, so the interval stays valid
            b.with_interval(b.t0() + shift, b.t1())
                .unwrap_or_else(|_| b.clone())
                .with_kind(BlockKind::Scan(pointing))
                .with_subtype("cal")
                .append_tag(&source)
        })
    }

    fn description(&self) -> &'static str {
        "Plan calibration scans from source windows"
    }
}
