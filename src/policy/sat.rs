//! Production policy for a small-aperture telescope.
//!
//! # Pipeline
//!
//! 1. Sun avoidance on the calibration windows.
//! 2. Per calibration target, plan source scans from its windows with a
//!    seed split from the daily key, tag them, set their boresight.
//! 3. Resolve conflicts between targets with the configured calibration
//!    policy (optionally padding scans by an overlap buffer).
//! 4. Subtypes and tags: calibration scans get `cal`; baseline CMB scans
//!    get `cmb` and an `"<az>-<az+throw>"` tag; an optional scan tag is
//!    appended to the baseline.
//! 5. Merge baseline with calibration, drop short blocks, sort.
//!
//! The merged sequence is compiled into operations by
//! [`SatPolicy::build_operations`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{check_layout, CalibrationPolicy, Policy, Rejection, RoundRobin, SequenceLoader};
use crate::config::PolicyConfig;
use crate::error::{Error, Result};
use crate::models::tree::{merge, sort};
use crate::models::{seconds, Block, BlockTree, InstrumentState};
use crate::rules::{DailyKey, RuleRegistry};
use crate::sequencer::{OperationSpec, SchedPhase, SequenceOutcome, Sequencer};

/// A calibration source and how to observe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalTarget {
    /// Source name, a key of the `calibration` group.
    pub source: String,
    /// Tag appended to the planned scans.
    #[serde(default)]
    pub tag: String,
    /// Boresight rotation of the planned scans (deg).
    #[serde(default)]
    pub boresight_rot: Option<f64>,
}

impl CalTarget {
    /// Creates a target.
    pub fn new(source: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tag: tag.into(),
            boresight_rot: None,
        }
    }

    /// Sets the boresight rotation.
    pub fn with_boresight_rot(mut self, rot: f64) -> Self {
        self.boresight_rot = Some(rot);
        self
    }
}

/// Small-aperture telescope policy.
#[derive(Debug, Clone)]
pub struct SatPolicy {
    config: PolicyConfig,
    registry: RuleRegistry,
}

impl SatPolicy {
    /// Creates a policy.
    pub fn new(config: PolicyConfig, registry: RuleRegistry) -> Self {
        Self { config, registry }
    }

    /// Creates a policy from a TOML document.
    pub fn from_toml_str(s: &str, registry: RuleRegistry) -> Result<Self> {
        Ok(Self::new(PolicyConfig::from_toml_str(s)?, registry))
    }

    /// Configuration.
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Adds a calibration target at lowest priority.
    pub fn add_cal_target(&mut self, target: CalTarget) {
        self.config.cal_targets.push(target);
    }

    /// Builds the raw block tree for `[t0, t1]`.
    ///
    /// Calibration targets missing from the configured layout are loaded
    /// as well. The tree is trimmed to the window and empty markers are
    /// dropped.
    pub fn init_seqs(
        &self,
        loader: &dyn SequenceLoader,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<BlockTree> {
        let mut tree = self.config.blocks.load(loader, t0, t1)?;
        check_layout(&tree)?;

        if !self.config.cal_targets.is_empty() {
            let mut calibration = tree.take("calibration").unwrap_or_else(BlockTree::group);
            for target in &self.config.cal_targets {
                if calibration.get(&target.source).is_none() {
                    let windows = loader.source_windows(&target.source, t0, t1)?;
                    calibration.insert(target.source.clone(), windows);
                }
            }
            tree.insert("calibration", calibration);
        }

        let tree = tree.trim(t0, t1).drop_empty();

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        tree.for_each(|b| *counts.entry(b.kind().name()).or_insert(0) += 1);
        info!(?counts, "blocks initialized");

        Ok(tree)
    }

    /// Instrument state at the start of a run.
    pub fn init_state(&self, t0: DateTime<Utc>) -> InstrumentState {
        InstrumentState::new(t0).with_pointing(180.0, 60.0)
    }

    /// Operation table with policy-level defaults filled in.
    ///
    /// An empty configured table is replaced by [`default_operations`].
    pub fn operation_specs(&self) -> Vec<OperationSpec> {
        if self.config.operations.is_empty() {
            return default_operations(&self.config);
        }
        self.config
            .operations
            .iter()
            .cloned()
            .map(|mut spec| {
                match spec.name.as_str() {
                    "set-scan-params" => {
                        spec.params
                            .entry("az_speed")
                            .or_insert(json!(self.config.az_speed));
                        spec.params
                            .entry("az_accel")
                            .or_insert(json!(self.config.az_accel));
                    }
                    "setup-boresight" => {
                        spec.params
                            .entry("apply_boresight_rot")
                            .or_insert(json!(self.config.apply_boresight_rot));
                    }
                    "det-setup" | "hwp-spin-up" | "hwp-spin-down" => {
                        spec.params
                            .entry("disable_hwp")
                            .or_insert(json!(self.config.disable_hwp));
                    }
                    _ => {}
                }
                spec
            })
            .collect()
    }

    /// Compiles a merged sequence into timed operations, starting at `t0`.
    pub fn build_operations(&self, seq: &[Block], t0: DateTime<Utc>) -> Result<SequenceOutcome> {
        Sequencer::new(&self.operation_specs())?.run(seq, self.init_state(t0))
    }

    fn plan_calibration(&self, calibration: &BlockTree) -> Result<Vec<Vec<Block>>> {
        let targets = &self.config.cal_targets;
        let seeds = DailyKey::for_blocks(&calibration.flatten())
            .map(|key| key.split(targets.len()))
            .unwrap_or_else(|| vec![0; targets.len()]);

        let mut planned = Vec::with_capacity(targets.len());
        for (target, seed) in targets.iter().zip(seeds) {
            let windows = calibration
                .get(&target.source)
                .ok_or_else(|| Error::UnknownSource(target.source.clone()))?;

            let mut overrides = json!({ "rng_seed": seed });
            if let Some(rot) = target.boresight_rot {
                overrides["boresight_rot"] = json!(rot);
            }
            let planner =
                self.registry
                    .build(&self.config.rules, "make-source-scan", Some(&overrides))?;

            let mut scans = planner.apply(windows);
            if !target.tag.is_empty() {
                scans = scans.map(|b| b.append_tag(&target.tag));
            }
            planned.push(scans.sorted());
        }
        Ok(planned)
    }

    fn pad(&self, seqs: &[Vec<Block>]) -> Result<Vec<Vec<Block>>> {
        let buffer = seconds(self.config.overlap_buffer.max(0.0));
        seqs.iter()
            .map(|seq| {
                seq.iter()
                    .map(|b| {
                        let t0 = b.t0().checked_sub_signed(buffer).unwrap_or(DateTime::<Utc>::MIN_UTC);
                        let t1 = b.t1().checked_add_signed(buffer).unwrap_or(DateTime::<Utc>::MAX_UTC);
                        b.with_interval(t0, t1)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }
}

fn cmb_tag(block: &Block) -> Block {
    let block = block.with_subtype("cmb");
    match block.pointing() {
        Some(p) => {
            let tag = format!("{:.0}-{:.0}", p.az, p.az + p.throw);
            block.with_tag(tag)
        }
        None => block,
    }
}

impl Policy for SatPolicy {
    fn transform(&self, mut tree: BlockTree) -> Result<(BlockTree, Vec<Rejection>)> {
        check_layout(&tree)?;
        let cal_policy: CalibrationPolicy = self.config.cal_policy.parse()?;
        let sun = self
            .registry
            .build(&self.config.rules, "sun-avoidance", None)?;

        let calibration = sun.apply(&tree.take("calibration").unwrap_or_else(BlockTree::group));
        let values = self.plan_calibration(&calibration)?;

        let (resolved, rejections) = match cal_policy {
            CalibrationPolicy::RoundRobin => RoundRobin::new(self.pad(&values)?)
                .with_values(values)?
                .with_sun_rule(sun)
                .resolve(),
        };
        let calibration = BlockTree::from(resolved).map(|b| b.with_subtype("cal"));

        let mut baseline = tree.take("baseline").unwrap_or_default();
        if let Some(cmb) = baseline.take("cmb") {
            baseline.insert("cmb", cmb.map(cmb_tag));
        }
        if let Some(tag) = &self.config.scan_tag {
            baseline = baseline.map(|b| b.append_tag(tag));
        }

        tree.insert("baseline", baseline);
        tree.insert("calibration", calibration);
        Ok((tree, rejections))
    }

    fn merge(&self, tree: BlockTree) -> Result<Vec<Block>> {
        let empty = BlockTree::Empty;
        let baseline = tree.get("baseline").unwrap_or(&empty);
        let calibration = tree.get("calibration").unwrap_or(&empty);
        let mut blocks = merge(baseline, calibration);
        if self.config.rules.contains("min-duration") {
            let rule = self
                .registry
                .build(&self.config.rules, "min-duration", None)?;
            blocks = rule.apply(&blocks.into()).flatten();
        }
        Ok(sort(&blocks))
    }
}

/// Default operation table for `config`.
///
/// Calibration blocks rebias detectors and run a source scan followed by a
/// bias step; CMB blocks re-run detector setup every 4 hours and bias-step
/// before scanning. `run_relock` relocks the readout at session start,
/// `disable_hwp` keeps the half-wave plate stopped, and `home_at_end` ends
/// the session by stopping the half-wave plate and stowing the telescope.
pub fn default_operations(config: &PolicyConfig) -> Vec<OperationSpec> {
    let mut ops = vec![
        OperationSpec::new("preamble", SchedPhase::PreSession),
        OperationSpec::new("start-time", SchedPhase::PreSession),
    ];
    if config.run_relock {
        ops.push(OperationSpec::new("ufm-relock", SchedPhase::PreSession));
    }
    ops.extend([
        OperationSpec::new("set-scan-params", SchedPhase::PreSession)
            .with_param("az_speed", config.az_speed)
            .with_param("az_accel", config.az_accel),
        // calibration
        OperationSpec::new("det-setup", SchedPhase::PreBlock)
            .for_subtype("cal")
            .with_param("disable_hwp", config.disable_hwp),
        OperationSpec::new("setup-boresight", SchedPhase::PreBlock)
            .for_subtype("cal")
            .with_param("apply_boresight_rot", config.apply_boresight_rot),
        OperationSpec::new("hwp-spin-up", SchedPhase::PreBlock)
            .for_subtype("cal")
            .with_param("disable_hwp", config.disable_hwp),
        OperationSpec::new("source-scan", SchedPhase::InBlock).for_subtype("cal"),
        OperationSpec::new("bias-step", SchedPhase::PostBlock).for_subtype("cal"),
        // cmb
        OperationSpec::new("det-setup", SchedPhase::PreBlock)
            .for_subtype("cmb")
            .with_param("disable_hwp", config.disable_hwp)
            .with_param("iv_cadence", 4.0 * 3600.0),
        OperationSpec::new("setup-boresight", SchedPhase::PreBlock)
            .for_subtype("cmb")
            .with_param("apply_boresight_rot", config.apply_boresight_rot),
        OperationSpec::new("hwp-spin-up", SchedPhase::PreBlock)
            .for_subtype("cmb")
            .with_param("disable_hwp", config.disable_hwp),
        OperationSpec::new("bias-step", SchedPhase::PreBlock).for_subtype("cmb"),
        OperationSpec::new("cmb-scan", SchedPhase::InBlock).for_subtype("cmb"),
    ]);
    if config.home_at_end {
        ops.push(
            OperationSpec::new("hwp-spin-down", SchedPhase::PostSession)
                .with_param("disable_hwp", config.disable_hwp),
        );
        ops.push(
            OperationSpec::new("wrap-up", SchedPhase::PostSession)
                .with_param("az_stow", 180.0)
                .with_param("el_stow", 60.0),
        );
    }
    ops
}
