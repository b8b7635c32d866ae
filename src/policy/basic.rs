//! Master schedule plus calibration scans.
//!
//! The raw tree has the layout
//!
//! ```text
//! master
//! sources
//! ├── calibration
//! │   └── <source>...
//! └── soft
//!     └── <source>...
//! ```
//!
//! `transform` cuts everything for sun avoidance, filters the calibration
//! windows with the optional `day-mod`, `drift-mode`,
//! `calibration-min-duration` and `alt-range` rules, then plans one seeded
//! scan per window. `merge` interleaves master and calibration blocks.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{check_layout, Policy, Rejection, RuleChain, SequenceLoader};
use crate::error::Result;
use crate::models::tree::{merge, sort};
use crate::models::{Block, BlockTree, InstrumentState};
use crate::rules::{DailyKey, RuleRegistry, RuleSet};
use crate::sequencer::{OperationSpec, SchedPhase, SequenceOutcome, Sequencer};

/// Optional calibration filters: configuration key and rule name, in
/// application order.
const CALIBRATION_FILTERS: &[(&str, &str)] = &[
    ("day-mod", "day-mod"),
    ("drift-mode", "drift-mode"),
    ("calibration-min-duration", "min-duration"),
    ("alt-range", "alt-range"),
];

/// Basic policy.
///
/// # Example
/// ```
/// use serde_json::json;
/// use skysched::policy::BasicPolicy;
/// use skysched::rules::{RuleRegistry, RuleSet};
///
/// let rules = RuleSet::new().with_rule("min-duration", json!({ "min_duration": 600 }));
/// let policy = BasicPolicy::new(rules, RuleRegistry::new())
///     .with_master_schedule("schedules/cmb.txt")
///     .with_calibration_target("jupiter")
///     .with_soft_target("moon");
/// assert_eq!(policy.calibration_targets(), ["jupiter"]);
/// ```
#[derive(Debug, Clone)]
pub struct BasicPolicy {
    rules: RuleSet,
    registry: RuleRegistry,
    master_schedule: Option<String>,
    calibration_targets: Vec<String>,
    soft_targets: Vec<String>,
}

impl BasicPolicy {
    /// Creates a policy without schedule or targets.
    pub fn new(rules: RuleSet, registry: RuleRegistry) -> Self {
        Self {
            rules,
            registry,
            master_schedule: None,
            calibration_targets: Vec::new(),
            soft_targets: Vec::new(),
        }
    }

    /// Sets the master schedule file.
    pub fn with_master_schedule(mut self, path: impl Into<String>) -> Self {
        self.master_schedule = Some(path.into());
        self
    }

    /// Adds a calibration source.
    pub fn with_calibration_target(mut self, source: impl Into<String>) -> Self {
        self.calibration_targets.push(source.into());
        self
    }

    /// Adds a soft source.
    pub fn with_soft_target(mut self, source: impl Into<String>) -> Self {
        self.soft_targets.push(source.into());
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn calibration_targets(&self) -> &[String] {
        &self.calibration_targets
    }

    pub fn soft_targets(&self) -> &[String] {
        &self.soft_targets
    }

    /// Builds the raw tree for `[t0, t1]`, trimmed to the window.
    pub fn init_seqs(
        &self,
        loader: &dyn SequenceLoader,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<BlockTree> {
        let master = match &self.master_schedule {
            Some(path) => loader.master_schedule(path)?,
            None => BlockTree::List(Vec::new()),
        };
        let load = |sources: &[String]| -> Result<BlockTree> {
            let mut group = BlockTree::group();
            for source in sources {
                group.insert(source.clone(), loader.source_windows(source, t0, t1)?);
            }
            Ok(group)
        };
        let sources = BlockTree::group()
            .with_child("calibration", load(&self.calibration_targets)?)
            .with_child("soft", load(&self.soft_targets)?);

        Ok(BlockTree::group()
            .with_child("master", master)
            .with_child("sources", sources)
            .trim(t0, t1))
    }

    /// Operation table: slew and bias before each block, scan, bias step
    /// after.
    pub fn operation_specs(&self) -> Vec<OperationSpec> {
        basic_operations()
    }

    /// Compiles a merged sequence into timed operations, starting at `t0`.
    pub fn build_operations(&self, seq: &[Block], t0: DateTime<Utc>) -> Result<SequenceOutcome> {
        Sequencer::new(&self.operation_specs())?.run(seq, InstrumentState::new(t0))
    }

    fn calibration_chain(&self) -> Result<RuleChain> {
        let mut chain = RuleChain::new();
        for &(key, name) in CALIBRATION_FILTERS {
            if self.rules.contains(key) {
                chain.push(self.registry.build_as(&self.rules, key, name, None)?);
            }
        }
        Ok(chain)
    }

    /// Turns each source's windows into scans, one sub-seed per source.
    fn plan_scans(&self, mut calibration: BlockTree) -> Result<BlockTree> {
        let Some(key) = DailyKey::for_blocks(&calibration.flatten()) else {
            return Ok(calibration);
        };
        let sources: Vec<String> = calibration.keys().into_iter().map(str::to_string).collect();
        let seeds = key.split(sources.len());
        for (source, seed) in sources.iter().zip(seeds) {
            let planner = self.registry.build(
                &self.rules,
                "make-source-scan",
                Some(&json!({ "rng_seed": seed })),
            )?;
            if let Some(windows) = calibration.get_mut(source) {
                *windows = planner.apply(windows);
            }
        }
        Ok(calibration)
    }
}

impl Policy for BasicPolicy {
    fn transform(&self, tree: BlockTree) -> Result<(BlockTree, Vec<Rejection>)> {
        check_layout(&tree)?;
        let sun = self.registry.build(&self.rules, "sun-avoidance", None)?;
        let mut tree = sun.apply(&tree);

        let mut sources = tree.take("sources").unwrap_or_else(BlockTree::group);
        let calibration = sources.take("calibration").unwrap_or_else(BlockTree::group);
        let calibration = self.calibration_chain()?.apply(&calibration);
        sources.insert("calibration", self.plan_scans(calibration)?);
        tree.insert("sources", sources);

        Ok((tree, Vec::new()))
    }

    fn merge(&self, tree: BlockTree) -> Result<Vec<Block>> {
        let empty = BlockTree::Empty;
        let master = tree.get("master").unwrap_or(&empty);
        let calibration = tree
            .get_path(&["sources", "calibration"])
            .unwrap_or(&empty);
        let mut blocks = merge(master, calibration);
        if self.rules.contains("min-duration") {
            let rule = self.registry.build(&self.rules, "min-duration", None)?;
            blocks = rule.apply(&blocks.into()).flatten();
        }
        Ok(sort(&blocks))
    }
}

/// Operation table of the basic policy.
pub fn basic_operations() -> Vec<OperationSpec> {
    vec![
        OperationSpec::new("preamble", SchedPhase::PreSession),
        OperationSpec::new("setup-boresight", SchedPhase::PreBlock),
        OperationSpec::new("bias-det", SchedPhase::PreBlock),
        OperationSpec::new("bias-step", SchedPhase::PreBlock),
        OperationSpec::new("source-scan", SchedPhase::InBlock).for_subtype("cal"),
        OperationSpec::new("cmb-scan", SchedPhase::InBlock),
        OperationSpec::new("bias-step", SchedPhase::PostBlock),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{BlockKind, DriftMode, Pointing, SourceWindow, TimeWindow};
    use crate::rules::StaticSunModel;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn window(source: &str, s: i64, e: i64, mode: DriftMode, alt: f64) -> Block {
        Block::source(
            format!("{source}-{s}"),
            t(s),
            t(e),
            SourceWindow {
                source: source.into(),
                mode,
                az: 120.0,
                alt,
            },
        )
        .unwrap()
    }

    struct FakeLoader;

    impl SequenceLoader for FakeLoader {
        fn source_windows(
            &self,
            source: &str,
            _t0: DateTime<Utc>,
            _t1: DateTime<Utc>,
        ) -> Result<BlockTree> {
            Ok(match source {
                "jupiter" => vec![
                    window("jupiter", 4000, 6000, DriftMode::Rising, 50.0),
                    window("jupiter", 30000, 30300, DriftMode::Setting, 50.0),
                ]
                .into(),
                "uranus" => vec![window("uranus", 12000, 15000, DriftMode::Rising, 20.0)].into(),
                _ => vec![window(source, 50000, 52000, DriftMode::Rising, 40.0)].into(),
            })
        }

        fn master_schedule(&self, _path: &str) -> Result<BlockTree> {
            Ok(vec![
                Block::scan("cmb-1", t(0), t(3600), Pointing::new(100.0, 60.0, 40.0)).unwrap(),
                Block::scan("cmb-2", t(7200), t(10800), Pointing::new(200.0, 60.0, 40.0)).unwrap(),
            ]
            .into())
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new()
            .with_rule("sun-avoidance", json!({ "min_angle": 49 }))
            .with_rule("make-source-scan", json!({ "throw": 20, "max_phase_shift": 300 }))
    }

    fn policy(rules: RuleSet) -> BasicPolicy {
        let registry =
            RuleRegistry::new().with_sun_model(Arc::new(StaticSunModel::new(Vec::new())));
        BasicPolicy::new(rules, registry)
            .with_master_schedule("cmb.txt")
            .with_calibration_target("jupiter")
            .with_calibration_target("uranus")
            .with_soft_target("moon")
    }

    fn calibration(tree: &BlockTree) -> Vec<Block> {
        tree.get_path(&["sources", "calibration"]).unwrap().flatten()
    }

    #[test]
    fn test_init_seqs_layout() {
        let tree = policy(rules()).init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        assert_eq!(tree.keys(), vec!["master", "sources"]);
        assert_eq!(tree.get("master").unwrap().len(), 2);
        assert_eq!(tree.get_path(&["sources", "calibration", "jupiter"]).unwrap().len(), 2);
        assert_eq!(tree.get_path(&["sources", "soft", "moon"]).unwrap().len(), 1);
    }

    #[test]
    fn test_init_seqs_trims_to_window() {
        let tree = policy(rules()).init_seqs(&FakeLoader, t(0), t(5000)).unwrap();
        let jupiter = tree
            .get_path(&["sources", "calibration", "jupiter"])
            .unwrap()
            .flatten();
        assert_eq!(jupiter.len(), 1);
        assert_eq!(jupiter[0].t1(), t(5000));
    }

    #[test]
    fn test_transform_plans_calibration_scans() {
        let policy = policy(rules());
        let tree = policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        let (out, rejections) = policy.transform(tree).unwrap();
        assert!(rejections.is_empty());

        let cal = calibration(&out);
        assert_eq!(cal.len(), 3);
        for scan in &cal {
            assert!(matches!(scan.kind(), BlockKind::Scan(_)));
            assert_eq!(scan.subtype(), "cal");
        }
        // soft sources are left as windows
        let soft = out.get_path(&["sources", "soft"]).unwrap().flatten();
        assert!(matches!(soft[0].kind(), BlockKind::Source(_)));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let policy = policy(rules());
        let a = policy
            .transform(policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap())
            .unwrap();
        let b = policy
            .transform(policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_optional_calibration_filters() {
        let rules = rules()
            .with_rule("drift-mode", json!({ "mode": "rising" }))
            .with_rule("alt-range", json!({ "alt_range": [30, 80] }))
            .with_rule("calibration-min-duration", json!({ "min_duration": 600 }));
        let policy = policy(rules);
        let tree = policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        let (out, _) = policy.transform(tree).unwrap();

        // setting jupiter and low uranus are filtered out
        let cal = calibration(&out);
        assert_eq!(cal.len(), 1);
        assert!(cal[0].tag().contains("jupiter"));
    }

    #[test]
    fn test_sun_avoidance_cuts_master() {
        let registry = RuleRegistry::new().with_sun_model(Arc::new(StaticSunModel::new(vec![
            TimeWindow::new(t(1800), t(2400)),
        ])));
        let policy = BasicPolicy::new(rules(), registry).with_master_schedule("cmb.txt");
        let tree = policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        let (out, _) = policy.transform(tree).unwrap();
        let master = out.get("master").unwrap().flatten();
        let names: Vec<&str> = master.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["cmb-1/0", "cmb-1/1", "cmb-2"]);
    }

    #[test]
    fn test_apply_merges_and_filters() {
        let rules = rules().with_rule("min-duration", json!({ "min_duration": 1000 }));
        let policy = policy(rules);
        let tree = policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        let plan = policy.apply(tree).unwrap();

        // jupiter's 300 s window is dropped; soft sources never merge
        assert_eq!(plan.blocks.len(), 4);
        for pair in plan.blocks.windows(2) {
            assert!(pair[0].t0() <= pair[1].t0());
        }
        assert!(plan.blocks.iter().all(|b| b.pointing().is_some()));
        assert!(plan.rejections.is_empty());
    }

    #[test]
    fn test_missing_sun_avoidance_config() {
        let policy = policy(RuleSet::new());
        let err = policy.transform(BlockTree::group()).unwrap_err();
        assert!(matches!(err, Error::UnknownRule(ref r) if r == "sun-avoidance"));
    }

    #[test]
    fn test_transform_rejects_bare_sequence() {
        let flat = FakeLoader.master_schedule("cmb.txt").unwrap();
        let err = policy(rules()).transform(flat).unwrap_err();
        assert!(matches!(err, Error::UnsupportedLayout(_)));
    }

    #[test]
    fn test_build_operations() {
        let policy = policy(rules());
        let tree = policy.init_seqs(&FakeLoader, t(0), t(86400)).unwrap();
        let plan = policy.apply(tree).unwrap();
        let outcome = policy.build_operations(&plan.blocks, t(0)).unwrap();

        assert_eq!(outcome.operations[0].name, "preamble");
        assert!(!outcome.operations_named("source-scan").is_empty());
        assert!(!outcome.operations_named("cmb-scan").is_empty());
        for pair in outcome.operations.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
    }
}
