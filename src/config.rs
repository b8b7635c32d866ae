//! Policy configuration.
//!
//! A policy is configured from a TOML (or JSON) document:
//!
//! ```toml
//! cal_policy = "round-robin"
//! az_speed = 0.5
//! az_accel = 0.25
//!
//! [blocks.baseline.cmb]
//! type = "master-schedule"
//! file = "schedules/cmb.txt"
//!
//! [blocks.calibration.jupiter]
//! type = "source"
//! name = "jupiter"
//!
//! [rules.sun-avoidance]
//! min_angle = 49
//! min_sun_time = 1980
//!
//! [rules.min-duration]
//! min_duration = 600
//!
//! [[cal_targets]]
//! source = "jupiter"
//! tag = "ws0,ws1"
//! boresight_rot = 45
//!
//! [[operations]]
//! name = "cmb-scan"
//! phase = "in-block"
//! subtype = "cmb"
//! ```
//!
//! Only structure is checked at load time; see [`crate::validation`] for
//! the batch checks run before a schedule is built.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::models::BlockTree;
use crate::policy::{CalTarget, SequenceLoader};
use crate::rules::RuleSet;
use crate::sequencer::OperationSpec;

fn default_cal_policy() -> String {
    "round-robin".to_string()
}

fn default_az_speed() -> f64 {
    1.0
}

fn default_az_accel() -> f64 {
    2.0
}

/// Where a raw block sequence comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LoaderSpec {
    /// Visibility windows of a named source.
    Source { name: String },
    /// Blocks of a master schedule file.
    MasterSchedule { file: String },
}

/// Nested layout of the raw block tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BlocksConfig {
    /// A leaf sequence.
    Sequence(LoaderSpec),
    /// Keyed sub-layouts.
    Group(BTreeMap<String, BlocksConfig>),
}

impl Default for BlocksConfig {
    fn default() -> Self {
        BlocksConfig::Group(BTreeMap::new())
    }
}

impl BlocksConfig {
    /// Builds the raw tree through `loader`.
    pub fn load(
        &self,
        loader: &dyn SequenceLoader,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    ) -> Result<BlockTree> {
        match self {
            BlocksConfig::Sequence(LoaderSpec::Source { name }) => {
                loader.source_windows(name, t0, t1)
            }
            BlocksConfig::Sequence(LoaderSpec::MasterSchedule { file }) => {
                loader.master_schedule(file)
            }
            BlocksConfig::Group(children) => {
                let mut tree = BlockTree::group();
                for (key, child) in children {
                    tree.insert(key.clone(), child.load(loader, t0, t1)?);
                }
                Ok(tree)
            }
        }
    }

    /// Source names referenced anywhere in the layout.
    pub fn sources(&self) -> Vec<&str> {
        match self {
            BlocksConfig::Sequence(LoaderSpec::Source { name }) => vec![name.as_str()],
            BlocksConfig::Sequence(LoaderSpec::MasterSchedule { .. }) => Vec::new(),
            BlocksConfig::Group(children) => {
                children.values().flat_map(BlocksConfig::sources).collect()
            }
        }
    }
}

/// Full configuration of a [`SatPolicy`](crate::policy::SatPolicy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    /// Raw block tree layout.
    #[serde(default)]
    pub blocks: BlocksConfig,
    /// Default rule parameters.
    #[serde(default)]
    pub rules: RuleSet,
    /// Calibration targets, highest priority first.
    #[serde(default)]
    pub cal_targets: Vec<CalTarget>,
    /// Calibration conflict policy name.
    #[serde(default = "default_cal_policy")]
    pub cal_policy: String,
    /// Tag appended to every baseline block.
    #[serde(default)]
    pub scan_tag: Option<String>,
    /// Azimuth scan speed (deg/s).
    #[serde(default = "default_az_speed")]
    pub az_speed: f64,
    /// Azimuth scan acceleration (deg/s^2).
    #[serde(default = "default_az_accel")]
    pub az_accel: f64,
    /// Whether scans rotate the boresight.
    #[serde(default)]
    pub apply_boresight_rot: bool,
    /// Padding around calibration scans when checking conflicts (s).
    #[serde(default)]
    pub overlap_buffer: f64,
    /// Relock the detector readout at session start.
    #[serde(default)]
    pub run_relock: bool,
    /// Keep the half-wave plate stopped.
    #[serde(default)]
    pub disable_hwp: bool,
    /// Stop the half-wave plate and stow the telescope at session end.
    #[serde(default)]
    pub home_at_end: bool,
    /// Operation table; empty means the default table.
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            blocks: BlocksConfig::default(),
            rules: RuleSet::default(),
            cal_targets: Vec::new(),
            cal_policy: default_cal_policy(),
            scan_tag: None,
            az_speed: default_az_speed(),
            az_accel: default_az_accel(),
            apply_boresight_rot: false,
            overlap_buffer: 0.0,
            run_relock: false,
            disable_hwp: false,
            home_at_end: false,
            operations: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Converts a JSON value.
    pub fn from_json(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::sequencer::SchedPhase;
    use serde_json::json;

    const SAMPLE: &str = r#"
cal_policy = "round-robin"
az_speed = 0.5
az_accel = 0.25
overlap_buffer = 300
run_relock = true
home_at_end = true

[blocks.baseline.cmb]
type = "master-schedule"
file = "cmb.txt"

[blocks.calibration.jupiter]
type = "source"
name = "jupiter"

[rules.sun-avoidance]
min_angle = 49
min_sun_time = 1980

[rules.min-duration]
min_duration = 600

[[cal_targets]]
source = "jupiter"
tag = "ws0"
boresight_rot = 45

[[operations]]
name = "det-setup"
phase = "pre-block"
subtype = "cal"
params = { disable_hwp = true }

[[operations]]
name = "source-scan"
phase = "in-block"
subtype = "cal"
"#;

    #[test]
    fn test_from_toml() {
        let config = PolicyConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.az_speed, 0.5);
        assert_eq!(config.overlap_buffer, 300.0);
        assert!(config.run_relock && config.home_at_end);
        assert!(!config.disable_hwp);
        assert!(config.rules.contains("sun-avoidance"));
        assert_eq!(config.rules.get("min-duration"), Some(&json!({ "min_duration": 600 })));
        assert_eq!(config.cal_targets[0].source, "jupiter");
        assert_eq!(config.cal_targets[0].boresight_rot, Some(45.0));
        assert_eq!(config.operations.len(), 2);
        assert_eq!(config.operations[0].phase, SchedPhase::PreBlock);
        assert_eq!(config.operations[0].params["disable_hwp"], json!(true));
        assert_eq!(config.blocks.sources(), vec!["jupiter"]);

        let BlocksConfig::Group(top) = &config.blocks else {
            panic!("expected a group");
        };
        assert_eq!(
            top["baseline"],
            BlocksConfig::Group(BTreeMap::from([(
                "cmb".to_string(),
                BlocksConfig::Sequence(LoaderSpec::MasterSchedule {
                    file: "cmb.txt".into()
                })
            )]))
        );
    }

    #[test]
    fn test_defaults() {
        let config = PolicyConfig::from_toml_str("").unwrap();
        assert_eq!(config, PolicyConfig::default());
        assert_eq!(config.cal_policy, "round-robin");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = PolicyConfig::from_toml_str("az_sped = 1.0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_json() {
        let config = PolicyConfig::from_json(json!({
            "cal_targets": [{ "source": "moon" }],
            "scan_tag": "deep",
        }))
        .unwrap();
        assert_eq!(config.cal_targets[0].tag, "");
        assert_eq!(config.scan_tag.as_deref(), Some("deep"));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = PolicyConfig::from_toml_str(SAMPLE).unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(PolicyConfig::from_json(value).unwrap(), config);
    }
}
