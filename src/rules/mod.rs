//! Observing rules and the rule registry.
//!
//! A rule is a pure transform over a [`BlockTree`]. Rules are built by name
//! from a parameter object; each rule deserializes its parameters into a
//! typed config and rejects unknown or malformed options at construction.
//!
//! # Usage
//!
//! ```
//! use skysched::rules::{RuleRegistry, RuleSet};
//! use serde_json::json;
//!
//! let rules = RuleSet::new().with_rule("min-duration", json!({ "min_duration": 600 }));
//! let registry = RuleRegistry::new();
//! let rule = registry.build(&rules, "min-duration", None).unwrap();
//! assert_eq!(rule.name(), "min-duration");
//! ```

pub mod builtin;
pub mod seed;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{BlockTree, TimeWindow};

pub use builtin::{
    AltRange, AzRange, DayMod, DriftFilter, DriftModeRule, MakeSourceScan, MinDuration,
    SunAvoidance,
};
pub use seed::DailyKey;

/// Parameters of a rule: a flat JSON object of option → value.
pub type RuleParams = Value;

/// A pure block-tree transform.
///
/// Rules must be total and idempotent. A rule that needs random numbers
/// takes an explicit seed among its parameters.
pub trait Rule: Send + Sync + Debug {
    /// Registry name (e.g. "sun-avoidance").
    fn name(&self) -> &'static str;

    /// Applies the rule, returning a new tree.
    fn apply(&self, tree: &BlockTree) -> BlockTree;

    /// Rule description.
    fn description(&self) -> &'static str {
        self.name()
    }
}

/// Computes when a pointing is too close to the sun.
///
/// Implemented by an ephemeris collaborator outside this crate.
pub trait SunModel: Send + Sync + Debug {
    /// Sub-windows of `window` during which the direction `(az, alt)` lies
    /// within `min_angle` degrees of the sun.
    fn exclusion_windows(
        &self,
        az: f64,
        alt: f64,
        window: &TimeWindow,
        min_angle: f64,
    ) -> Vec<TimeWindow>;
}

/// A sun model with fixed exclusion windows, independent of pointing.
///
/// Useful for site-level blackouts and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSunModel {
    windows: Vec<TimeWindow>,
}

impl StaticSunModel {
    /// Creates a model with the given exclusion windows.
    pub fn new(windows: Vec<TimeWindow>) -> Self {
        Self { windows }
    }
}

impl SunModel for StaticSunModel {
    fn exclusion_windows(
        &self,
        _az: f64,
        _alt: f64,
        window: &TimeWindow,
        _min_angle: f64,
    ) -> Vec<TimeWindow> {
        self.windows
            .iter()
            .filter(|w| w.overlaps(window))
            .copied()
            .collect()
    }
}

/// Default parameters per rule name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: BTreeMap<String, RuleParams>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a rule's default parameters.
    pub fn with_rule(mut self, name: impl Into<String>, params: RuleParams) -> Self {
        self.rules.insert(name.into(), params);
        self
    }

    /// Default parameters for `name`.
    pub fn get(&self, name: &str) -> Option<&RuleParams> {
        self.rules.get(name)
    }

    /// Whether `name` is configured.
    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Configured rule names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

/// Registry of known rules: maps a name and parameters to a rule object.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    sun_model: Option<Arc<dyn SunModel>>,
}

impl RuleRegistry {
    /// Names the registry can build.
    pub const NAMES: &'static [&'static str] = &[
        "sun-avoidance",
        "min-duration",
        "alt-range",
        "az-range",
        "drift-mode",
        "day-mod",
        "make-source-scan",
    ];

    /// Creates a registry without a sun model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sun model used by `sun-avoidance`.
    pub fn with_sun_model(mut self, model: Arc<dyn SunModel>) -> Self {
        self.sun_model = Some(model);
        self
    }

    /// Builds a rule from explicit parameters.
    pub fn make_rule(&self, name: &str, params: &RuleParams) -> Result<Arc<dyn Rule>> {
        let rule: Arc<dyn Rule> = match name {
            "sun-avoidance" => {
                let model = self.sun_model.clone().ok_or(Error::MissingSunModel)?;
                Arc::new(SunAvoidance::from_params(params, model)?)
            }
            "min-duration" => Arc::new(MinDuration::from_params(params)?),
            "alt-range" => Arc::new(AltRange::from_params(params)?),
            "az-range" => Arc::new(AzRange::from_params(params)?),
            "drift-mode" => Arc::new(DriftModeRule::from_params(params)?),
            "day-mod" => Arc::new(DayMod::from_params(params)?),
            "make-source-scan" => Arc::new(MakeSourceScan::from_params(params)?),
            other => return Err(Error::UnknownRule(other.to_string())),
        };
        Ok(rule)
    }

    /// Builds rule `name` from the rule set, with optional overrides.
    ///
    /// Overrides take precedence key by key over the configured defaults.
    /// A rule that is neither configured nor overridden is an error.
    pub fn build(
        &self,
        rules: &RuleSet,
        name: &str,
        overrides: Option<&RuleParams>,
    ) -> Result<Arc<dyn Rule>> {
        self.build_as(rules, name, name, overrides)
    }

    /// Like [`build`](Self::build), but reads defaults from the `config_key`
    /// entry of the rule set (e.g. `calibration-min-duration` configuring a
    /// `min-duration` rule).
    pub fn build_as(
        &self,
        rules: &RuleSet,
        config_key: &str,
        name: &str,
        overrides: Option<&RuleParams>,
    ) -> Result<Arc<dyn Rule>> {
        let params = match (rules.get(config_key), overrides) {
            (None, None) => return Err(Error::UnknownRule(config_key.to_string())),
            (Some(defaults), None) => defaults.clone(),
            (None, Some(extra)) => extra.clone(),
            (Some(defaults), Some(extra)) => overlay(defaults, extra),
        };
        self.make_rule(name, &params)
    }
}

/// Shallow key-wise overlay of two parameter objects.
fn overlay(base: &Value, extra: &Value) -> Value {
    match (base, extra) {
        (Value::Object(b), Value::Object(e)) => {
            let mut merged = b.clone();
            for (k, v) in e {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, extra) => extra.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_from_rule_set() {
        let rules = RuleSet::new().with_rule("min-duration", json!({ "min_duration": 600 }));
        let registry = RuleRegistry::new();
        let rule = registry.build(&rules, "min-duration", None).unwrap();
        assert_eq!(rule.name(), "min-duration");
    }

    #[test]
    fn test_missing_rule_is_configuration_error() {
        let registry = RuleRegistry::new();
        let err = registry.build(&RuleSet::new(), "min-duration", None).unwrap_err();
        assert!(matches!(err, Error::UnknownRule(ref n) if n == "min-duration"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_overrides_without_defaults() {
        let registry = RuleRegistry::new();
        let rule = registry
            .build(&RuleSet::new(), "min-duration", Some(&json!({ "min_duration": 60 })))
            .unwrap();
        assert_eq!(rule.name(), "min-duration");
    }

    #[test]
    fn test_unknown_registry_name() {
        let registry = RuleRegistry::new();
        let err = registry.make_rule("teleport", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownRule(_)));
    }

    #[test]
    fn test_sun_avoidance_requires_model() {
        let registry = RuleRegistry::new();
        let err = registry
            .make_rule("sun-avoidance", &json!({ "min_angle": 45 }))
            .unwrap_err();
        assert!(matches!(err, Error::MissingSunModel));

        let registry = registry.with_sun_model(Arc::new(StaticSunModel::default()));
        assert!(registry
            .make_rule("sun-avoidance", &json!({ "min_angle": 45 }))
            .is_ok());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let registry = RuleRegistry::new();
        let err = registry
            .make_rule("min-duration", &json!({ "min_duraton": 60 }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRuleParams { .. }));
    }

    #[test]
    fn test_overlay_prefers_overrides() {
        let merged = overlay(&json!({ "a": 1, "b": 2 }), &json!({ "b": 3 }));
        assert_eq!(merged, json!({ "a": 1, "b": 3 }));
    }

    #[test]
    fn test_rule_set_serde() {
        let rules: RuleSet = serde_json::from_value(json!({
            "sun-avoidance": { "min_angle": 49, "min_sun_time": 1980 },
            "min-duration": { "min_duration": 600 },
        }))
        .unwrap();
        assert!(rules.contains("sun-avoidance"));
        assert_eq!(rules.names().count(), 2);
    }

    #[test]
    fn test_all_names_buildable() {
        let registry = RuleRegistry::new().with_sun_model(Arc::new(StaticSunModel::default()));
        let params = json!({
            "sun-avoidance": { "min_angle": 45 },
            "min-duration": { "min_duration": 1 },
            "alt-range": { "alt_range": [40, 70] },
            "az-range": { "az_range": [0, 360] },
            "drift-mode": { "mode": "both" },
            "day-mod": { "day": 0, "day_mod": 2, "day_ref": "2024-01-01T00:00:00Z" },
            "make-source-scan": { "throw": 20 },
        });
        for name in RuleRegistry::NAMES {
            let rule = registry.make_rule(name, &params[*name]).unwrap();
            assert_eq!(rule.name(), *name);
        }
    }
}
