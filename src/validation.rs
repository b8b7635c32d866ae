//! Batch input checks.
//!
//! The policy and sequencer stop at the first problem they meet. The checks
//! here run before a schedule is built and report every problem at once:
//! - Duplicate block names
//! - Malformed or empty scheduling windows
//! - Unsorted or overlapping block sequences
//! - Unknown or invalid operations, blocks without an in-block operation
//! - Unknown rules, invalid rule parameters, unsupported calibration policy
//! - A block layout that is a bare sequence instead of named groups

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::{BlocksConfig, PolicyConfig};
use crate::error::Error;
use crate::models::Block;
use crate::policy::CalibrationPolicy;
use crate::rules::RuleRegistry;
use crate::sequencer::{Operation, OperationSpec, SchedPhase};

/// Validation result.
pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// A validation error.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Error category.
    pub kind: ValidationErrorKind,
    /// Human-readable description.
    pub message: String,
}

/// Categories of validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Two blocks share the same name.
    DuplicateName,
    /// A window ends before it starts.
    MalformedInterval,
    /// Start times decrease somewhere in a sequence.
    UnsortedSequence,
    /// Two blocks of a sequence overlap.
    OverlappingBlocks,
    /// An operation name is not registered.
    UnknownOperation,
    /// An operation spec fails to compile.
    InvalidOperation,
    /// A block subtype has no in-block operation.
    MissingInBlockOperation,
    /// A rule name is not registered.
    UnknownRule,
    /// A rule's parameters are rejected.
    InvalidRule,
    /// The calibration policy name is not supported.
    UnsupportedCalibrationPolicy,
    /// A scalar configuration value is out of range.
    InvalidParameter,
    /// A calibration target is listed twice.
    DuplicateTarget,
    /// The block layout is not keyed by category.
    UnsupportedLayout,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

fn finish(errors: Vec<ValidationError>) -> ValidationResult {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validates a scheduling window. Zero-length windows are rejected too.
pub fn validate_window(t0: DateTime<Utc>, t1: DateTime<Utc>) -> ValidationResult {
    let mut errors = Vec::new();
    if t0 >= t1 {
        errors.push(ValidationError::new(
            ValidationErrorKind::MalformedInterval,
            format!("Scheduling window [{t0}, {t1}] is empty or reversed"),
        ));
    }
    finish(errors)
}

/// Validates a merged block sequence before sequencing.
///
/// Checks:
/// 1. No duplicate block names
/// 2. Non-decreasing start times
/// 3. No overlap between consecutive blocks
pub fn validate_blocks(blocks: &[Block]) -> ValidationResult {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for b in blocks {
        if !names.insert(b.name()) {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateName,
                format!("Duplicate block name: {}", b.name()),
            ));
        }
    }

    for pair in blocks.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.t0() < prev.t0() {
            errors.push(ValidationError::new(
                ValidationErrorKind::UnsortedSequence,
                format!("Block '{}' starts before '{}'", next.name(), prev.name()),
            ));
        } else if prev.overlaps(next) {
            errors.push(ValidationError::new(
                ValidationErrorKind::OverlappingBlocks,
                format!("Block '{}' overlaps '{}'", next.name(), prev.name()),
            ));
        }
    }

    finish(errors)
}

/// Validates an operation table.
///
/// Every spec is compiled; each failure is reported. With `blocks`, also
/// checks that every block subtype has an in-block operation.
pub fn validate_operations(specs: &[OperationSpec], blocks: &[Block]) -> ValidationResult {
    let mut errors = Vec::new();

    for spec in specs {
        match Operation::compile(spec) {
            Ok(_) => {}
            Err(Error::UnknownOperation(name)) => errors.push(ValidationError::new(
                ValidationErrorKind::UnknownOperation,
                format!("Unknown operation '{name}'"),
            )),
            Err(e) => errors.push(ValidationError::new(
                ValidationErrorKind::InvalidOperation,
                e.to_string(),
            )),
        }
    }

    let in_block: Vec<&OperationSpec> = specs
        .iter()
        .filter(|s| s.phase == SchedPhase::InBlock)
        .collect();
    let mut seen = HashSet::new();
    for b in blocks {
        if !seen.insert(b.subtype()) {
            continue;
        }
        let covered = in_block
            .iter()
            .any(|s| s.subtype.as_deref().map_or(true, |st| st == b.subtype()));
        if !covered {
            errors.push(ValidationError::new(
                ValidationErrorKind::MissingInBlockOperation,
                format!(
                    "No in-block operation for subtype '{}' (block '{}')",
                    b.subtype(),
                    b.name()
                ),
            ));
        }
    }

    finish(errors)
}

/// Configuration key to registry name.
fn rule_name(key: &str) -> &str {
    match key {
        "calibration-min-duration" => "min-duration",
        other => other,
    }
}

/// Validates a policy configuration against a registry.
///
/// Checks:
/// 1. The calibration policy is supported
/// 2. `overlap_buffer` is finite and non-negative, scan speeds are positive
/// 3. Calibration targets are listed once
/// 4. Every configured rule is known and accepts its parameters
/// 5. The operation table compiles
pub fn validate_config(config: &PolicyConfig, registry: &RuleRegistry) -> ValidationResult {
    let mut errors = Vec::new();

    if config.cal_policy.parse::<CalibrationPolicy>().is_err() {
        errors.push(ValidationError::new(
            ValidationErrorKind::UnsupportedCalibrationPolicy,
            format!("Unsupported calibration policy '{}'", config.cal_policy),
        ));
    }

    if let BlocksConfig::Sequence(_) = config.blocks {
        errors.push(ValidationError::new(
            ValidationErrorKind::UnsupportedLayout,
            "blocks must be keyed by category (e.g. [blocks.baseline.cmb]), not a single sequence",
        ));
    }

    if !config.overlap_buffer.is_finite() || config.overlap_buffer < 0.0 {
        errors.push(ValidationError::new(
            ValidationErrorKind::InvalidParameter,
            format!("overlap_buffer must be non-negative, got {}", config.overlap_buffer),
        ));
    }
    for (key, value) in [("az_speed", config.az_speed), ("az_accel", config.az_accel)] {
        if !(value.is_finite() && value > 0.0) {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidParameter,
                format!("{key} must be positive, got {value}"),
            ));
        }
    }

    let mut targets = HashSet::new();
    for target in &config.cal_targets {
        if !targets.insert((target.source.as_str(), target.tag.as_str())) {
            errors.push(ValidationError::new(
                ValidationErrorKind::DuplicateTarget,
                format!("Calibration target '{}' listed twice", target.source),
            ));
        }
    }

    for key in config.rules.names() {
        let Some(params) = config.rules.get(key) else {
            continue;
        };
        match registry.make_rule(rule_name(key), params) {
            Ok(_) => {}
            Err(Error::UnknownRule(_)) => errors.push(ValidationError::new(
                ValidationErrorKind::UnknownRule,
                format!("Unknown rule '{key}'"),
            )),
            Err(e) => errors.push(ValidationError::new(
                ValidationErrorKind::InvalidRule,
                format!("Rule '{key}': {e}"),
            )),
        }
    }

    if let Err(op_errors) = validate_operations(&config.operations, &[]) {
        errors.extend(op_errors);
    }

    finish(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Pointing, TimeWindow};
    use crate::policy::CalTarget;
    use crate::rules::{RuleSet, StaticSunModel};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scan(name: &str, s: i64, e: i64) -> Block {
        Block::scan(name, t(s), t(e), Pointing::new(100.0, 50.0, 20.0)).unwrap()
    }

    fn registry() -> RuleRegistry {
        RuleRegistry::new().with_sun_model(Arc::new(StaticSunModel::new(Vec::<TimeWindow>::new())))
    }

    fn kinds(result: ValidationResult) -> Vec<ValidationErrorKind> {
        result.unwrap_err().into_iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_valid_blocks() {
        let blocks = vec![scan("a", 0, 100), scan("b", 100, 200), scan("c", 300, 400)];
        assert!(validate_blocks(&blocks).is_ok());
        assert!(validate_blocks(&[]).is_ok());
    }

    #[test]
    fn test_duplicate_block_name() {
        let blocks = vec![scan("a", 0, 100), scan("a", 200, 300)];
        assert_eq!(kinds(validate_blocks(&blocks)), vec![ValidationErrorKind::DuplicateName]);
    }

    #[test]
    fn test_unsorted_and_overlapping() {
        let blocks = vec![scan("a", 0, 100), scan("b", 50, 150), scan("c", 10, 20)];
        assert_eq!(
            kinds(validate_blocks(&blocks)),
            vec![
                ValidationErrorKind::OverlappingBlocks,
                ValidationErrorKind::UnsortedSequence
            ]
        );
    }

    #[test]
    fn test_window() {
        assert!(validate_window(t(0), t(10)).is_ok());
        assert_eq!(kinds(validate_window(t(10), t(10))), vec![ValidationErrorKind::MalformedInterval]);
        assert_eq!(kinds(validate_window(t(10), t(0))), vec![ValidationErrorKind::MalformedInterval]);
    }

    #[test]
    fn test_operations_collects_every_error() {
        let specs = vec![
            OperationSpec::new("warp-drive", SchedPhase::PreBlock),
            OperationSpec::new("set-scan-params", SchedPhase::PreSession).with_param("az_speed", 1.0),
            OperationSpec::new("cmb-scan", SchedPhase::PostBlock),
            OperationSpec::new("source-scan", SchedPhase::InBlock).for_subtype("cal"),
        ];
        let blocks = vec![scan("a", 0, 100).with_subtype("cal"), scan("b", 100, 200).with_subtype("cmb")];
        assert_eq!(
            kinds(validate_operations(&specs, &blocks)),
            vec![
                ValidationErrorKind::UnknownOperation,
                ValidationErrorKind::InvalidOperation,
                ValidationErrorKind::InvalidOperation,
                ValidationErrorKind::MissingInBlockOperation,
            ]
        );
    }

    #[test]
    fn test_unrestricted_in_block_covers_all() {
        let specs = vec![OperationSpec::new("cmb-scan", SchedPhase::InBlock)];
        let blocks = vec![scan("a", 0, 100).with_subtype("cal"), scan("b", 100, 200)];
        assert!(validate_operations(&specs, &blocks).is_ok());
    }

    #[test]
    fn test_valid_config() {
        let config = PolicyConfig {
            rules: RuleSet::new()
                .with_rule("sun-avoidance", json!({ "min_angle": 49 }))
                .with_rule("calibration-min-duration", json!({ "min_duration": 600 })),
            cal_targets: vec![CalTarget::new("jupiter", "ws0"), CalTarget::new("jupiter", "ws1")],
            ..PolicyConfig::default()
        };
        assert!(validate_config(&config, &registry()).is_ok());
    }

    #[test]
    fn test_config_multiple_errors() {
        let config = PolicyConfig {
            rules: RuleSet::new()
                .with_rule("moon-avoidance", json!({}))
                .with_rule("min-duration", json!({ "min_duraton": 600 })),
            cal_targets: vec![CalTarget::new("jupiter", ""), CalTarget::new("jupiter", "")],
            cal_policy: "first-come".into(),
            overlap_buffer: -10.0,
            az_speed: 0.0,
            operations: vec![OperationSpec::new("wrap-up", SchedPhase::PostSession)],
            ..PolicyConfig::default()
        };
        let mut found = kinds(validate_config(&config, &registry()));
        found.sort_by_key(|k| format!("{k:?}"));
        assert_eq!(
            found,
            vec![
                ValidationErrorKind::DuplicateTarget,
                ValidationErrorKind::InvalidOperation,
                ValidationErrorKind::InvalidParameter,
                ValidationErrorKind::InvalidParameter,
                ValidationErrorKind::InvalidRule,
                ValidationErrorKind::UnknownRule,
                ValidationErrorKind::UnsupportedCalibrationPolicy,
            ]
        );
    }

    #[test]
    fn test_top_level_sequence_layout_rejected() {
        let config = PolicyConfig::from_toml_str(
            r#"
[blocks]
type = "master-schedule"
file = "cmb.txt"
"#,
        )
        .unwrap();
        assert_eq!(
            kinds(validate_config(&config, &registry())),
            vec![ValidationErrorKind::UnsupportedLayout]
        );
    }

    #[test]
    fn test_sun_avoidance_needs_model() {
        let config = PolicyConfig {
            rules: RuleSet::new().with_rule("sun-avoidance", json!({ "min_angle": 49 })),
            ..PolicyConfig::default()
        };
        let errors = validate_config(&config, &RuleRegistry::new()).unwrap_err();
        assert_eq!(errors[0].kind, ValidationErrorKind::InvalidRule);
        assert!(errors[0].message.contains("sun-avoidance"));
    }
}
