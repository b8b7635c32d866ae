//! Error types for skysched.
//!
//! Only structural problems are errors. A block that loses the round-robin
//! test or cannot be set up before its deadline is recorded in the run
//! outcome instead (see [`Rejection`](crate::policy::Rejection) and
//! [`SkippedBlock`](crate::sequencer::SkippedBlock)).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for skysched operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a scheduling run.
#[derive(Error, Debug)]
pub enum Error {
    /// Rule name is neither configured nor given explicit parameters.
    #[error("Unknown rule: {0}")]
    UnknownRule(String),

    /// Rule parameters failed to deserialize into the rule's config.
    #[error("Invalid parameters for rule '{rule}': {message}")]
    InvalidRuleParams { rule: String, message: String },

    /// Operation name not in the operation registry.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Operation spec lacks a required parameter.
    #[error("Operation '{operation}' is missing required parameter '{parameter}'")]
    MissingParameter {
        operation: String,
        parameter: String,
    },

    /// Operation spec parameter has the wrong shape.
    #[error("Invalid parameters for operation '{operation}': {message}")]
    InvalidParameter { operation: String, message: String },

    /// A block or window with `t0 > t1`.
    #[error("Malformed interval for '{name}': {t0} > {t1}")]
    MalformedInterval {
        name: String,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
    },

    /// Calibration conflict policy name is not supported.
    #[error("Unsupported calibration policy: {0}")]
    UnsupportedCalibrationPolicy(String),

    /// Calibration target refers to a source missing from the tree.
    #[error("Source '{0}' not found in calibration sequences")]
    UnknownSource(String),

    /// Resolver value sequence does not pair up with its query sequence.
    #[error("Candidate {candidate} has {queries} query blocks but {values} value blocks")]
    ValueLengthMismatch {
        candidate: usize,
        queries: usize,
        values: usize,
    },

    /// Block tree layout a policy cannot split into named parts.
    #[error("Unsupported block layout: {0}")]
    UnsupportedLayout(String),

    /// `sun-avoidance` requested from a registry without a sun model.
    #[error("Rule 'sun-avoidance' requires a sun model")]
    MissingSunModel,

    /// Sequencer input is not sorted by start time.
    #[error("Sequence must be sorted by start time (block '{0}' is out of order)")]
    UnsortedSequence(String),

    /// An operation needs a block payload the block does not carry.
    #[error("Operation '{operation}' requires a pointing payload, block '{block}' has none")]
    MissingPayload { operation: String, block: String },

    /// No in-block operation is configured for a block subtype.
    #[error("No in-block operation configured for block '{block}' (subtype '{subtype}')")]
    NoInBlockOperation { block: String, subtype: String },

    /// Sequence loader collaborator failed.
    #[error("Sequence loader error: {0}")]
    Loader(String),

    /// TOML configuration parse error.
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON parameter conversion error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error belongs to the configuration family.
    ///
    /// Loader failures are the only errors raised by a collaborator rather
    /// than by a broken schedule definition.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Error::Loader(_))
    }

    pub(crate) fn invalid_rule_params(rule: &str, err: impl std::fmt::Display) -> Self {
        Error::InvalidRuleParams {
            rule: rule.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid_parameter(operation: &str, err: impl std::fmt::Display) -> Self {
        Error::InvalidParameter {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = Error::UnknownRule("foo".into());
        assert_eq!(e.to_string(), "Unknown rule: foo");

        let e = Error::MissingParameter {
            operation: "wrap-up".into(),
            parameter: "az_stow".into(),
        };
        assert!(e.to_string().contains("az_stow"));
    }

    #[test]
    fn test_is_configuration() {
        assert!(Error::UnknownOperation("x".into()).is_configuration());
        assert!(Error::UnsupportedCalibrationPolicy("greedy".into()).is_configuration());
        assert!(Error::UnsupportedLayout("leaf".into()).is_configuration());
        assert!(!Error::Loader("io".into()).is_configuration());
    }
}
