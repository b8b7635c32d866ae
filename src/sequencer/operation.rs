//! Operation specs and the typed operation table.
//!
//! An [`OperationSpec`] is the configuration surface: a name, a phase, an
//! optional block subtype filter and a flat parameter map. Specs are
//! compiled into [`Operation`] values before any block is sequenced, so an
//! unknown name or a missing parameter fails the run up front.
//!
//! # Operations
//!
//! | Name | Phase | Default duration |
//! |------|-------|------------------|
//! | `preamble` | session | 0 |
//! | `start-time` | session | 0 |
//! | `set-scan-params` | any | 0 |
//! | `ufm-relock` | any | 15 min, every 12 h |
//! | `det-setup` | block | 60 s |
//! | `hwp-spin-up` | any | 20 min |
//! | `hwp-spin-down` | any | 10 min |
//! | `setup-boresight` | block | 0 |
//! | `cmb-scan`, `source-scan` | in-block | block remainder |
//! | `bias-step`, `bias-det` | any | 60 s |
//! | `wrap-up` | any | 0 |
//!
//! Operations whose trigger condition does not hold emit nothing.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{seconds, Block, InstrumentState};

/// Scheduling phase of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedPhase {
    /// Once, before the first block.
    PreSession,
    /// Before each block (conditional setup).
    PreBlock,
    /// The block itself.
    InBlock,
    /// After each block.
    PostBlock,
    /// Once, after the last block.
    PostSession,
}

impl SchedPhase {
    /// Whether operations of this phase run against a block.
    pub fn is_block_phase(self) -> bool {
        matches!(
            self,
            SchedPhase::PreBlock | SchedPhase::InBlock | SchedPhase::PostBlock
        )
    }
}

/// One entry of the operation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    /// Registry name (e.g. "det-setup").
    pub name: String,
    /// Phase the operation runs in.
    pub phase: SchedPhase,
    /// Restricts block phases to blocks of this subtype (e.g. "cal").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Operation parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl OperationSpec {
    /// Creates a spec without parameters.
    pub fn new(name: impl Into<String>, phase: SchedPhase) -> Self {
        Self {
            name: name.into(),
            phase,
            subtype: None,
            params: Map::new(),
        }
    }

    /// Restricts the spec to blocks of `subtype`.
    pub fn for_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// A compiled, typed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Preamble,
    StartTime,
    SetScanParams {
        az_speed: f64,
        az_accel: f64,
    },
    UfmRelock {
        interval: Duration,
        duration: Duration,
    },
    DetSetup {
        disable_hwp: bool,
        iv_cadence: Option<Duration>,
        duration: Duration,
        spin_down: Duration,
        spin_up: Duration,
    },
    HwpSpinUp {
        disable_hwp: bool,
        duration: Duration,
    },
    HwpSpinDown {
        disable_hwp: bool,
        duration: Duration,
    },
    SetupBoresight {
        apply_boresight_rot: bool,
        duration: Duration,
    },
    CmbScan,
    SourceScan,
    BiasStep {
        duration: Duration,
    },
    BiasDet {
        duration: Duration,
    },
    WrapUp {
        az_stow: f64,
        el_stow: f64,
    },
}

/// An emitted step before it is placed on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
    pub name: &'static str,
    pub duration: Duration,
    pub params: Map<String, Value>,
}

impl Step {
    fn new(name: &'static str, duration: Duration) -> Self {
        Self {
            name,
            duration,
            params: Map::new(),
        }
    }

    fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

const HWP_SPIN_UP_SECS: f64 = 20.0 * 60.0;
const HWP_SPIN_DOWN_SECS: f64 = 10.0 * 60.0;
const RELOCK_INTERVAL_SECS: f64 = 12.0 * 3600.0;
const RELOCK_SECS: f64 = 15.0 * 60.0;
const DET_SETUP_SECS: f64 = 60.0;
const BIAS_SECS: f64 = 60.0;

fn default_hwp_up() -> f64 {
    HWP_SPIN_UP_SECS
}

fn default_hwp_down() -> f64 {
    HWP_SPIN_DOWN_SECS
}

fn default_relock_interval() -> f64 {
    RELOCK_INTERVAL_SECS
}

fn default_relock() -> f64 {
    RELOCK_SECS
}

fn default_det_setup() -> f64 {
    DET_SETUP_SECS
}

fn default_bias() -> f64 {
    BIAS_SECS
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ScanParams {
    az_speed: f64,
    az_accel: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RelockParams {
    #[serde(default = "default_relock_interval")]
    interval: f64,
    #[serde(default = "default_relock")]
    duration: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DetSetupParams {
    #[serde(default)]
    disable_hwp: bool,
    #[serde(default)]
    iv_cadence: Option<f64>,
    #[serde(default = "default_det_setup")]
    duration: f64,
    #[serde(default = "default_hwp_down")]
    spin_down: f64,
    #[serde(default = "default_hwp_up")]
    spin_up: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HwpUpParams {
    #[serde(default)]
    disable_hwp: bool,
    #[serde(default = "default_hwp_up")]
    duration: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HwpDownParams {
    #[serde(default)]
    disable_hwp: bool,
    #[serde(default = "default_hwp_down")]
    duration: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BoresightParams {
    #[serde(default = "default_true")]
    apply_boresight_rot: bool,
    #[serde(default)]
    duration: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BiasParams {
    #[serde(default = "default_bias")]
    duration: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WrapUpParams {
    az_stow: f64,
    el_stow: f64,
}

fn require(spec: &OperationSpec, keys: &[&str]) -> Result<()> {
    match keys.iter().find(|k| !spec.params.contains_key(**k)) {
        Some(missing) => Err(Error::MissingParameter {
            operation: spec.name.clone(),
            parameter: missing.to_string(),
        }),
        None => Ok(()),
    }
}

fn parse<T: DeserializeOwned>(spec: &OperationSpec) -> Result<T> {
    serde_json::from_value(Value::Object(spec.params.clone()))
        .map_err(|e| Error::invalid_parameter(&spec.name, e))
}

fn duration(spec: &OperationSpec, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(Error::invalid_parameter(
            &spec.name,
            format!("durations must be non-negative, got {secs}"),
        ));
    }
    Ok(seconds(secs))
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

impl Operation {
    /// Registry names.
    pub const NAMES: &'static [&'static str] = &[
        "preamble",
        "start-time",
        "set-scan-params",
        "ufm-relock",
        "det-setup",
        "hwp-spin-up",
        "hwp-spin-down",
        "setup-boresight",
        "cmb-scan",
        "source-scan",
        "bias-step",
        "bias-det",
        "wrap-up",
    ];

    /// Compiles a spec into a typed operation.
    pub fn compile(spec: &OperationSpec) -> Result<Self> {
        let op = match spec.name.as_str() {
            "preamble" => {
                parse::<NoParams>(spec)?;
                Operation::Preamble
            }
            "start-time" => {
                parse::<NoParams>(spec)?;
                Operation::StartTime
            }
            "set-scan-params" => {
                require(spec, &["az_speed", "az_accel"])?;
                let p: ScanParams = parse(spec)?;
                Operation::SetScanParams {
                    az_speed: p.az_speed,
                    az_accel: p.az_accel,
                }
            }
            "ufm-relock" => {
                let p: RelockParams = parse(spec)?;
                Operation::UfmRelock {
                    interval: duration(spec, p.interval)?,
                    duration: duration(spec, p.duration)?,
                }
            }
            "det-setup" => {
                let p: DetSetupParams = parse(spec)?;
                Operation::DetSetup {
                    disable_hwp: p.disable_hwp,
                    iv_cadence: p.iv_cadence.map(|c| duration(spec, c)).transpose()?,
                    duration: duration(spec, p.duration)?,
                    spin_down: duration(spec, p.spin_down)?,
                    spin_up: duration(spec, p.spin_up)?,
                }
            }
            "hwp-spin-up" => {
                let p: HwpUpParams = parse(spec)?;
                Operation::HwpSpinUp {
                    disable_hwp: p.disable_hwp,
                    duration: duration(spec, p.duration)?,
                }
            }
            "hwp-spin-down" => {
                let p: HwpDownParams = parse(spec)?;
                Operation::HwpSpinDown {
                    disable_hwp: p.disable_hwp,
                    duration: duration(spec, p.duration)?,
                }
            }
            "setup-boresight" => {
                let p: BoresightParams = parse(spec)?;
                Operation::SetupBoresight {
                    apply_boresight_rot: p.apply_boresight_rot,
                    duration: duration(spec, p.duration)?,
                }
            }
            "cmb-scan" => {
                parse::<NoParams>(spec)?;
                Operation::CmbScan
            }
            "source-scan" => {
                parse::<NoParams>(spec)?;
                Operation::SourceScan
            }
            "bias-step" => {
                let p: BiasParams = parse(spec)?;
                Operation::BiasStep {
                    duration: duration(spec, p.duration)?,
                }
            }
            "bias-det" => {
                let p: BiasParams = parse(spec)?;
                Operation::BiasDet {
                    duration: duration(spec, p.duration)?,
                }
            }
            "wrap-up" => {
                require(spec, &["az_stow", "el_stow"])?;
                let p: WrapUpParams = parse(spec)?;
                Operation::WrapUp {
                    az_stow: p.az_stow,
                    el_stow: p.el_stow,
                }
            }
            other => return Err(Error::UnknownOperation(other.to_string())),
        };

        if op.needs_block() && !spec.phase.is_block_phase() {
            return Err(Error::invalid_parameter(
                &spec.name,
                format!("needs a block and cannot run in phase {:?}", spec.phase),
            ));
        }
        if op.is_scan() != (spec.phase == SchedPhase::InBlock) {
            return Err(Error::invalid_parameter(
                &spec.name,
                "scan operations run in-block, and only scan operations do",
            ));
        }
        Ok(op)
    }

    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Preamble => "preamble",
            Operation::StartTime => "start-time",
            Operation::SetScanParams { .. } => "set-scan-params",
            Operation::UfmRelock { .. } => "ufm-relock",
            Operation::DetSetup { .. } => "det-setup",
            Operation::HwpSpinUp { .. } => "hwp-spin-up",
            Operation::HwpSpinDown { .. } => "hwp-spin-down",
            Operation::SetupBoresight { .. } => "setup-boresight",
            Operation::CmbScan => "cmb-scan",
            Operation::SourceScan => "source-scan",
            Operation::BiasStep { .. } => "bias-step",
            Operation::BiasDet { .. } => "bias-det",
            Operation::WrapUp { .. } => "wrap-up",
        }
    }

    /// Whether the operation reads the current block.
    pub fn needs_block(&self) -> bool {
        matches!(
            self,
            Operation::DetSetup { .. }
                | Operation::SetupBoresight { .. }
                | Operation::CmbScan
                | Operation::SourceScan
        )
    }

    /// Whether this is an in-block scan operation.
    pub fn is_scan(&self) -> bool {
        matches!(self, Operation::CmbScan | Operation::SourceScan)
    }

    /// Runs the operation against `state`, returning the steps it emits.
    ///
    /// Time checks read `state.current_time`; the caller advances the clock
    /// by the emitted durations.
    pub(crate) fn execute(
        &self,
        state: &mut InstrumentState,
        block: Option<&Block>,
    ) -> Result<Vec<Step>> {
        let now = state.current_time;
        let steps = match self {
            Operation::Preamble => vec![Step::new("preamble", Duration::zero())],
            Operation::StartTime => {
                vec![Step::new("start-time", Duration::zero()).param("time", rfc3339(now))]
            }
            Operation::SetScanParams { az_speed, az_accel } => {
                if state.az_speed_now == Some(*az_speed) && state.az_accel_now == Some(*az_accel) {
                    return Ok(Vec::new());
                }
                state.az_speed_now = Some(*az_speed);
                state.az_accel_now = Some(*az_accel);
                vec![Step::new("set-scan-params", Duration::zero())
                    .param("az_speed", *az_speed)
                    .param("az_accel", *az_accel)]
            }
            Operation::UfmRelock { interval, duration } => {
                let due = state.last_relock_time.map_or(true, |last| now - last > *interval);
                if !due {
                    return Ok(Vec::new());
                }
                state.last_relock_time = Some(now);
                vec![Step::new("ufm-relock", *duration)]
            }
            Operation::HwpSpinUp {
                disable_hwp,
                duration,
            } => spin_up(state, *disable_hwp, *duration).into_iter().collect(),
            Operation::HwpSpinDown {
                disable_hwp,
                duration,
            } => spin_down(state, *disable_hwp, *duration).into_iter().collect(),
            Operation::DetSetup {
                disable_hwp,
                iv_cadence,
                duration,
                spin_down: down,
                spin_up: up,
            } => {
                let block = self.block(block)?;
                let pointing = block.pointing();
                let moved = pointing.is_some_and(|p| p.differs_from(state.az_now, state.alt_now));
                let stale = match (state.last_det_setup, iv_cadence) {
                    (None, _) => true,
                    (Some(last), Some(cadence)) => now - last >= *cadence,
                    (Some(_), None) => false,
                };
                if !(moved || stale || block.is_calibration()) {
                    return Ok(Vec::new());
                }

                let was_spinning = state.hwp_spinning;
                let mut steps: Vec<Step> = spin_down(state, *disable_hwp, *down).into_iter().collect();
                let mut setup = Step::new("det-setup", *duration);
                if let Some(p) = pointing {
                    state.point_to(p.az, p.alt);
                    setup = setup.param("az", p.az).param("alt", p.alt);
                }
                state.last_det_setup = Some(now);
                steps.push(setup);
                if was_spinning {
                    steps.extend(spin_up(state, *disable_hwp, *up));
                }
                steps
            }
            Operation::SetupBoresight {
                apply_boresight_rot,
                duration,
            } => {
                let block = self.block(block)?;
                let Some(p) = block.pointing() else {
                    return Ok(Vec::new());
                };
                let mut step = Step::new("setup-boresight", *duration);
                let mut changed = false;
                if let (true, Some(rot)) = (*apply_boresight_rot, p.boresight_rot) {
                    if rot != state.boresight_rot_now {
                        state.boresight_rot_now = rot;
                        step = step.param("boresight", rot);
                        changed = true;
                    }
                }
                if p.differs_from(state.az_now, state.alt_now) {
                    state.point_to(p.az, p.alt);
                    step = step.param("az", p.az).param("alt", p.alt);
                    changed = true;
                }
                if changed {
                    vec![step]
                } else {
                    Vec::new()
                }
            }
            Operation::CmbScan | Operation::SourceScan => {
                let block = self.block(block)?;
                let p = block.pointing().ok_or_else(|| Error::MissingPayload {
                    operation: self.name().to_string(),
                    block: block.name().to_string(),
                })?;
                state.point_to(p.az, p.alt);
                let remaining = (block.t1() - now).max(Duration::zero());
                vec![Step::new(self.name(), remaining)
                    .param("description", block.name())
                    .param("stop_time", rfc3339(block.t1()))
                    .param("az", p.az)
                    .param("alt", p.alt)
                    .param("width", p.throw)
                    .param("az_drift", p.az_drift)
                    .param("subtype", block.subtype())
                    .param("tag", block.tag())]
            }
            Operation::BiasStep { duration } => vec![Step::new("bias-step", *duration)],
            Operation::BiasDet { duration } => vec![Step::new("bias-det", *duration)],
            Operation::WrapUp { az_stow, el_stow } => {
                state.point_to(*az_stow, *el_stow);
                vec![Step::new("wrap-up", Duration::zero())
                    .param("az", *az_stow)
                    .param("alt", *el_stow)]
            }
        };
        Ok(steps)
    }

    fn block<'a>(&self, block: Option<&'a Block>) -> Result<&'a Block> {
        block.ok_or_else(|| Error::MissingPayload {
            operation: self.name().to_string(),
            block: "<session>".to_string(),
        })
    }
}

fn spin_up(state: &mut InstrumentState, disable_hwp: bool, duration: Duration) -> Option<Step> {
    if disable_hwp || state.hwp_spinning {
        return None;
    }
    state.hwp_spinning = true;
    Some(Step::new("hwp-spin-up", duration))
}

fn spin_down(state: &mut InstrumentState, disable_hwp: bool, duration: Duration) -> Option<Step> {
    if disable_hwp || !state.hwp_spinning {
        return None;
    }
    state.hwp_spinning = false;
    Some(Step::new("hwp-spin-down", duration))
}
