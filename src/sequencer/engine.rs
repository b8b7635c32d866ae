//! Greedy operation sequencer.
//!
//! # Algorithm
//!
//! 1. Check the block sequence is sorted by start time.
//! 2. Run pre-session operations.
//! 3. For each block, plan its pre-block setup on a copy of the state.
//!    If the setup cannot finish before the block ends, drop the block and
//!    leave the state untouched.
//! 4. Otherwise wait until setup must start, commit the setup, run the
//!    in-block scan until the block ends, then the post-block operations.
//! 5. Run post-session operations.
//!
//! # Complexity
//! O(n * p) where n=blocks, p=operations per phase.

use chrono::{DateTime, Utc};
use serde_json::Map;
use tracing::{debug, warn};

use super::operation::{Operation, OperationSpec, SchedPhase, Step};
use super::{SequenceOutcome, SkippedBlock, TimedOperation};
use crate::error::{Error, Result};
use crate::models::tree::is_sorted;
use crate::models::{Block, InstrumentState};

#[derive(Debug, Clone)]
struct PhaseOp {
    op: Operation,
    subtype: Option<String>,
}

impl PhaseOp {
    fn applies_to(&self, block: &Block) -> bool {
        self.subtype.as_deref().map_or(true, |s| s == block.subtype())
    }
}

/// Walks a sorted block sequence and emits timed operations.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use skysched::models::{Block, InstrumentState, Pointing};
/// use skysched::sequencer::{OperationSpec, SchedPhase, Sequencer};
///
/// let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
/// let block = Block::scan("cmb-1", t0, t0 + chrono::Duration::hours(1),
///     Pointing::new(180.0, 60.0, 20.0)).unwrap();
///
/// let sequencer = Sequencer::new(&[
///     OperationSpec::new("preamble", SchedPhase::PreSession),
///     OperationSpec::new("cmb-scan", SchedPhase::InBlock),
/// ]).unwrap();
/// let outcome = sequencer.run(&[block], InstrumentState::new(t0)).unwrap();
/// assert_eq!(outcome.operations.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    pre_session: Vec<PhaseOp>,
    pre_block: Vec<PhaseOp>,
    in_block: Vec<PhaseOp>,
    post_block: Vec<PhaseOp>,
    post_session: Vec<PhaseOp>,
}

impl Sequencer {
    /// Compiles the operation table.
    ///
    /// Fails on the first unknown operation or invalid parameter set.
    pub fn new(specs: &[OperationSpec]) -> Result<Self> {
        let mut sequencer = Self::default();
        for spec in specs {
            let entry = PhaseOp {
                op: Operation::compile(spec)?,
                subtype: spec.subtype.clone(),
            };
            let phase = match spec.phase {
                SchedPhase::PreSession => &mut sequencer.pre_session,
                SchedPhase::PreBlock => &mut sequencer.pre_block,
                SchedPhase::InBlock => &mut sequencer.in_block,
                SchedPhase::PostBlock => &mut sequencer.post_block,
                SchedPhase::PostSession => &mut sequencer.post_session,
            };
            phase.push(entry);
        }
        Ok(sequencer)
    }

    /// Number of compiled operations.
    pub fn len(&self) -> usize {
        self.pre_session.len()
            + self.pre_block.len()
            + self.in_block.len()
            + self.post_block.len()
            + self.post_session.len()
    }

    /// Whether no operation is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequences `blocks`, starting from `state`.
    ///
    /// # Errors
    /// - [`Error::UnsortedSequence`] if `blocks` is not sorted by start time.
    /// - [`Error::NoInBlockOperation`] if a block has no matching in-block
    ///   operation.
    /// - [`Error::MissingPayload`] if a scan operation meets a block without
    ///   a pointing.
    pub fn run(&self, blocks: &[Block], mut state: InstrumentState) -> Result<SequenceOutcome> {
        if !is_sorted(blocks) {
            let culprit = blocks
                .windows(2)
                .find(|w| w[1].t0() < w[0].t0())
                .map(|w| w[1].name().to_string())
                .unwrap_or_default();
            return Err(Error::UnsortedSequence(culprit));
        }

        let mut operations = Vec::new();
        let mut skipped = Vec::new();

        run_phase(&self.pre_session, &mut state, None, &mut operations)?;

        for block in blocks {
            let scan = self
                .in_block
                .iter()
                .find(|p| p.applies_to(block))
                .ok_or_else(|| Error::NoInBlockOperation {
                    block: block.name().to_string(),
                    subtype: block.subtype().to_string(),
                })?;

            // plan setup on a copy at the current clock
            let mut staged = Vec::new();
            let mut trial = state.clone();
            run_phase(&self.pre_block, &mut trial, Some(block), &mut staged)?;
            let setup = trial.current_time - state.current_time;
            debug!(
                block = block.name(),
                setup_secs = setup.num_seconds(),
                "planning block"
            );

            if trial.current_time > block.t1() {
                warn!(
                    block = block.name(),
                    setup_secs = setup.num_seconds(),
                    "skipped: insufficient time for setup"
                );
                skipped.push(skip(block, &state, setup));
                continue;
            }

            // start setup as late as possible; replan so time-dependent
            // operations see the real clock
            let setup_start = block
                .t0()
                .checked_sub_signed(setup)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let mut wait = None;
            if setup_start > state.current_time {
                staged.clear();
                trial = state.clone();
                trial.current_time = setup_start;
                run_phase(&self.pre_block, &mut trial, Some(block), &mut staged)?;
                if trial.current_time > block.t1() {
                    warn!(block = block.name(), "skipped: setup grew past block end");
                    skipped.push(skip(block, &state, trial.current_time - setup_start));
                    continue;
                }
                wait = Some(wait_until(&state, setup_start, block));
            }

            operations.extend(wait);
            operations.extend(staged);
            state = trial;

            run_op(&scan.op, &mut state, Some(block), &mut operations)?;
            run_phase(&self.post_block, &mut state, Some(block), &mut operations)?;
        }

        run_phase(&self.post_session, &mut state, None, &mut operations)?;

        Ok(SequenceOutcome {
            operations,
            skipped,
            final_state: state,
        })
    }
}

fn run_phase(
    ops: &[PhaseOp],
    state: &mut InstrumentState,
    block: Option<&Block>,
    out: &mut Vec<TimedOperation>,
) -> Result<()> {
    for p in ops {
        if block.map_or(true, |b| p.applies_to(b)) {
            run_op(&p.op, state, block, out)?;
        }
    }
    Ok(())
}

fn run_op(
    op: &Operation,
    state: &mut InstrumentState,
    block: Option<&Block>,
    out: &mut Vec<TimedOperation>,
) -> Result<()> {
    for step in op.execute(state, block)? {
        out.push(place(step, state, block)?);
    }
    Ok(())
}

/// Places a step at the current clock and advances the clock.
///
/// Fails if the step would run past the calendar range.
fn place(step: Step, state: &mut InstrumentState, block: Option<&Block>) -> Result<TimedOperation> {
    let start = state.current_time;
    let end = start.checked_add_signed(step.duration).ok_or_else(|| {
        Error::invalid_parameter(
            step.name,
            format!("duration of {}s runs past the calendar range", step.duration.num_seconds()),
        )
    })?;
    state.current_time = end;
    Ok(TimedOperation {
        name: step.name.to_string(),
        start,
        end,
        params: step.params,
        block: block.map(|b| b.name().to_string()),
    })
}

fn wait_until(state: &InstrumentState, until: DateTime<Utc>, block: &Block) -> TimedOperation {
    let mut params = Map::new();
    params.insert("until".into(), until.to_rfc3339().into());
    TimedOperation {
        name: "wait-until".into(),
        start: state.current_time,
        end: until,
        params,
        block: Some(block.name().to_string()),
    }
}

fn skip(block: &Block, state: &InstrumentState, setup: chrono::Duration) -> SkippedBlock {
    SkippedBlock {
        block: block.clone(),
        available_at: state.current_time,
        setup_secs: setup.num_milliseconds() as f64 / 1000.0,
    }
}
