use crate::{
    merge::{merge_ops, Error as MergeError, MergeResult},
    patch::Patch,
    pipeline::{schema::Schema, PipelineOp},
    result::{Error, Result},
};
use log::debug;
use std::collections::VecDeque;

/// The result of fusing two pipelines: one merged stage sequence plus the
/// residual patch each original side still owes to anything composed
/// after it.
#[derive(Debug, PartialEq, Clone)]
pub struct Merged {
    pub ops: Vec<PipelineOp>,
    pub left_patch: Patch,
    pub right_patch: Patch,
}

/// One side of an in-progress merge: stages that have already been
/// patched but not yet emitted, the raw stages behind them, the patch
/// pending for those raw stages, and the accumulated shape approximation.
/// Lanes are created per merge call and discarded on completion.
#[derive(Debug, Clone)]
pub(crate) struct Lane {
    prefix: VecDeque<PipelineOp>,
    rest: VecDeque<PipelineOp>,
    pending: Patch,
    schema: Schema,
}

impl Lane {
    fn new(ops: Vec<PipelineOp>, pending: Patch) -> Self {
        Lane {
            prefix: VecDeque::new(),
            rest: ops.into(),
            pending,
            schema: Schema::Init,
        }
    }

    /// A lane whose stages have already had their patches applied; the
    /// pending patch covers only what comes after them.
    fn patched(ops: Vec<PipelineOp>, pending: Patch) -> Self {
        Lane {
            prefix: ops.into(),
            rest: VecDeque::new(),
            pending,
            schema: Schema::Init,
        }
    }

    fn refill(&mut self) -> Result<()> {
        while self.prefix.is_empty() {
            match self.rest.pop_front() {
                None => break,
                Some(op) => {
                    let (ops, residual) = self.pending.apply(op)?;
                    self.prefix.extend(ops);
                    self.pending = residual;
                }
            }
        }
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.prefix.is_empty() && self.rest.is_empty()
    }

    /// Detaches one patched stage from the front, folding it into the
    /// lane's schema.
    fn patched_head(&mut self) -> Result<Option<PipelineOp>> {
        self.refill()?;
        Ok(self.prefix.pop_front().map(|op| {
            self.schema.accumulate(&op);
            op
        }))
    }

    fn push_back(&mut self, op: PipelineOp) {
        self.prefix.push_front(op);
    }

    /// Routes a residual patch from the rule table into this lane: the
    /// already-patched prefix is rewritten now, and whatever the prefix
    /// does not consume composes onto the pending patch for the raw rest.
    fn apply_patch(&mut self, patch: Patch) -> Result<()> {
        if patch.is_id() {
            return Ok(());
        }
        let staged: Vec<PipelineOp> = self.prefix.drain(..).collect();
        let (staged, residual) = patch.apply_all(staged)?;
        self.prefix = staged.into();
        let pending = std::mem::replace(&mut self.pending, Patch::Id);
        self.pending = Patch::then(pending, residual);
        Ok(())
    }

    fn remaining(&self) -> Vec<PipelineOp> {
        self.prefix.iter().chain(self.rest.iter()).cloned().collect()
    }

    fn len(&self) -> usize {
        self.prefix.len() + self.rest.len()
    }
}

/// Fuses two raw stage sequences, each with a pending patch (normally the
/// identity), into one equivalent sequence.
pub fn merge_pipelines(
    left: Vec<PipelineOp>,
    left_patch: Patch,
    right: Vec<PipelineOp>,
    right_patch: Patch,
) -> Result<Merged> {
    merge_lanes(Lane::new(left, left_patch), Lane::new(right, right_patch))
}

/// Like `merge_pipelines`, but the stage lists have already been patched
/// and the patches cover only what follows them. This is the entry used
/// by the builder and by `And`-patch resynchronization.
pub(crate) fn merge_patched(
    left: Vec<PipelineOp>,
    left_patch: Patch,
    right: Vec<PipelineOp>,
    right_patch: Patch,
) -> Result<Merged> {
    merge_lanes(
        Lane::patched(left, left_patch),
        Lane::patched(right, right_patch),
    )
}

const STEP_FUEL_BASE: usize = 64;

fn merge_lanes(mut left: Lane, mut right: Lane) -> Result<Merged> {
    let mut merged: Vec<PipelineOp> = Vec::new();
    // Every step either emits a stage or makes one lane strictly shorter,
    // so this bound is generous; exceeding it means the rule table and the
    // engine disagree about progress.
    let mut fuel = STEP_FUEL_BASE + 8 * (left.len() + right.len());

    loop {
        if fuel == 0 {
            return Err(stalled(merged, &left, &right));
        }
        fuel -= 1;

        if let Err(e) = left.refill() {
            return Err(mid_merge(e, merged, &left, &right));
        }
        if let Err(e) = right.refill() {
            return Err(mid_merge(e, merged, &left, &right));
        }
        if left.is_exhausted() && right.is_exhausted() {
            break;
        }

        // An Out stage on either side short-circuits the whole merge:
        // everything after it is unreachable.
        let left_out = matches!(left.prefix.front(), Some(PipelineOp::Out(_)));
        let right_out = matches!(right.prefix.front(), Some(PipelineOp::Out(_)));
        if left_out || right_out {
            return finish_with_out(merged, left, right, left_out, right_out);
        }

        // An exhausted lane is represented by the implicit projection of
        // its accumulated schema, so the rule table always sees two
        // concrete stages. With no schema to project, the other lane
        // simply drains.
        let mut left_synth: Option<Patch> = None;
        let mut right_synth: Option<Patch> = None;

        let lhead = if left.is_exhausted() {
            match synthesize(&mut left) {
                Ok(Some((op, residual))) => {
                    left_synth = Some(residual);
                    op
                }
                Ok(None) => {
                    if let Err(e) = drain_into(&mut merged, &mut right) {
                        return Err(mid_merge(e, merged, &left, &right));
                    }
                    break;
                }
                Err(Synthesized::Materialized) => continue,
                Err(Synthesized::Failed(e)) => return Err(mid_merge(e, merged, &left, &right)),
            }
        } else {
            match left.patched_head() {
                Ok(Some(op)) => op,
                Ok(None) => continue,
                Err(e) => return Err(mid_merge(e, merged, &left, &right)),
            }
        };

        let rhead = if right.is_exhausted() {
            match synthesize(&mut right) {
                Ok(Some((op, residual))) => {
                    right_synth = Some(residual);
                    op
                }
                Ok(None) => {
                    // The left head goes back where it came from; the
                    // right lane has nothing left to offer, so the left
                    // lane drains.
                    if left_synth.is_none() {
                        left.push_back(lhead);
                    }
                    if let Err(e) = drain_into(&mut merged, &mut left) {
                        return Err(mid_merge(e, merged, &left, &right));
                    }
                    break;
                }
                Err(Synthesized::Materialized) => {
                    if left_synth.is_none() {
                        left.push_back(lhead);
                    }
                    continue;
                }
                Err(Synthesized::Failed(e)) => return Err(mid_merge(e, merged, &left, &right)),
            }
        } else {
            match right.patched_head() {
                Ok(Some(op)) => op,
                Ok(None) => {
                    if left_synth.is_none() {
                        left.push_back(lhead);
                    }
                    continue;
                }
                Err(e) => return Err(mid_merge(e, merged, &left, &right)),
            }
        };

        debug!("merging {:?} with {:?}", lhead.op_name(), rhead.op_name());
        let outcome = merge_ops(lhead.clone(), rhead.clone())?;

        let (ops, left_patch, right_patch, consumed_left, consumed_right) = match outcome {
            MergeResult::LeftWins {
                ops,
                left_patch,
                right_patch,
            } => (ops, left_patch, right_patch, true, false),
            MergeResult::RightWins {
                ops,
                left_patch,
                right_patch,
            } => (ops, left_patch, right_patch, false, true),
            MergeResult::BothFused {
                ops,
                left_patch,
                right_patch,
            } => (ops, left_patch, right_patch, true, true),
        };
        merged.extend(ops);

        settle(&mut left, lhead, left_synth, consumed_left);
        settle(&mut right, rhead, right_synth, consumed_right);

        if let Err(e) = left.apply_patch(left_patch) {
            return Err(mid_merge(e, merged, &left, &right));
        }
        if let Err(e) = right.apply_patch(right_patch) {
            return Err(mid_merge(e, merged, &left, &right));
        }
    }

    Ok(Merged {
        ops: merged,
        left_patch: left.pending.simplify(),
        right_patch: right.pending.simplify(),
    })
}

enum Synthesized {
    /// The pending patch expanded the implicit projection into several
    /// stages; they were committed to the lane, which is no longer
    /// exhausted.
    Materialized,
    Failed(Error),
}

// Builds the implicit projection for an exhausted lane, pushed through the
// lane's pending patch so the comparison sees up-to-date references. The
// residual is committed only if the rule consumes the projection.
fn synthesize(lane: &mut Lane) -> std::result::Result<Option<(PipelineOp, Patch)>, Synthesized> {
    let synth = match lane.schema.to_project() {
        None => return Ok(None),
        Some(op) => op,
    };
    let (mut ops, residual) = lane
        .pending
        .apply(synth)
        .map_err(Synthesized::Failed)?;
    if ops.len() == 1 {
        match ops.pop() {
            Some(op) => Ok(Some((op, residual))),
            None => Ok(None),
        }
    } else {
        lane.prefix = ops.into();
        lane.pending = residual;
        lane.schema = Schema::Init;
        Err(Synthesized::Materialized)
    }
}

// Puts a lane back in order after a rule has run: a consumed synthesized
// head commits its residual and clears the schema it came from; an
// unconsumed real head is pushed back for the next comparison; an
// unconsumed synthesized head is simply dropped and will be regenerated.
fn settle(lane: &mut Lane, head: PipelineOp, synth: Option<Patch>, consumed: bool) {
    match (synth, consumed) {
        (Some(residual), true) => {
            lane.pending = residual;
            lane.schema = Schema::Init;
        }
        (Some(_), false) => {}
        (None, true) => {}
        (None, false) => lane.push_back(head),
    }
}

fn drain_into(merged: &mut Vec<PipelineOp>, lane: &mut Lane) -> Result<()> {
    while let Some(op) = lane.patched_head()? {
        merged.push(op);
    }
    Ok(())
}

fn finish_with_out(
    mut merged: Vec<PipelineOp>,
    mut left: Lane,
    mut right: Lane,
    left_out: bool,
    right_out: bool,
) -> Result<Merged> {
    let lhead = if left_out { left.patched_head()? } else { None };
    let rhead = if right_out { right.patched_head()? } else { None };
    match (lhead, rhead) {
        (Some(l), Some(r)) => {
            if l == r {
                merged.push(l);
            } else {
                return Err(MergeError::OpMerge {
                    left: l,
                    right: r,
                    hint: Some("the branches write to different output collections".to_string()),
                }
                .into());
            }
        }
        (Some(l), None) => merged.push(l),
        (None, Some(r)) => merged.push(r),
        (None, None) => {}
    }
    debug!("out stage short-circuits the pipeline merge");
    Ok(Merged {
        ops: merged,
        left_patch: left.pending.simplify(),
        right_patch: right.pending.simplify(),
    })
}

fn stalled(merged: Vec<PipelineOp>, left: &Lane, right: &Lane) -> Error {
    MergeError::PipelineMerge {
        merged,
        left_rest: left.remaining(),
        right_rest: right.remaining(),
        hint: Some("the merge did not reach a fixpoint".to_string()),
    }
    .into()
}

// A failure inside patch application mid-fixpoint keeps the partial merge
// for diagnostics; a rule-table error already identifies its stage pair
// and passes through untouched.
fn mid_merge(err: Error, merged: Vec<PipelineOp>, left: &Lane, right: &Lane) -> Error {
    match err {
        Error::Merge(MergeError::PipelineMerge { .. }) => err,
        other => MergeError::PipelineMerge {
            merged,
            left_rest: left.remaining(),
            right_rest: right.remaining(),
            hint: Some(other.to_string()),
        }
        .into(),
    }
}
