use crate::{
    merge::engine,
    pipeline::{DocVar, PipelineOp},
    result::Result,
};
use log::trace;
use thiserror::Error;

#[cfg(test)]
mod test;

/// Replacing the pending patch is only legal while no patched stages are
/// buffered; hitting this is a defect in the caller, not a user condition.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PatchError {
    #[error("cannot replace the pending patch while patched stages remain unconsumed")]
    NonEmpty,
}

/// A deferred, composable rewrite of field references. Merging relocates
/// fields, but the stages that referenced them may not have been seen
/// yet, so the rewrite travels down the lane as a patch instead.
#[derive(PartialEq, Debug, Clone, Default)]
pub enum Patch {
    #[default]
    Id,
    Rename(DocVar, DocVar),
    Then(Box<Patch>, Box<Patch>),
    And(Box<Patch>, Box<Patch>),
}

const MAX_SIMPLIFY_PASSES: usize = 32;

impl Patch {
    pub fn is_id(&self) -> bool {
        matches!(self, Patch::Id)
    }

    /// Sequential composition: apply `first`, then `second`.
    pub fn then(first: Patch, second: Patch) -> Patch {
        match (first, second) {
            (Patch::Id, p) | (p, Patch::Id) => p,
            (a, b) => Patch::Then(Box::new(a), Box::new(b)),
        }
    }

    /// Parallel composition: two patches derived from branching. Applying
    /// it resynchronizes the branches through the merge engine when both
    /// leave non-trivial remainders.
    pub fn and(left: Patch, right: Patch) -> Patch {
        if left.is_id() && right.is_id() {
            Patch::Id
        } else {
            Patch::And(Box::new(left), Box::new(right))
        }
    }

    /// Collapses Id composition and duplicated branches, iterated to a
    /// fixed point with a pass cap.
    pub fn simplify(self) -> Patch {
        let mut current = self;
        for _ in 0..MAX_SIMPLIFY_PASSES {
            let (next, changed) = current.simplify_once();
            current = next;
            if !changed {
                break;
            }
        }
        current
    }

    fn simplify_once(self) -> (Patch, bool) {
        match self {
            Patch::Then(first, second) => {
                let (first, c1) = first.simplify_once();
                let (second, c2) = second.simplify_once();
                if first.is_id() {
                    (second, true)
                } else if second.is_id() {
                    (first, true)
                } else {
                    (Patch::Then(Box::new(first), Box::new(second)), c1 || c2)
                }
            }
            Patch::And(left, right) => {
                let (left, c1) = left.simplify_once();
                let (right, c2) = right.simplify_once();
                if left.is_id() && right.is_id() {
                    (Patch::Id, true)
                } else if left == right {
                    (left, true)
                } else {
                    (Patch::And(Box::new(left), Box::new(right)), c1 || c2)
                }
            }
            p => (p, false),
        }
    }

    /// Rewrites every field reference inside `op`. Project and Group
    /// absorb a rename completely; all other stages are rewritten but the
    /// rename stays pending for whatever follows them, since they do not
    /// own the document shape. The returned list replaces the stage: a
    /// patch application may expand one stage into several.
    pub fn apply(&self, op: PipelineOp) -> Result<(Vec<PipelineOp>, Patch)> {
        match self {
            Patch::Id => Ok((vec![op], Patch::Id)),
            Patch::Rename(from, to) => {
                let consumed = op.consumes_rename();
                let renamed = op.rewrite_refs(&|var: DocVar| var.rename(from, to));
                let residual = if consumed { Patch::Id } else { self.clone() };
                Ok((vec![renamed], residual))
            }
            Patch::Then(first, second) => {
                let (ops, first_residual) = first.apply(op)?;
                let (ops, second_residual) = second.apply_all(ops)?;
                Ok((ops, Patch::then(first_residual, second_residual)))
            }
            Patch::And(left, right) => {
                let (left_ops, left_residual) = left.apply(op.clone())?;
                let (right_ops, right_residual) = right.apply(op)?;
                if left_residual.is_id() && right_residual.is_id() && left_ops == right_ops {
                    return Ok((left_ops, Patch::Id));
                }
                trace!("resynchronizing branch patches through the merge engine");
                let merged =
                    engine::merge_patched(left_ops, left_residual, right_ops, right_residual)?;
                Ok((
                    merged.ops,
                    Patch::and(merged.left_patch, merged.right_patch),
                ))
            }
        }
    }

    /// Folds `apply` across a stage sequence, threading the residual from
    /// each stage into the next.
    pub fn apply_all(&self, ops: Vec<PipelineOp>) -> Result<(Vec<PipelineOp>, Patch)> {
        let mut patch = self.clone();
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            let (mut produced, residual) = patch.apply(op)?;
            out.append(&mut produced);
            patch = residual;
        }
        Ok((out, patch))
    }
}
