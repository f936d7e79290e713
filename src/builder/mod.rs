use crate::{
    merge::engine::{self, Merged},
    patch::{Patch, PatchError},
    pipeline::{schema::Schema, PipelineOp},
    result::Result,
};


/// The incremental, caller-facing surface over the merge engine. A
/// builder accumulates patched stages, the patch still pending for
/// whatever is appended next, and the shape approximation the engine
/// needs to mint collision-free names.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<PipelineOp>,
    pending: Patch,
    schema: Schema,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the pending patch to `op` and pushes the result.
    pub fn append(mut self, op: PipelineOp) -> Result<Self> {
        let (ops, residual) = self.pending.apply(op)?;
        for op in &ops {
            self.schema.accumulate(op);
        }
        self.stages.extend(ops);
        self.pending = residual;
        Ok(self)
    }

    pub fn append_all(self, ops: Vec<PipelineOp>) -> Result<Self> {
        let mut builder = self;
        for op in ops {
            builder = builder.append(op)?;
        }
        Ok(builder)
    }

    /// Sequential composition: every stage of `other` runs after every
    /// stage of `self`, so this builder's pending patch is threaded
    /// across all of them and the remainders compose. The fixpoint engine
    /// is not involved.
    pub fn fby(mut self, other: PipelineBuilder) -> Result<Self> {
        let (ops, residual) = self.pending.apply_all(other.stages)?;
        for op in &ops {
            self.schema.accumulate(op);
        }
        self.stages.extend(ops);
        self.pending = Patch::then(other.pending, residual).simplify();
        Ok(self)
    }

    /// Parallel composition: either side's stages may need interleaving
    /// or renaming, so both sequences go through the fixpoint engine. The
    /// new pending patch is the parallel composition of both sides'
    /// residuals.
    pub fn merge(self, other: PipelineBuilder) -> Result<Self> {
        let Merged {
            ops,
            left_patch,
            right_patch,
        } = engine::merge_patched(self.stages, self.pending, other.stages, other.pending)?;
        let mut schema = Schema::Init;
        for op in &ops {
            schema.accumulate(op);
        }
        Ok(PipelineBuilder {
            stages: ops,
            pending: Patch::and(left_patch, right_patch).simplify(),
            schema,
        })
    }

    /// Replaces the pending patch. Only legal while nothing has been
    /// buffered; anything else would silently skip the replaced patch for
    /// the stages already accumulated.
    pub fn with_patch(mut self, patch: Patch) -> std::result::Result<Self, PatchError> {
        if !self.stages.is_empty() {
            return Err(PatchError::NonEmpty);
        }
        self.pending = patch;
        Ok(self)
    }

    pub fn pipeline(&self) -> &[PipelineOp] {
        &self.stages
    }

    pub fn pending_patch(&self) -> &Patch {
        &self.pending
    }

    /// Hands the accumulated stage sequence to the serialization layer.
    pub fn into_pipeline(self) -> Vec<PipelineOp> {
        self.stages
    }
}
