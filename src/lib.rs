//! Fuses two independently planned aggregation pipelines into one
//! equivalent pipeline.
//!
//! Planning the two sides of a join (or a union, or two patched copies of
//! a branched plan) produces two stage sequences over the same source.
//! The fixpoint engine in this crate drives both sequences to completion
//! as a pair of lanes, consulting a pairwise rule table to decide how
//! each adjacent stage pair combines, and threading deferred
//! field-reference rewrites ("patches") through whatever stages have not
//! been seen yet. The result is one stage sequence plus the residual
//! patch each side still owes to anything composed after it.
//!
//! The whole subsystem is pure and synchronous: stages, shapes, and
//! patches are immutable trees, errors are data, and every merge call is
//! a referentially transparent function of its inputs.

pub mod builder;
pub mod codegen;
pub mod merge;
pub mod patch;
pub mod pipeline;
pub mod result;
pub mod util;

pub use builder::PipelineBuilder;
pub use codegen::generate_pipeline;
pub use merge::engine::{merge_pipelines, Merged};
pub use patch::Patch;
pub use pipeline::{
    Accumulator, DocRoot, DocVar, Expression, GeoNear, GroupKey, Grouped, LiteralValue,
    Operator, PipelineOp, Reshape, ReshapeValue, Selector, SortSpecification,
};
