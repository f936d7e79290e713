pub mod engine;


use crate::{
    patch::Patch,
    pipeline::{
        Accumulator, DocVar, Expression, GroupKey, Grouped, PipelineOp, Reshape, Selector,
    },
};
use itertools::Itertools;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum Error {
    #[error("cannot merge pipeline stages {left:?} and {right:?}: {}", hint.as_deref().unwrap_or("the pair is irreconcilable"))]
    OpMerge {
        left: PipelineOp,
        right: PipelineOp,
        hint: Option<String>,
    },
    #[error("pipeline merge failed after emitting {} stage(s): {}", merged.len(), hint.as_deref().unwrap_or("no further rule applies"))]
    PipelineMerge {
        merged: Vec<PipelineOp>,
        left_rest: Vec<PipelineOp>,
        right_rest: Vec<PipelineOp>,
        hint: Option<String>,
    },
}

impl Error {
    fn op_merge(left: PipelineOp, right: PipelineOp, hint: &str) -> Error {
        Error::OpMerge {
            left,
            right,
            hint: Some(hint.to_string()),
        }
    }
}

/// The outcome of merging one pair of stages. The winner's stages are
/// emitted; the losing side keeps its stage for the next comparison. Each
/// case carries one residual patch per original side, to be applied to
/// that side's remaining stages.
#[derive(Debug, PartialEq, Clone)]
pub enum MergeResult {
    LeftWins {
        ops: Vec<PipelineOp>,
        left_patch: Patch,
        right_patch: Patch,
    },
    RightWins {
        ops: Vec<PipelineOp>,
        left_patch: Patch,
        right_patch: Patch,
    },
    BothFused {
        ops: Vec<PipelineOp>,
        left_patch: Patch,
        right_patch: Patch,
    },
}

impl MergeResult {
    fn left(ops: Vec<PipelineOp>) -> MergeResult {
        MergeResult::LeftWins {
            ops,
            left_patch: Patch::Id,
            right_patch: Patch::Id,
        }
    }

    fn right(ops: Vec<PipelineOp>) -> MergeResult {
        MergeResult::RightWins {
            ops,
            left_patch: Patch::Id,
            right_patch: Patch::Id,
        }
    }

    fn fused(ops: Vec<PipelineOp>) -> MergeResult {
        MergeResult::BothFused {
            ops,
            left_patch: Patch::Id,
            right_patch: Patch::Id,
        }
    }
}

// Reordering tie-break between two distinct shape-preserving kinds.
fn shape_preserving_rank(op: &PipelineOp) -> u8 {
    match op {
        PipelineOp::Match(_) => 0,
        PipelineOp::Sort(_) => 1,
        PipelineOp::Limit(_) => 2,
        PipelineOp::Skip(_) => 3,
        PipelineOp::Out(_) => 4,
        _ => u8::MAX,
    }
}

fn repr<T: std::fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

/// Decides how one pair of adjacent stages combines. For every unordered
/// kind pair exactly one rule applies; the deterministic tie-breaks here
/// are implementation-chosen and carry no semantic precedence.
pub fn merge_ops(left: PipelineOp, right: PipelineOp) -> Result<MergeResult, Error> {
    use PipelineOp::*;
    match (left, right) {
        // Structurally identical stages are idempotent regardless of kind.
        (l, r) if l == r => Ok(MergeResult::fused(vec![l])),

        (l @ Out(_), r @ Out(_)) => Err(Error::op_merge(
            l,
            r,
            "the branches write to different output collections",
        )),
        // Out makes everything after it unreachable; the engine
        // short-circuits on the winning side.
        (l @ Out(_), _) => Ok(MergeResult::left(vec![l])),
        (_, r @ Out(_)) => Ok(MergeResult::right(vec![r])),

        (l @ GeoNear(_), r @ GeoNear(_)) => Err(Error::op_merge(
            l,
            r,
            "the branches geo-search with different parameters",
        )),
        // GeoNear must head the pipeline it appears in.
        (l @ GeoNear(_), _) => Ok(MergeResult::left(vec![l])),
        (_, r @ GeoNear(_)) => Ok(MergeResult::right(vec![r])),

        (Match(l), Match(r)) => Ok(MergeResult::fused(vec![Match(conjoin(l, r))])),
        (Limit(l), Limit(r)) => Ok(MergeResult::fused(vec![Limit(l.min(r))])),
        (Skip(l), Skip(r)) => Ok(MergeResult::fused(vec![Skip(l.min(r))])),
        (Limit(l), Skip(s)) | (Skip(s), Limit(l)) => Ok(MergeResult::fused(vec![
            Limit((l - s).max(0)),
            Skip(s),
        ])),
        (l @ Sort(_), r @ Sort(_)) => Err(Error::op_merge(
            l,
            r,
            "the branches sort by different keys",
        )),

        // A shape-preserving stage commutes with anything, so it goes
        // first. Between two distinct shape-preserving kinds the rank
        // decides, purely for reproducibility.
        (l, r) if l.preserves_shape() || r.preserves_shape() => {
            if !r.preserves_shape() {
                Ok(MergeResult::left(vec![l]))
            } else if !l.preserves_shape() {
                Ok(MergeResult::right(vec![r]))
            } else if shape_preserving_rank(&l) <= shape_preserving_rank(&r) {
                Ok(MergeResult::left(vec![l]))
            } else {
                Ok(MergeResult::right(vec![r]))
            }
        }

        (Group(lg, lk), Group(rg, rk)) => Ok(merge_groups(lg, lk, rg, rk)),
        // A Group erases row identity, so the non-group side's input
        // documents are pushed through the group in an array and unwound
        // straight back out; the non-group lane is redirected underneath
        // the pushed field.
        (Group(g, k), _) => Ok(fold_into_group(g, k, GroupSide::Left)),
        (_, Group(g, k)) => Ok(fold_into_group(g, k, GroupSide::Right)),

        (Project(l), Project(r)) => {
            let (merged, right_patch) = l.merge(r, &DocVar::current_root());
            Ok(MergeResult::BothFused {
                ops: vec![Project(merged)],
                left_patch: Patch::Id,
                right_patch,
            })
        }

        (Unwind(l), Unwind(r)) => {
            // Identical paths collapsed above; order different paths by
            // their textual form.
            if l.to_string() <= r.to_string() {
                Ok(MergeResult::left(vec![Unwind(l)]))
            } else {
                Ok(MergeResult::right(vec![Unwind(r)]))
            }
        }

        (Unwind(path), Redact(expr)) => {
            if expr.references(&path) {
                Err(Error::op_merge(
                    Unwind(path),
                    Redact(expr),
                    "the redact expression references a field exploded by the unwind",
                ))
            } else {
                Ok(MergeResult::right(vec![Redact(expr)]))
            }
        }
        (Redact(expr), Unwind(path)) => {
            if expr.references(&path) {
                Err(Error::op_merge(
                    Redact(expr),
                    Unwind(path),
                    "the redact expression references a field exploded by the unwind",
                ))
            } else {
                Ok(MergeResult::left(vec![Redact(expr)]))
            }
        }

        (Redact(l), Redact(r)) => {
            // Both filters must run; emit them in a reproducible order.
            if repr(&l) <= repr(&r) {
                Ok(MergeResult::left(vec![Redact(l)]))
            } else {
                Ok(MergeResult::right(vec![Redact(r)]))
            }
        }

        // Project loses to Unwind and Redact: both read the unprojected
        // document, so they run before the shape is replaced.
        (l @ (Unwind(_) | Redact(_)), Project(_)) => Ok(MergeResult::left(vec![l])),
        (Project(_), r @ (Unwind(_) | Redact(_))) => Ok(MergeResult::right(vec![r])),

        (l, r) => Err(Error::OpMerge {
            left: l,
            right: r,
            hint: None,
        }),
    }
}

fn conjoin(left: Selector, right: Selector) -> Selector {
    let mut conjuncts = left.into_conjuncts();
    conjuncts.extend(right.into_conjuncts());
    let conjuncts: Vec<Selector> = conjuncts
        .into_iter()
        .sorted_by(|a, b| repr(a).cmp(&repr(b)))
        .dedup()
        .collect();
    if conjuncts.len() == 1 {
        match conjuncts.into_iter().next() {
            Some(only) => only,
            None => Selector::And(vec![]),
        }
    } else {
        Selector::And(conjuncts)
    }
}

enum GroupSide {
    Left,
    Right,
}

// The group side wins: the loser's whole input document is pushed through
// the group under a fresh field and unwound back out, and the losing lane
// is patched to read from underneath that field.
fn fold_into_group(grouped: Grouped, key: GroupKey, side: GroupSide) -> MergeResult {
    let mut grouped = grouped;
    let fresh = grouped.insert_fresh(
        "pushed",
        Accumulator::Push(Expression::FieldRef(DocVar::current_root())),
    );
    let ops = vec![
        PipelineOp::Group(grouped, key),
        PipelineOp::Unwind(DocVar::current([fresh.clone()])),
    ];
    let redirect = Patch::Rename(DocVar::current_root(), DocVar::current([fresh]));
    match side {
        GroupSide::Left => MergeResult::LeftWins {
            ops,
            left_patch: Patch::Id,
            right_patch: redirect,
        },
        GroupSide::Right => MergeResult::RightWins {
            ops,
            left_patch: redirect,
            right_patch: Patch::Id,
        },
    }
}

// Group/Group is the hard case: output fields from both sides are
// unioned, colliding names with different accumulators get fresh names,
// and differing grouping keys are packed side by side into an
// index-keyed shape. The operands are first put into a canonical order so
// the rule cannot alternate between two answers.
fn merge_groups(lg: Grouped, lk: GroupKey, rg: Grouped, rk: GroupKey) -> MergeResult {
    let swapped = repr(&(&lg, &lk)) > repr(&(&rg, &rk));
    let ((a_grouped, a_key), (b_grouped, b_key)) = if swapped {
        ((rg, rk), (lg, lk))
    } else {
        ((lg, lk), (rg, rk))
    };

    let mut grouped = a_grouped;
    let mut a_patch = Patch::Id;
    let mut b_patch = Patch::Id;
    for (name, acc) in b_grouped {
        let duplicate = grouped.get(&name).map(|existing| *existing == acc);
        match duplicate {
            Some(true) => {}
            Some(false) => {
                let fresh = grouped.insert_fresh(&name, acc);
                b_patch = Patch::then(
                    b_patch,
                    Patch::Rename(DocVar::current([name]), DocVar::current([fresh])),
                );
            }
            None => grouped.insert_or_replace(name, acc),
        }
    }

    let key = if a_key == b_key {
        a_key
    } else {
        let mut packed = BTreeMap::new();
        packed.insert(0usize, a_key.into_reshape_value());
        packed.insert(1usize, b_key.into_reshape_value());
        a_patch = Patch::then(
            a_patch,
            Patch::Rename(DocVar::current(["_id"]), DocVar::current(["_id", "0"])),
        );
        b_patch = Patch::then(
            b_patch,
            Patch::Rename(DocVar::current(["_id"]), DocVar::current(["_id", "1"])),
        );
        GroupKey::Shape(Reshape::Arr(packed))
    };

    let (left_patch, right_patch) = if swapped {
        (b_patch, a_patch)
    } else {
        (a_patch, b_patch)
    };
    MergeResult::BothFused {
        ops: vec![PipelineOp::Group(grouped, key)],
        left_patch,
        right_patch,
    }
}
