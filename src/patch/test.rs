use crate::{
    pipeline::{
        Accumulator, DocVar, Expression, GroupKey, LiteralValue, Operator, PipelineOp, Selector,
    },
    unique_ordered_map,
};

use super::Patch;

fn rename(from: &str, to: &str) -> Patch {
    Patch::Rename(DocVar::current([from]), DocVar::current([to]))
}

fn field(name: &str) -> Expression {
    Expression::FieldRef(DocVar::current([name]))
}

fn match_gt(name: &str, n: i32) -> PipelineOp {
    PipelineOp::Match(Selector::Cond(Expression::Op(
        Operator::Gt,
        vec![field(name), Expression::Literal(LiteralValue::Integer(n))],
    )))
}

fn project_one(key: &str, source: &str) -> PipelineOp {
    let mut shape = crate::util::UniqueOrderedMap::new();
    shape.insert_or_replace(
        key.to_string(),
        crate::pipeline::ReshapeValue::Expr(field(source)),
    );
    PipelineOp::Project(crate::pipeline::Reshape::Doc(shape))
}

macro_rules! test_simplify {
    ($func_name:ident, expected = $expected:expr, input = $input:expr,) => {
        #[test]
        fn $func_name() {
            let expected = $expected;
            assert_eq!(expected, $input.simplify());
        }
    };
}

macro_rules! test_apply {
    ($func_name:ident, expected = $expected:expr, patch = $patch:expr, input = $input:expr,) => {
        #[test]
        fn $func_name() {
            let expected = $expected;
            assert_eq!(expected, $patch.apply($input));
        }
    };
}

mod simplify {
    use super::*;

    test_simplify!(
        id_is_a_fixed_point,
        expected = Patch::Id,
        input = Patch::Id,
    );

    test_simplify!(
        then_drops_identity_operands,
        expected = rename("a", "b"),
        input = Patch::Then(
            Box::new(Patch::Id),
            Box::new(Patch::Then(Box::new(rename("a", "b")), Box::new(Patch::Id))),
        ),
    );

    test_simplify!(
        and_of_identities_collapses,
        expected = Patch::Id,
        input = Patch::And(Box::new(Patch::Id), Box::new(Patch::Id)),
    );

    test_simplify!(
        and_of_equal_branches_collapses,
        expected = rename("a", "b"),
        input = Patch::And(Box::new(rename("a", "b")), Box::new(rename("a", "b"))),
    );

    test_simplify!(
        nested_collapses_reach_a_fixed_point,
        expected = rename("a", "b"),
        input = Patch::And(
            Box::new(Patch::Then(Box::new(Patch::Id), Box::new(rename("a", "b")))),
            Box::new(Patch::Then(Box::new(rename("a", "b")), Box::new(Patch::Id))),
        ),
    );

    test_simplify!(
        distinct_branches_survive,
        expected = Patch::And(Box::new(Patch::Id), Box::new(rename("a", "b"))),
        input = Patch::And(Box::new(Patch::Id), Box::new(rename("a", "b"))),
    );
}

mod smart_constructors {
    use super::*;

    #[test]
    fn then_absorbs_identity() {
        assert_eq!(rename("a", "b"), Patch::then(Patch::Id, rename("a", "b")));
        assert_eq!(rename("a", "b"), Patch::then(rename("a", "b"), Patch::Id));
    }

    #[test]
    fn and_of_identities_is_identity() {
        assert_eq!(Patch::Id, Patch::and(Patch::Id, Patch::Id));
    }

    #[test]
    fn and_keeps_a_single_live_branch() {
        assert_eq!(
            Patch::And(Box::new(rename("a", "b")), Box::new(Patch::Id)),
            Patch::and(rename("a", "b"), Patch::Id),
        );
    }
}

mod apply {
    use super::*;

    test_apply!(
        identity_leaves_the_stage_alone,
        expected = Ok((vec![match_gt("a", 1)], Patch::Id)),
        patch = Patch::Id,
        input = match_gt("a", 1),
    );

    test_apply!(
        rename_is_carried_past_a_match,
        expected = Ok((vec![match_gt("b", 1)], rename("a", "b"))),
        patch = rename("a", "b"),
        input = match_gt("a", 1),
    );

    test_apply!(
        rename_is_consumed_by_a_project,
        expected = Ok((vec![project_one("p", "b")], Patch::Id)),
        patch = rename("a", "b"),
        input = project_one("p", "a"),
    );

    test_apply!(
        rename_is_consumed_by_a_group,
        expected = Ok((
            vec![PipelineOp::Group(
                unique_ordered_map! {"t".to_string() => Accumulator::Sum(field("b"))},
                GroupKey::Expr(field("k")),
            )],
            Patch::Id,
        )),
        patch = rename("a", "b"),
        input = PipelineOp::Group(
            unique_ordered_map! {"t".to_string() => Accumulator::Sum(field("a"))},
            GroupKey::Expr(field("k")),
        ),
    );

    test_apply!(
        rename_rebases_nested_references,
        expected = Ok((
            vec![PipelineOp::Unwind(DocVar::current(["b", "inner"]))],
            rename("a", "b"),
        )),
        patch = rename("a", "b"),
        input = PipelineOp::Unwind(DocVar::current(["a", "inner"])),
    );

    test_apply!(
        then_applies_in_sequence,
        expected = Ok((
            vec![match_gt("c", 1)],
            Patch::Then(Box::new(rename("a", "b")), Box::new(rename("b", "c"))),
        )),
        patch = Patch::then(rename("a", "b"), rename("b", "c")),
        input = match_gt("a", 1),
    );

    test_apply!(
        agreeing_branches_emit_once,
        expected = Ok((vec![match_gt("a", 1)], Patch::Id)),
        patch = Patch::And(Box::new(Patch::Id), Box::new(Patch::Id)),
        input = match_gt("a", 1),
    );

    // Diverging branches are resynchronized through the merge engine: the
    // two patched projections collide on their output field, so the second
    // branch is redirected to a fresh name.
    test_apply!(
        diverging_branches_resynchronize,
        expected = Ok((
            vec![{
                let mut shape = crate::util::UniqueOrderedMap::new();
                shape.insert_or_replace(
                    "p".to_string(),
                    crate::pipeline::ReshapeValue::Expr(field("b")),
                );
                shape.insert_or_replace(
                    "p_1".to_string(),
                    crate::pipeline::ReshapeValue::Expr(field("a")),
                );
                PipelineOp::Project(crate::pipeline::Reshape::Doc(shape))
            }],
            Patch::And(Box::new(Patch::Id), Box::new(rename("p", "p_1"))),
        )),
        patch = Patch::And(Box::new(rename("a", "b")), Box::new(Patch::Id)),
        input = project_one("p", "a"),
    );

    #[test]
    fn apply_all_threads_residuals() {
        let patch = rename("a", "b");
        let input = vec![match_gt("a", 1), project_one("p", "a"), match_gt("a", 2)];
        // The rename survives the match, is absorbed by the project, and
        // never reaches the final match.
        let expected = Ok((
            vec![match_gt("b", 1), project_one("p", "b"), match_gt("a", 2)],
            Patch::Id,
        ));
        assert_eq!(expected, patch.apply_all(input));
    }

    #[test]
    fn apply_all_over_nothing_keeps_the_patch() {
        let patch = rename("a", "b");
        assert_eq!(Ok((vec![], rename("a", "b"))), patch.apply_all(vec![]));
    }
}
