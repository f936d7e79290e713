use crate::{
    pipeline::{
        Accumulator, DocVar, Expression, GeoNear, GroupKey, LiteralValue, Operator, PipelineOp,
        Reshape, ReshapeValue, Selector, SortSpecification,
    },
    unique_ordered_map,
};
use bson::{bson, doc};

fn field(path: &str) -> Expression {
    Expression::FieldRef(DocVar::current(path.split('.')))
}

macro_rules! test_codegen_stage {
    ($func_name:ident, expected = $expected:expr, input = $input:expr,) => {
        #[test]
        fn $func_name() {
            use crate::codegen::MqlCodeGenerator;
            let expected = $expected;
            let gen = MqlCodeGenerator {};
            assert_eq!(expected, gen.codegen_stage(&$input));
        }
    };
}

macro_rules! test_codegen_expr {
    ($func_name:ident, expected = $expected:expr, input = $input:expr,) => {
        #[test]
        fn $func_name() {
            use crate::codegen::MqlCodeGenerator;
            let expected = $expected;
            let gen = MqlCodeGenerator {};
            assert_eq!(expected, gen.codegen_expression(&$input));
        }
    };
}

mod stage {
    use super::*;

    test_codegen_stage!(
        project,
        expected = doc! {"$project": {"a": "$x", "b": {"c": "$y.z"}}},
        input = PipelineOp::Project(Reshape::Doc(unique_ordered_map! {
            "a".to_string() => ReshapeValue::Expr(field("x")),
            "b".to_string() => ReshapeValue::Shape(Reshape::Doc(unique_ordered_map! {
                "c".to_string() => ReshapeValue::Expr(field("y.z")),
            })),
        })),
    );

    test_codegen_stage!(
        indexed_project_keys_by_decimal_index,
        expected = doc! {"$project": {"0": "$x", "1": "$y"}},
        input = PipelineOp::Project(Reshape::Arr(crate::map! {
            0usize => ReshapeValue::Expr(field("x")),
            1usize => ReshapeValue::Expr(field("y")),
        })),
    );

    test_codegen_stage!(
        match_condition_goes_under_expr,
        expected = doc! {"$match": {"$expr": {"$gt": ["$a", {"$literal": 1}]}}},
        input = PipelineOp::Match(Selector::Cond(Expression::Op(
            Operator::Gt,
            vec![field("a"), Expression::Literal(LiteralValue::Integer(1))],
        ))),
    );

    test_codegen_stage!(
        match_conjunction,
        expected = doc! {"$match": {"$and": [
            {"$expr": "$a"},
            {"$expr": "$b"},
        ]}},
        input = PipelineOp::Match(Selector::And(vec![
            Selector::Cond(field("a")),
            Selector::Cond(field("b")),
        ])),
    );

    test_codegen_stage!(
        redact,
        expected = doc! {"$redact": "$level"},
        input = PipelineOp::Redact(field("level")),
    );

    test_codegen_stage!(
        limit,
        expected = doc! {"$limit": 10_i64},
        input = PipelineOp::Limit(10),
    );

    test_codegen_stage!(
        skip,
        expected = doc! {"$skip": 3_i64},
        input = PipelineOp::Skip(3),
    );

    test_codegen_stage!(
        unwind,
        expected = doc! {"$unwind": "$items.tags"},
        input = PipelineOp::Unwind(DocVar::current(["items", "tags"])),
    );

    test_codegen_stage!(
        group,
        expected = doc! {"$group": {
            "_id": "$k",
            "total": {"$sum": "$price"},
            "latest": {"$last": "$ts"},
        }},
        input = PipelineOp::Group(
            unique_ordered_map! {
                "total".to_string() => Accumulator::Sum(field("price")),
                "latest".to_string() => Accumulator::Last(field("ts")),
            },
            GroupKey::Expr(field("k")),
        ),
    );

    test_codegen_stage!(
        group_with_compound_key,
        expected = doc! {"$group": {
            "_id": {"y": "$year", "m": "$month"},
            "n": {"$sum": {"$literal": 1}},
        }},
        input = PipelineOp::Group(
            unique_ordered_map! {
                "n".to_string() =>
                    Accumulator::Sum(Expression::Literal(LiteralValue::Integer(1))),
            },
            GroupKey::Shape(Reshape::Doc(unique_ordered_map! {
                "y".to_string() => ReshapeValue::Expr(field("year")),
                "m".to_string() => ReshapeValue::Expr(field("month")),
            })),
        ),
    );

    test_codegen_stage!(
        sort,
        expected = doc! {"$sort": {"a": 1, "b.c": -1}},
        input = PipelineOp::Sort(vec![
            SortSpecification::Asc(DocVar::current(["a"])),
            SortSpecification::Desc(DocVar::current(["b", "c"])),
        ]),
    );

    test_codegen_stage!(
        out,
        expected = doc! {"$out": "target"},
        input = PipelineOp::Out("target".to_string()),
    );

    test_codegen_stage!(
        geo_near_with_all_options,
        expected = doc! {"$geoNear": {
            "near": [-73.99, 40.72],
            "distanceField": "dist",
            "spherical": true,
            "maxDistance": 500.0,
            "limit": 25_i64,
            "query": {"$expr": "$open"},
        }},
        input = PipelineOp::GeoNear(GeoNear {
            near: (-73.99, 40.72),
            distance_field: "dist".to_string(),
            max_distance: Some(500.0),
            limit: Some(25),
            spherical: true,
            query: Some(Selector::Cond(field("open"))),
        }),
    );

    test_codegen_stage!(
        geo_near_omits_absent_options,
        expected = doc! {"$geoNear": {
            "near": [0.0, 0.0],
            "distanceField": "dist",
            "spherical": false,
        }},
        input = PipelineOp::GeoNear(GeoNear {
            near: (0.0, 0.0),
            distance_field: "dist".to_string(),
            max_distance: None,
            limit: None,
            spherical: false,
            query: None,
        }),
    );
}

mod expression {
    use super::*;

    test_codegen_expr!(
        literals_are_wrapped,
        expected = bson!({"$literal": "hi"}),
        input = Expression::Literal(LiteralValue::String("hi".to_string())),
    );

    test_codegen_expr!(
        null_literal,
        expected = bson!({"$literal": null}),
        input = Expression::Literal(LiteralValue::Null),
    );

    test_codegen_expr!(
        long_literal,
        expected = bson!({"$literal": 42_i64}),
        input = Expression::Literal(LiteralValue::Long(42)),
    );

    test_codegen_expr!(
        field_refs_render_with_their_root,
        expected = bson!("$$ROOT.a"),
        input = Expression::FieldRef(DocVar::rooted(["a"])),
    );

    test_codegen_expr!(
        current_root_reference,
        expected = bson!("$$CURRENT"),
        input = Expression::FieldRef(DocVar::current_root()),
    );

    test_codegen_expr!(
        operators_take_an_argument_array,
        expected = bson!({"$concat": ["$first", {"$literal": " "}, "$last"]}),
        input = Expression::Op(
            Operator::Concat,
            vec![
                field("first"),
                Expression::Literal(LiteralValue::String(" ".to_string())),
                field("last"),
            ],
        ),
    );

    test_codegen_expr!(
        document_expressions_render_inline,
        expected = bson!({"a": "$x", "b": {"$literal": true}}),
        input = Expression::Document(unique_ordered_map! {
            "a".to_string() => field("x"),
            "b".to_string() => Expression::Literal(LiteralValue::Boolean(true)),
        }),
    );

    test_codegen_expr!(
        array_expressions_render_elementwise,
        expected = bson!(["$a", {"$literal": 1.5}]),
        input = Expression::Array(vec![
            field("a"),
            Expression::Literal(LiteralValue::Double(1.5)),
        ]),
    );
}

#[test]
fn generate_pipeline_maps_stages_in_order() {
    use crate::codegen::generate_pipeline;
    let pipeline = vec![
        PipelineOp::Match(Selector::Cond(field("a"))),
        PipelineOp::Limit(2),
    ];
    assert_eq!(
        vec![
            doc! {"$match": {"$expr": "$a"}},
            doc! {"$limit": 2_i64},
        ],
        generate_pipeline(&pipeline),
    );
}
