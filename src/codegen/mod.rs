use crate::pipeline::{
    Accumulator, Expression, GeoNear, GroupKey, LiteralValue, Operator, PipelineOp, Reshape,
    ReshapeValue, Selector, SortSpecification,
};
use bson::{bson, doc, Bson};

#[cfg(test)]
mod test;

/// Maps a merged stage sequence 1:1 onto wire-level aggregation stage
/// documents under their canonical operator tags.
pub fn generate_pipeline(ops: &[PipelineOp]) -> Vec<bson::Document> {
    let gen = MqlCodeGenerator {};
    ops.iter().map(|op| gen.codegen_stage(op)).collect()
}

#[derive(Clone, Debug)]
pub struct MqlCodeGenerator {}

impl MqlCodeGenerator {
    pub fn codegen_stage(&self, op: &PipelineOp) -> bson::Document {
        match op {
            PipelineOp::Project(shape) => doc! {"$project": self.codegen_reshape(shape)},
            PipelineOp::Match(selector) => doc! {"$match": self.codegen_selector(selector)},
            PipelineOp::Redact(expr) => doc! {"$redact": self.codegen_expression(expr)},
            PipelineOp::Limit(n) => doc! {"$limit": *n},
            PipelineOp::Skip(n) => doc! {"$skip": *n},
            PipelineOp::Unwind(var) => doc! {"$unwind": var.to_string()},
            PipelineOp::Group(grouped, key) => {
                let mut group_doc = doc! {"_id": self.codegen_group_key(key)};
                for (name, acc) in grouped.iter() {
                    group_doc.insert(name.clone(), self.codegen_accumulator(acc));
                }
                doc! {"$group": group_doc}
            }
            PipelineOp::Sort(specs) => {
                let mut sort_doc = bson::Document::new();
                for spec in specs {
                    let (var, direction) = match spec {
                        SortSpecification::Asc(var) => (var, Bson::Int32(1)),
                        SortSpecification::Desc(var) => (var, Bson::Int32(-1)),
                    };
                    sort_doc.insert(var.path.join("."), direction);
                }
                doc! {"$sort": sort_doc}
            }
            PipelineOp::Out(collection) => doc! {"$out": collection.clone()},
            PipelineOp::GeoNear(geo) => doc! {"$geoNear": self.codegen_geo_near(geo)},
        }
    }

    fn codegen_geo_near(&self, geo: &GeoNear) -> bson::Document {
        let mut geo_doc = doc! {
            "near": [geo.near.0, geo.near.1],
            "distanceField": geo.distance_field.clone(),
            "spherical": geo.spherical,
        };
        if let Some(max_distance) = geo.max_distance {
            geo_doc.insert("maxDistance", max_distance);
        }
        if let Some(limit) = geo.limit {
            geo_doc.insert("limit", limit);
        }
        if let Some(query) = &geo.query {
            geo_doc.insert("query", self.codegen_selector(query));
        }
        geo_doc
    }

    fn codegen_selector(&self, selector: &Selector) -> bson::Document {
        match selector {
            Selector::Cond(expr) => doc! {"$expr": self.codegen_expression(expr)},
            Selector::And(conds) => doc! {
                "$and": conds
                    .iter()
                    .map(|s| Bson::Document(self.codegen_selector(s)))
                    .collect::<Vec<Bson>>()
            },
        }
    }

    fn codegen_group_key(&self, key: &GroupKey) -> Bson {
        match key {
            GroupKey::Expr(expr) => self.codegen_expression(expr),
            GroupKey::Shape(shape) => Bson::Document(self.codegen_reshape(shape)),
        }
    }

    fn codegen_reshape(&self, shape: &Reshape) -> bson::Document {
        let mut shape_doc = bson::Document::new();
        match shape {
            Reshape::Doc(entries) => {
                for (name, value) in entries.iter() {
                    shape_doc.insert(name.clone(), self.codegen_reshape_value(value));
                }
            }
            Reshape::Arr(entries) => {
                for (idx, value) in entries {
                    shape_doc.insert(idx.to_string(), self.codegen_reshape_value(value));
                }
            }
        }
        shape_doc
    }

    fn codegen_reshape_value(&self, value: &ReshapeValue) -> Bson {
        match value {
            ReshapeValue::Expr(expr) => self.codegen_expression(expr),
            ReshapeValue::Shape(shape) => Bson::Document(self.codegen_reshape(shape)),
        }
    }

    fn codegen_accumulator(&self, acc: &Accumulator) -> Bson {
        let mut acc_doc = bson::Document::new();
        acc_doc.insert(Self::accumulator_op(acc), self.codegen_expression(acc.expr()));
        Bson::Document(acc_doc)
    }

    fn accumulator_op(acc: &Accumulator) -> &'static str {
        use Accumulator::*;
        match acc {
            Sum(_) => "$sum",
            Avg(_) => "$avg",
            Min(_) => "$min",
            Max(_) => "$max",
            First(_) => "$first",
            Last(_) => "$last",
            Push(_) => "$push",
            AddToSet(_) => "$addToSet",
        }
    }

    pub fn codegen_expression(&self, expr: &Expression) -> Bson {
        match expr {
            Expression::Literal(value) => bson!({ "$literal": self.codegen_literal(value) }),
            Expression::FieldRef(var) => Bson::String(var.to_string()),
            Expression::Op(op, args) => {
                let mut op_doc = bson::Document::new();
                op_doc.insert(
                    Self::operator_tag(*op),
                    Bson::Array(args.iter().map(|a| self.codegen_expression(a)).collect()),
                );
                Bson::Document(op_doc)
            }
            Expression::Document(entries) => {
                let mut expr_doc = bson::Document::new();
                for (name, value) in entries.iter() {
                    expr_doc.insert(name.clone(), self.codegen_expression(value));
                }
                Bson::Document(expr_doc)
            }
            Expression::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(|a| self.codegen_expression(a))
                    .collect(),
            ),
        }
    }

    fn codegen_literal(&self, value: &LiteralValue) -> Bson {
        match value {
            LiteralValue::Null => Bson::Null,
            LiteralValue::Boolean(b) => Bson::Boolean(*b),
            LiteralValue::String(s) => Bson::String(s.clone()),
            LiteralValue::Integer(i) => Bson::Int32(*i),
            LiteralValue::Long(l) => Bson::Int64(*l),
            LiteralValue::Double(d) => Bson::Double(*d),
        }
    }

    fn operator_tag(op: Operator) -> &'static str {
        use Operator::*;
        match op {
            Add => "$add",
            Subtract => "$subtract",
            Multiply => "$multiply",
            Divide => "$divide",
            Eq => "$eq",
            Ne => "$ne",
            Lt => "$lt",
            Lte => "$lte",
            Gt => "$gt",
            Gte => "$gte",
            And => "$and",
            Or => "$or",
            Not => "$not",
            Concat => "$concat",
            IfNull => "$ifNull",
            Cond => "$cond",
        }
    }
}