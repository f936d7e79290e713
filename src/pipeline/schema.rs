use crate::{
    pipeline::{DocVar, Expression, PipelineOp, Reshape, ReshapeValue},
    util::UniqueOrderedMap,
};
use std::collections::BTreeMap;

/// An approximation of the document shape flowing out of a stage: either
/// nothing is known yet, or the set of top-level field names is known.
/// This is deliberately not a type; it exists to mint collision-free
/// fresh names and to reconstruct an implicit projection for a lane that
/// has run out of stages.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub enum Schema {
    #[default]
    Init,
    Succ(BTreeMap<String, SchemaLeaf>),
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum SchemaLeaf {
    Opaque,
    Nested(BTreeMap<String, SchemaLeaf>),
}

impl Schema {
    /// Folds one stage into the approximation. Project and Group replace
    /// the known shape outright; shape-preserving stages, Unwind, and
    /// Redact leave it untouched; GeoNear adds its distance field.
    pub fn accumulate(&mut self, op: &PipelineOp) {
        match op {
            PipelineOp::Project(shape) => *self = Schema::Succ(leaves_of_reshape(shape)),
            PipelineOp::Group(grouped, _) => {
                let mut leaves = BTreeMap::new();
                leaves.insert("_id".to_string(), SchemaLeaf::Opaque);
                for (name, _) in grouped.iter() {
                    leaves.insert(name.clone(), SchemaLeaf::Opaque);
                }
                *self = Schema::Succ(leaves);
            }
            PipelineOp::GeoNear(geo) => {
                if let Schema::Succ(leaves) = self {
                    leaves.insert(geo.distance_field.clone(), SchemaLeaf::Opaque);
                }
            }
            _ => {}
        }
    }

    /// Synthesizes the implicit projection of every known field, so the
    /// rule table can compare an exhausted lane against a concrete stage.
    /// Returns None when nothing is known about the shape.
    pub fn to_project(&self) -> Option<PipelineOp> {
        match self {
            Schema::Init => None,
            Schema::Succ(leaves) => {
                let mut shape = UniqueOrderedMap::new();
                for name in leaves.keys() {
                    shape.insert_or_replace(
                        name.clone(),
                        ReshapeValue::Expr(Expression::FieldRef(DocVar::current([
                            name.clone()
                        ]))),
                    );
                }
                Some(PipelineOp::Project(Reshape::Doc(shape)))
            }
        }
    }
}

fn leaves_of_reshape(shape: &Reshape) -> BTreeMap<String, SchemaLeaf> {
    let mut leaves = BTreeMap::new();
    match shape {
        Reshape::Doc(entries) => {
            for (name, value) in entries.iter() {
                leaves.insert(name.clone(), leaf_of_value(value));
            }
        }
        Reshape::Arr(entries) => {
            for (idx, value) in entries {
                leaves.insert(idx.to_string(), leaf_of_value(value));
            }
        }
    }
    leaves
}

fn leaf_of_value(value: &ReshapeValue) -> SchemaLeaf {
    match value {
        ReshapeValue::Expr(_) => SchemaLeaf::Opaque,
        ReshapeValue::Shape(inner) => SchemaLeaf::Nested(leaves_of_reshape(inner)),
    }
}
