use crate::{patch::Patch, util::UniqueOrderedMap};
use std::collections::BTreeMap;
use std::fmt;

/// One aggregation pipeline stage. The variant set is closed; every
/// pairwise combination is handled by the merge rule table.
#[derive(PartialEq, Debug, Clone)]
pub enum PipelineOp {
    Project(Reshape),
    Match(Selector),
    Redact(Expression),
    Limit(i64),
    Skip(i64),
    Unwind(DocVar),
    Group(Grouped, GroupKey),
    Sort(Vec<SortSpecification>),
    Out(String),
    GeoNear(GeoNear),
}

impl PipelineOp {
    /// The canonical wire-level operator tag for this stage.
    pub fn op_name(&self) -> &'static str {
        use PipelineOp::*;
        match self {
            Project(_) => "$project",
            Match(_) => "$match",
            Redact(_) => "$redact",
            Limit(_) => "$limit",
            Skip(_) => "$skip",
            Unwind(_) => "$unwind",
            Group(_, _) => "$group",
            Sort(_) => "$sort",
            Out(_) => "$out",
            GeoNear(_) => "$geoNear",
        }
    }

    /// Shape-preserving stages change row count or order but never the
    /// document shape, which lets the rule table reorder them freely.
    pub fn preserves_shape(&self) -> bool {
        use PipelineOp::*;
        matches!(
            self,
            Match(_) | Limit(_) | Skip(_) | Sort(_) | Out(_)
        )
    }

    /// Project and Group own their output shape: a rename applied to them
    /// is fully absorbed into the stage payload. Every other stage reads
    /// the shape it was given, so a rename must be carried past it.
    pub fn consumes_rename(&self) -> bool {
        matches!(self, PipelineOp::Project(_) | PipelineOp::Group(_, _))
    }

    /// Rewrites every field reference reachable from this stage's payload.
    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> PipelineOp {
        use PipelineOp::*;
        match self {
            Project(shape) => Project(shape.rewrite_refs(f)),
            Match(selector) => Match(selector.rewrite_refs(f)),
            Redact(expr) => Redact(expr.rewrite_refs(f)),
            Limit(n) => Limit(n),
            Skip(n) => Skip(n),
            Unwind(var) => Unwind(f(var)),
            Group(grouped, key) => {
                let mut rewritten = UniqueOrderedMap::new();
                for (name, acc) in grouped {
                    rewritten.insert_or_replace(name, acc.rewrite_refs(f));
                }
                Group(rewritten, key.rewrite_refs(f))
            }
            Sort(specs) => Sort(
                specs
                    .into_iter()
                    .map(|s| match s {
                        SortSpecification::Asc(var) => SortSpecification::Asc(f(var)),
                        SortSpecification::Desc(var) => SortSpecification::Desc(f(var)),
                    })
                    .collect(),
            ),
            Out(collection) => Out(collection),
            GeoNear(geo) => {
                let self::GeoNear {
                    near,
                    distance_field,
                    max_distance,
                    limit,
                    spherical,
                    query,
                } = geo;
                GeoNear(self::GeoNear {
                    near,
                    distance_field,
                    max_distance,
                    limit,
                    spherical,
                    query: query.map(|s| s.rewrite_refs(f)),
                })
            }
        }
    }
}

/// A declarative description of a stage's output document: each key maps
/// to a computed expression or a nested reshape. `Arr` is keyed by array
/// index instead of field name.
#[derive(PartialEq, Debug, Clone)]
pub enum Reshape {
    Doc(UniqueOrderedMap<String, ReshapeValue>),
    Arr(BTreeMap<usize, ReshapeValue>),
}

#[derive(PartialEq, Debug, Clone)]
pub enum ReshapeValue {
    Expr(Expression),
    Shape(Reshape),
}

impl ReshapeValue {
    fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> ReshapeValue {
        match self {
            ReshapeValue::Expr(e) => ReshapeValue::Expr(e.rewrite_refs(f)),
            ReshapeValue::Shape(s) => ReshapeValue::Shape(s.rewrite_refs(f)),
        }
    }
}

impl Reshape {
    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> Reshape {
        match self {
            Reshape::Doc(entries) => {
                let mut rewritten = UniqueOrderedMap::new();
                for (k, v) in entries {
                    rewritten.insert_or_replace(k, v.rewrite_refs(f));
                }
                Reshape::Doc(rewritten)
            }
            Reshape::Arr(entries) => Reshape::Arr(
                entries
                    .into_iter()
                    .map(|(i, v)| (i, v.rewrite_refs(f)))
                    .collect(),
            ),
        }
    }

    /// The document view of a reshape; array reshapes key their values by
    /// the decimal rendering of the index, matching the wire form.
    pub fn into_doc(self) -> UniqueOrderedMap<String, ReshapeValue> {
        match self {
            Reshape::Doc(entries) => entries,
            Reshape::Arr(entries) => {
                let mut doc = UniqueOrderedMap::new();
                for (i, v) in entries {
                    doc.insert_or_replace(i.to_string(), v);
                }
                doc
            }
        }
    }

    /// Merges two reshapes into one, unioning keys and recursing into
    /// nested shapes. Identical values are kept once. A colliding key with
    /// a differing value keeps the left value under the original key and
    /// the right value under a freshly minted key; the returned patch
    /// redirects the right side's references, anchored at `base`.
    pub fn merge(self, other: Reshape, base: &DocVar) -> (Reshape, Patch) {
        if let (Reshape::Arr(left), Reshape::Arr(right)) = (&self, &other) {
            let (merged, patch) = merge_indexed(left.clone(), right.clone(), base);
            return (Reshape::Arr(merged), patch);
        }

        let mut merged = self.into_doc();
        let mut patch = Patch::Id;
        for (key, value) in other.into_doc() {
            match classify(merged.get(&key), &value) {
                Slot::Missing => merged.insert_or_replace(key, value),
                Slot::Equal => {}
                Slot::BothShapes => {
                    let existing = match merged.get(&key) {
                        Some(ReshapeValue::Shape(s)) => s.clone(),
                        _ => continue,
                    };
                    if let ReshapeValue::Shape(shape) = value {
                        let (inner, inner_patch) = existing.merge(shape, &base.child(&key));
                        merged.insert_or_replace(key, ReshapeValue::Shape(inner));
                        patch = Patch::then(patch, inner_patch);
                    }
                }
                Slot::Clash => {
                    let fresh = merged.insert_fresh(&key, value);
                    patch = Patch::then(
                        patch,
                        Patch::Rename(base.child(&key), base.child(&fresh)),
                    );
                }
            }
        }
        (Reshape::Doc(merged), patch)
    }
}

enum Slot {
    Missing,
    Equal,
    BothShapes,
    Clash,
}

fn classify(existing: Option<&ReshapeValue>, incoming: &ReshapeValue) -> Slot {
    match existing {
        None => Slot::Missing,
        Some(e) if e == incoming => Slot::Equal,
        Some(ReshapeValue::Shape(_)) if matches!(incoming, ReshapeValue::Shape(_)) => {
            Slot::BothShapes
        }
        Some(_) => Slot::Clash,
    }
}

fn merge_indexed(
    left: BTreeMap<usize, ReshapeValue>,
    right: BTreeMap<usize, ReshapeValue>,
    base: &DocVar,
) -> (BTreeMap<usize, ReshapeValue>, Patch) {
    let mut merged = left;
    let mut patch = Patch::Id;
    for (idx, value) in right {
        match classify(merged.get(&idx), &value) {
            Slot::Missing => {
                merged.insert(idx, value);
            }
            Slot::Equal => {}
            Slot::BothShapes => {
                let existing = match merged.get(&idx) {
                    Some(ReshapeValue::Shape(s)) => s.clone(),
                    _ => continue,
                };
                if let ReshapeValue::Shape(shape) = value {
                    let (inner, inner_patch) =
                        existing.merge(shape, &base.child(idx.to_string()));
                    merged.insert(idx, ReshapeValue::Shape(inner));
                    patch = Patch::then(patch, inner_patch);
                }
            }
            Slot::Clash => {
                let fresh = merged.keys().next_back().map_or(0, |k| k + 1);
                merged.insert(fresh, value);
                patch = Patch::then(
                    patch,
                    Patch::Rename(
                        base.child(idx.to_string()),
                        base.child(fresh.to_string()),
                    ),
                );
            }
        }
    }
    (merged, patch)
}

/// The output fields of a Group stage, each defined by one accumulator.
pub type Grouped = UniqueOrderedMap<String, Accumulator>;

#[derive(PartialEq, Debug, Clone)]
pub enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
}

impl Accumulator {
    pub fn expr(&self) -> &Expression {
        use Accumulator::*;
        match self {
            Sum(e) | Avg(e) | Min(e) | Max(e) | First(e) | Last(e) | Push(e) | AddToSet(e) => e,
        }
    }

    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> Accumulator {
        use Accumulator::*;
        match self {
            Sum(e) => Sum(e.rewrite_refs(f)),
            Avg(e) => Avg(e.rewrite_refs(f)),
            Min(e) => Min(e.rewrite_refs(f)),
            Max(e) => Max(e.rewrite_refs(f)),
            First(e) => First(e.rewrite_refs(f)),
            Last(e) => Last(e.rewrite_refs(f)),
            Push(e) => Push(e.rewrite_refs(f)),
            AddToSet(e) => AddToSet(e.rewrite_refs(f)),
        }
    }
}

/// The grouping key of a Group stage: a single expression or a reshape
/// producing a compound key document.
#[derive(PartialEq, Debug, Clone)]
pub enum GroupKey {
    Expr(Expression),
    Shape(Reshape),
}

impl GroupKey {
    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> GroupKey {
        match self {
            GroupKey::Expr(e) => GroupKey::Expr(e.rewrite_refs(f)),
            GroupKey::Shape(s) => GroupKey::Shape(s.rewrite_refs(f)),
        }
    }

    pub fn into_reshape_value(self) -> ReshapeValue {
        match self {
            GroupKey::Expr(e) => ReshapeValue::Expr(e),
            GroupKey::Shape(s) => ReshapeValue::Shape(s),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum SortSpecification {
    Asc(DocVar),
    Desc(DocVar),
}

impl SortSpecification {
    pub fn var(&self) -> &DocVar {
        match self {
            SortSpecification::Asc(v) | SortSpecification::Desc(v) => v,
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct GeoNear {
    pub near: (f64, f64),
    pub distance_field: String,
    pub max_distance: Option<f64>,
    pub limit: Option<i64>,
    pub spherical: bool,
    pub query: Option<Selector>,
}

/// A match predicate. Conjunction is explicit so selectors from both sides
/// of a merge can be combined and flattened without changing meaning.
#[derive(PartialEq, Debug, Clone)]
pub enum Selector {
    Cond(Expression),
    And(Vec<Selector>),
}

const MAX_NORMALIZE_PASSES: usize = 32;

impl Selector {
    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> Selector {
        match self {
            Selector::Cond(e) => Selector::Cond(e.rewrite_refs(f)),
            Selector::And(conds) => {
                Selector::And(conds.into_iter().map(|s| s.rewrite_refs(f)).collect())
            }
        }
    }

    /// Flattens nested conjunctions to a fixed point. The rewrite is
    /// convergent; the pass cap turns a confluence bug into a stale
    /// (still correct) selector instead of a hang.
    pub fn normalize(self) -> Selector {
        let mut current = self;
        for _ in 0..MAX_NORMALIZE_PASSES {
            let (next, changed) = current.flatten_once();
            current = next;
            if !changed {
                break;
            }
        }
        current
    }

    fn flatten_once(self) -> (Selector, bool) {
        match self {
            Selector::Cond(e) => (Selector::Cond(e), false),
            Selector::And(conds) => {
                let mut changed = false;
                let mut flat = Vec::with_capacity(conds.len());
                for cond in conds {
                    let (cond, inner_changed) = cond.flatten_once();
                    changed |= inner_changed;
                    match cond {
                        Selector::And(inner) => {
                            changed = true;
                            flat.extend(inner);
                        }
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    (flat.into_iter().next().unwrap_or(Selector::And(vec![])), true)
                } else {
                    (Selector::And(flat), changed)
                }
            }
        }
    }

    /// The flattened conjunct list of this selector.
    pub fn into_conjuncts(self) -> Vec<Selector> {
        match self.normalize() {
            Selector::And(conds) => conds,
            single => vec![single],
        }
    }

    pub fn references(&self, var: &DocVar) -> bool {
        match self {
            Selector::Cond(e) => e.references(var),
            Selector::And(conds) => conds.iter().any(|s| s.references(var)),
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Expression {
    Literal(LiteralValue),
    FieldRef(DocVar),
    Op(Operator, Vec<Expression>),
    Document(UniqueOrderedMap<String, Expression>),
    Array(Vec<Expression>),
}

impl Expression {
    pub fn rewrite_refs<F: Fn(DocVar) -> DocVar>(self, f: &F) -> Expression {
        use Expression::*;
        match self {
            Literal(v) => Literal(v),
            FieldRef(var) => FieldRef(f(var)),
            Op(op, args) => Op(op, args.into_iter().map(|a| a.rewrite_refs(f)).collect()),
            Document(entries) => {
                let mut rewritten = UniqueOrderedMap::new();
                for (k, v) in entries {
                    rewritten.insert_or_replace(k, v.rewrite_refs(f));
                }
                Document(rewritten)
            }
            Array(items) => Array(items.into_iter().map(|a| a.rewrite_refs(f)).collect()),
        }
    }

    /// True when any field reference in this expression points at `var` or
    /// below it.
    pub fn references(&self, var: &DocVar) -> bool {
        use Expression::*;
        match self {
            Literal(_) => false,
            FieldRef(v) => v.starts_with(var),
            Op(_, args) => args.iter().any(|a| a.references(var)),
            Document(entries) => entries.iter().any(|(_, v)| v.references(var)),
            Array(items) => items.iter().any(|a| a.references(var)),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Not,
    Concat,
    IfNull,
    Cond,
}

#[derive(PartialEq, Debug, Clone)]
pub enum LiteralValue {
    Null,
    Boolean(bool),
    String(String),
    Integer(i32),
    Long(i64),
    Double(f64),
}

/// A field reference: a document root plus an optional dotted path into it.
#[derive(PartialEq, Eq, Debug, Clone, Hash)]
pub struct DocVar {
    pub root: DocRoot,
    pub path: Vec<String>,
}

/// Which document a reference is rooted at: the current stage's input, or
/// the original root that entered the pipeline.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum DocRoot {
    Current,
    Root,
}

impl DocVar {
    pub fn current<I, S>(path: I) -> DocVar
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DocVar {
            root: DocRoot::Current,
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    pub fn rooted<I, S>(path: I) -> DocVar
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DocVar {
            root: DocRoot::Root,
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// The whole input document of the current stage.
    pub fn current_root() -> DocVar {
        DocVar {
            root: DocRoot::Current,
            path: vec![],
        }
    }

    pub fn child(&self, name: impl Into<String>) -> DocVar {
        let mut path = self.path.clone();
        path.push(name.into());
        DocVar {
            root: self.root,
            path,
        }
    }

    pub fn starts_with(&self, prefix: &DocVar) -> bool {
        self.root == prefix.root && self.path.starts_with(&prefix.path)
    }

    /// Rewrites this reference if it falls under `from`, rebasing the
    /// remainder of the path onto `to`.
    pub fn rename(self, from: &DocVar, to: &DocVar) -> DocVar {
        if self.starts_with(from) {
            let mut path = to.path.clone();
            path.extend(self.path[from.path.len()..].iter().cloned());
            DocVar {
                root: to.root,
                path,
            }
        } else {
            self
        }
    }
}

impl fmt::Display for DocVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.root, self.path.is_empty()) {
            (DocRoot::Current, true) => write!(f, "$$CURRENT"),
            (DocRoot::Current, false) => write!(f, "${}", self.path.join(".")),
            (DocRoot::Root, true) => write!(f, "$$ROOT"),
            (DocRoot::Root, false) => write!(f, "$$ROOT.{}", self.path.join(".")),
        }
    }
}
