//! Formula expression tree.
//!
//! Nodes are immutable and shared through [`NodeRef`] (`Arc<FormulaItem>`). Every rewrite
//! produces a new tree; untouched subtrees are reused by reference.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::datatype::DataType;
use crate::fork::{BfbFilterMutation, JoinCondition, QueryFork};
use crate::tag::LevelTag;

pub type NodeRef = Arc<FormulaItem>;

/// Path from a root node to one of its descendants, as child positions in
/// [`FormulaItem::children`] order. The empty path addresses the root.
pub type NodeIndex = Vec<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub start: usize,
    pub end: usize,
}

/// Structural metadata. Only `level_tag` takes part in node equality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level_tag: Option<LevelTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl NodeMeta {
    pub fn is_empty(&self) -> bool {
        self.level_tag.is_none() && self.position.is_none()
    }

    pub fn with_tag(&self, level_tag: LevelTag) -> NodeMeta {
        NodeMeta {
            level_tag: Some(level_tag),
            position: self.position,
        }
    }
}

impl PartialEq for NodeMeta {
    fn eq(&self, other: &Self) -> bool {
        self.level_tag == other.level_tag
    }
}

impl Eq for NodeMeta {}

impl Hash for NodeMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.level_tag.hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum LiteralValue {
    Null,
    Integer(i64),
    Float(OrderedFloat<f64>),
    Boolean(bool),
    String(String),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
    DatetimeTz {
        value: NaiveDateTime,
        timezone: String,
    },
    GenericDatetime(NaiveDateTime),
    Geopoint(String),
    Geopolygon(String),
    Uuid(String),
    ArrayInt(Vec<i64>),
    ArrayFloat(Vec<OrderedFloat<f64>>),
    ArrayStr(Vec<String>),
    TreeStr(Vec<String>),
}

impl LiteralValue {
    /// The (non-const) type of the literal.
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Null => DataType::Null,
            LiteralValue::Integer(_) => DataType::Integer,
            LiteralValue::Float(_) => DataType::Float,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::String(_) => DataType::String,
            LiteralValue::Date(_) => DataType::Date,
            LiteralValue::Datetime(_) => DataType::Datetime,
            LiteralValue::DatetimeTz { .. } => DataType::Datetimetz,
            LiteralValue::GenericDatetime(_) => DataType::Genericdatetime,
            LiteralValue::Geopoint(_) => DataType::Geopoint,
            LiteralValue::Geopolygon(_) => DataType::Geopolygon,
            LiteralValue::Uuid(_) => DataType::Uuid,
            LiteralValue::ArrayInt(_) => DataType::ArrayInt,
            LiteralValue::ArrayFloat(_) => DataType::ArrayFloat,
            LiteralValue::ArrayStr(_) => DataType::ArrayStr,
            LiteralValue::TreeStr(_) => DataType::TreeStr,
        }
    }

    /// Truthiness used by constant boolean simplifications.
    pub fn is_truthy(&self) -> bool {
        match self {
            LiteralValue::Null => false,
            LiteralValue::Integer(v) => *v != 0,
            LiteralValue::Float(v) => v.0 != 0.0,
            LiteralValue::Boolean(v) => *v,
            LiteralValue::String(v) => !v.is_empty(),
            LiteralValue::ArrayInt(v) => !v.is_empty(),
            LiteralValue::ArrayFloat(v) => !v.is_empty(),
            LiteralValue::ArrayStr(v) | LiteralValue::TreeStr(v) => !v.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Null => f.write_str("NULL"),
            LiteralValue::Integer(v) => write!(f, "{v}"),
            LiteralValue::Float(v) => write!(f, "{:?}", v.0),
            LiteralValue::Boolean(true) => f.write_str("TRUE"),
            LiteralValue::Boolean(false) => f.write_str("FALSE"),
            LiteralValue::String(v) => write!(f, "'{}'", v.replace('\'', "\\'")),
            LiteralValue::Date(v) => write!(f, "#{v}#"),
            LiteralValue::Datetime(v) | LiteralValue::GenericDatetime(v) => write!(f, "#{v}#"),
            LiteralValue::DatetimeTz { value, timezone } => write!(f, "#{value} {timezone}#"),
            LiteralValue::Geopoint(v) | LiteralValue::Geopolygon(v) => write!(f, "{v}"),
            LiteralValue::Uuid(v) => write!(f, "'{v}'"),
            LiteralValue::ArrayInt(v) => write!(f, "{v:?}"),
            LiteralValue::ArrayFloat(v) => {
                let items: Vec<f64> = v.iter().map(|x| x.0).collect();
                write!(f, "{items:?}")
            }
            LiteralValue::ArrayStr(v) | LiteralValue::TreeStr(v) => write!(f, "{v:?}"),
        }
    }
}

/// Level-of-detail specifier of an aggregation (or a query fork).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "dims")]
pub enum LodSpecifier {
    #[default]
    Inherited,
    Fixed(Vec<NodeRef>),
    Include(Vec<NodeRef>),
    Exclude(Vec<NodeRef>),
    /// Marks an aggregation added automatically around a measure; behaves like `Inherited`.
    DefaultAggregation,
}

impl LodSpecifier {
    pub fn dims(&self) -> &[NodeRef] {
        match self {
            LodSpecifier::Fixed(dims) | LodSpecifier::Include(dims) | LodSpecifier::Exclude(dims) => {
                dims
            }
            LodSpecifier::Inherited | LodSpecifier::DefaultAggregation => &[],
        }
    }

    pub fn with_dims(&self, dims: Vec<NodeRef>) -> LodSpecifier {
        match self {
            LodSpecifier::Fixed(_) => LodSpecifier::Fixed(dims),
            LodSpecifier::Include(_) => LodSpecifier::Include(dims),
            LodSpecifier::Exclude(_) => LodSpecifier::Exclude(dims),
            other => other.clone(),
        }
    }

    /// `true` for the specifiers that do not override the inherited dimensions.
    pub fn is_inherited(&self) -> bool {
        matches!(
            self,
            LodSpecifier::Inherited | LodSpecifier::DefaultAggregation
        )
    }
}

/// Names of the filters that must be applied before (not after) a calculation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BeforeFilterBy(pub BTreeSet<String>);

impl BeforeFilterBy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "dims")]
pub enum WindowGrouping {
    #[default]
    Total,
    Within(Vec<NodeRef>),
    Among(Vec<NodeRef>),
}

impl WindowGrouping {
    pub fn dims(&self) -> &[NodeRef] {
        match self {
            WindowGrouping::Total => &[],
            WindowGrouping::Within(dims) | WindowGrouping::Among(dims) => dims,
        }
    }

    pub fn with_dims(&self, dims: Vec<NodeRef>) -> WindowGrouping {
        match self {
            WindowGrouping::Total => WindowGrouping::Total,
            WindowGrouping::Within(_) => WindowGrouping::Within(dims),
            WindowGrouping::Among(_) => WindowGrouping::Among(dims),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<NodeRef>,
    #[serde(default)]
    pub lod: LodSpecifier,
    #[serde(default)]
    pub ignore_dimensions: Vec<NodeRef>,
    #[serde(default)]
    pub before_filter_by: BeforeFilterBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowFuncCall {
    pub name: String,
    #[serde(default)]
    pub args: Vec<NodeRef>,
    #[serde(default)]
    pub grouping: WindowGrouping,
    /// Ordering items; plain expressions sort ascending, `Ordered` nodes carry a direction.
    #[serde(default)]
    pub ordering: Vec<NodeRef>,
    #[serde(default)]
    pub before_filter_by: BeforeFilterBy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IfPart {
    pub cond: NodeRef,
    pub then: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WhenPart {
    pub when: NodeRef,
    pub then: NodeRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Field {
        name: String,
    },
    Literal(LiteralValue),
    Parenthesized(NodeRef),
    FuncCall(FuncCall),
    WindowFuncCall(WindowFuncCall),
    Binary {
        name: String,
        left: NodeRef,
        right: NodeRef,
    },
    Unary {
        name: String,
        expr: NodeRef,
    },
    Ternary {
        name: String,
        first: NodeRef,
        second: NodeRef,
        third: NodeRef,
    },
    IfBlock {
        branches: Vec<IfPart>,
        else_expr: NodeRef,
    },
    CaseBlock {
        case_expr: NodeRef,
        branches: Vec<WhenPart>,
        else_expr: NodeRef,
    },
    Ordered {
        expr: NodeRef,
        direction: OrderDirection,
    },
    QueryFork(QueryFork),
    /// A deferred error produced by a rewrite; reported when the formula is compiled.
    Error {
        message: String,
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormulaItem {
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "NodeMeta::is_empty")]
    pub meta: NodeMeta,
}

/// Feeds rebuilt children back into a node; missing entries keep the old child.
struct ChildFeed(std::vec::IntoIter<NodeRef>);

impl ChildFeed {
    fn next(&mut self, old: &NodeRef) -> NodeRef {
        self.0.next().unwrap_or_else(|| old.clone())
    }

    fn all(&mut self, old: &[NodeRef]) -> Vec<NodeRef> {
        old.iter().map(|child| self.next(child)).collect()
    }
}

impl FormulaItem {
    pub fn new(kind: NodeKind) -> NodeRef {
        Arc::new(FormulaItem {
            kind,
            meta: NodeMeta::default(),
        })
    }

    pub fn with_meta(kind: NodeKind, meta: NodeMeta) -> NodeRef {
        Arc::new(FormulaItem { kind, meta })
    }

    pub fn level_tag(&self) -> Option<&LevelTag> {
        self.meta.level_tag.as_ref()
    }

    pub fn with_tag(&self, tag: LevelTag) -> NodeRef {
        Arc::new(FormulaItem {
            kind: self.kind.clone(),
            meta: self.meta.with_tag(tag),
        })
    }

    pub fn field_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Field { name } => Some(name),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&LiteralValue> {
        match &self.kind {
            NodeKind::Literal(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        self.literal().is_some()
    }

    pub fn func_call(&self) -> Option<&FuncCall> {
        match &self.kind {
            NodeKind::FuncCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn window_call(&self) -> Option<&WindowFuncCall> {
        match &self.kind {
            NodeKind::WindowFuncCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn query_fork(&self) -> Option<&QueryFork> {
        match &self.kind {
            NodeKind::QueryFork(fork) => Some(fork),
            _ => None,
        }
    }

    /// Function/operator name for call-like nodes.
    pub fn operation_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::FuncCall(call) => Some(&call.name),
            NodeKind::WindowFuncCall(call) => Some(&call.name),
            NodeKind::Binary { name, .. }
            | NodeKind::Unary { name, .. }
            | NodeKind::Ternary { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Operands of call-like nodes (function args or operator operands).
    pub fn operation_args(&self) -> Vec<NodeRef> {
        match &self.kind {
            NodeKind::FuncCall(call) => call.args.clone(),
            NodeKind::WindowFuncCall(call) => call.args.clone(),
            NodeKind::Binary { left, right, .. } => vec![left.clone(), right.clone()],
            NodeKind::Unary { expr, .. } => vec![expr.clone()],
            NodeKind::Ternary {
                first,
                second,
                third,
                ..
            } => vec![first.clone(), second.clone(), third.clone()],
            _ => Vec::new(),
        }
    }

    /// All child nodes in a fixed order. [`FormulaItem::with_children`] consumes the
    /// same order, and [`NodeIndex`] paths refer to it.
    pub fn children(&self) -> Vec<NodeRef> {
        match &self.kind {
            NodeKind::Field { .. } | NodeKind::Literal(_) | NodeKind::Error { .. } => Vec::new(),
            NodeKind::Parenthesized(expr) | NodeKind::Ordered { expr, .. } => vec![expr.clone()],
            NodeKind::Unary { expr, .. } => vec![expr.clone()],
            NodeKind::Binary { left, right, .. } => vec![left.clone(), right.clone()],
            NodeKind::Ternary {
                first,
                second,
                third,
                ..
            } => vec![first.clone(), second.clone(), third.clone()],
            NodeKind::FuncCall(call) => call
                .args
                .iter()
                .chain(call.lod.dims())
                .chain(call.ignore_dimensions.iter())
                .cloned()
                .collect(),
            NodeKind::WindowFuncCall(call) => call
                .args
                .iter()
                .chain(call.grouping.dims())
                .chain(call.ordering.iter())
                .cloned()
                .collect(),
            NodeKind::IfBlock {
                branches,
                else_expr,
            } => {
                let mut result = Vec::with_capacity(branches.len() * 2 + 1);
                for branch in branches {
                    result.push(branch.cond.clone());
                    result.push(branch.then.clone());
                }
                result.push(else_expr.clone());
                result
            }
            NodeKind::CaseBlock {
                case_expr,
                branches,
                else_expr,
            } => {
                let mut result = Vec::with_capacity(branches.len() * 2 + 2);
                result.push(case_expr.clone());
                for branch in branches {
                    result.push(branch.when.clone());
                    result.push(branch.then.clone());
                }
                result.push(else_expr.clone());
                result
            }
            NodeKind::QueryFork(fork) => {
                let mut result = vec![fork.result_expr.clone()];
                for condition in &fork.joining {
                    result.extend(condition.expressions().into_iter().cloned());
                }
                result.extend(fork.lod.dims().iter().cloned());
                for mutation in &fork.bfb_filter_mutations {
                    result.push(mutation.original.clone());
                    result.push(mutation.replacement.clone());
                }
                result
            }
        }
    }

    /// Positions (in [`FormulaItem::children`] order) of the children that are
    /// standalone expressions: arguments and operands, but not LOD dimensions,
    /// window groupings, orderings or join conditions.
    pub fn autonomous_child_indices(&self) -> std::ops::Range<usize> {
        match &self.kind {
            NodeKind::FuncCall(call) => 0..call.args.len(),
            NodeKind::WindowFuncCall(call) => 0..call.args.len(),
            NodeKind::QueryFork(_) => {
                QueryFork::RESULT_EXPR_INDEX..QueryFork::RESULT_EXPR_INDEX + 1
            }
            NodeKind::Ordered { .. } => 0..0,
            _ => 0..self.children().len(),
        }
    }

    pub fn autonomous_children(&self) -> Vec<NodeRef> {
        let children = self.children();
        self.autonomous_child_indices()
            .filter_map(|idx| children.get(idx).cloned())
            .collect()
    }

    /// Rebuild this node with `children` given in [`FormulaItem::children`] order.
    pub fn with_children(&self, children: Vec<NodeRef>) -> FormulaItem {
        let mut feed = ChildFeed(children.into_iter());
        let kind = match &self.kind {
            NodeKind::Field { .. } | NodeKind::Literal(_) | NodeKind::Error { .. } => {
                self.kind.clone()
            }
            NodeKind::Parenthesized(expr) => NodeKind::Parenthesized(feed.next(expr)),
            NodeKind::Ordered { expr, direction } => NodeKind::Ordered {
                expr: feed.next(expr),
                direction: *direction,
            },
            NodeKind::Unary { name, expr } => NodeKind::Unary {
                name: name.clone(),
                expr: feed.next(expr),
            },
            NodeKind::Binary { name, left, right } => NodeKind::Binary {
                name: name.clone(),
                left: feed.next(left),
                right: feed.next(right),
            },
            NodeKind::Ternary {
                name,
                first,
                second,
                third,
            } => NodeKind::Ternary {
                name: name.clone(),
                first: feed.next(first),
                second: feed.next(second),
                third: feed.next(third),
            },
            NodeKind::FuncCall(call) => {
                let args = feed.all(&call.args);
                let lod = call.lod.with_dims(feed.all(call.lod.dims()));
                let ignore_dimensions = feed.all(&call.ignore_dimensions);
                NodeKind::FuncCall(FuncCall {
                    name: call.name.clone(),
                    args,
                    lod,
                    ignore_dimensions,
                    before_filter_by: call.before_filter_by.clone(),
                })
            }
            NodeKind::WindowFuncCall(call) => {
                let args = feed.all(&call.args);
                let grouping = call.grouping.with_dims(feed.all(call.grouping.dims()));
                let ordering = feed.all(&call.ordering);
                NodeKind::WindowFuncCall(WindowFuncCall {
                    name: call.name.clone(),
                    args,
                    grouping,
                    ordering,
                    before_filter_by: call.before_filter_by.clone(),
                })
            }
            NodeKind::IfBlock {
                branches,
                else_expr,
            } => {
                let branches = branches
                    .iter()
                    .map(|branch| IfPart {
                        cond: feed.next(&branch.cond),
                        then: feed.next(&branch.then),
                    })
                    .collect();
                NodeKind::IfBlock {
                    branches,
                    else_expr: feed.next(else_expr),
                }
            }
            NodeKind::CaseBlock {
                case_expr,
                branches,
                else_expr,
            } => {
                let case_expr = feed.next(case_expr);
                let branches = branches
                    .iter()
                    .map(|branch| WhenPart {
                        when: feed.next(&branch.when),
                        then: feed.next(&branch.then),
                    })
                    .collect();
                NodeKind::CaseBlock {
                    case_expr,
                    branches,
                    else_expr: feed.next(else_expr),
                }
            }
            NodeKind::QueryFork(fork) => {
                let result_expr = feed.next(&fork.result_expr);
                let joining = fork
                    .joining
                    .iter()
                    .map(|condition| match condition {
                        JoinCondition::SelfEquality { expr } => JoinCondition::SelfEquality {
                            expr: feed.next(expr),
                        },
                        JoinCondition::Binary { expr, fork_expr } => JoinCondition::Binary {
                            expr: feed.next(expr),
                            fork_expr: feed.next(fork_expr),
                        },
                    })
                    .collect();
                let lod = fork.lod.with_dims(feed.all(fork.lod.dims()));
                let bfb_filter_mutations = fork
                    .bfb_filter_mutations
                    .iter()
                    .map(|mutation| BfbFilterMutation {
                        original: feed.next(&mutation.original),
                        replacement: feed.next(&mutation.replacement),
                    })
                    .collect();
                NodeKind::QueryFork(QueryFork {
                    join_type: fork.join_type,
                    result_expr,
                    joining,
                    lod,
                    before_filter_by: fork.before_filter_by.clone(),
                    bfb_filter_mutations,
                })
            }
        };
        FormulaItem {
            kind,
            meta: self.meta.clone(),
        }
    }

    /// Total number of nodes in the subtree.
    pub fn complexity(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(|child| child.complexity())
            .sum::<usize>()
    }

    /// Visit every node of the subtree (pre-order), including `self`.
    pub fn walk(self: &Arc<Self>, visit: &mut dyn FnMut(&NodeRef)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }
}

/// Get the node at `index` below `root`.
pub fn get_at(root: &NodeRef, index: &[usize]) -> Option<NodeRef> {
    let mut node = root.clone();
    for &pos in index {
        node = node.children().get(pos)?.clone();
    }
    Some(node)
}

/// Replace the node at `index` below `root`, rebuilding every ancestor on the way.
pub fn replace_at(root: &NodeRef, index: &[usize], replacement: NodeRef) -> Option<NodeRef> {
    let Some((&first, rest)) = index.split_first() else {
        return Some(replacement);
    };
    let mut children = root.children();
    let child = children.get(first)?.clone();
    children[first] = replace_at(&child, rest, replacement)?;
    Some(Arc::new(root.with_children(children)))
}

/// Bottom-up rewrite of a tree.
///
/// Children are rewritten first; then each (rewritten) child is tested with `matcher` and,
/// on a match, swapped for `replacer`'s result. Replacement results are not traversed
/// again. The root itself is tested last with an empty parent stack. The parent stack
/// holds the original ancestors, outermost first.
///
/// Returns the same `Arc` when nothing changed.
pub fn replace_nodes<M, R>(root: &NodeRef, matcher: &mut M, replacer: &mut R) -> NodeRef
where
    M: FnMut(&NodeRef, &[NodeRef]) -> bool,
    R: FnMut(&NodeRef, &[NodeRef]) -> NodeRef,
{
    let mut stack = Vec::new();
    let new_root = replace_children(root, &mut stack, matcher, replacer);
    if matcher(&new_root, &stack) {
        let replaced = replacer(&new_root, &stack);
        if replaced != *root {
            return replaced;
        }
        return root.clone();
    }
    new_root
}

fn replace_children<M, R>(
    node: &NodeRef,
    stack: &mut Vec<NodeRef>,
    matcher: &mut M,
    replacer: &mut R,
) -> NodeRef
where
    M: FnMut(&NodeRef, &[NodeRef]) -> bool,
    R: FnMut(&NodeRef, &[NodeRef]) -> NodeRef,
{
    let children = node.children();
    if children.is_empty() {
        return node.clone();
    }

    stack.push(node.clone());
    let mut modified = false;
    let mut new_children = Vec::with_capacity(children.len());
    for child in children {
        let mut new_child = replace_children(&child, stack, matcher, replacer);
        if matcher(&new_child, stack) {
            new_child = replacer(&new_child, stack);
        }
        if Arc::ptr_eq(&new_child, &child) || new_child == child {
            new_children.push(child);
        } else {
            modified = true;
            new_children.push(new_child);
        }
    }
    stack.pop();

    if modified {
        Arc::new(node.with_children(new_children))
    } else {
        node.clone()
    }
}

/// `(index, node)` pairs for the autonomous children of `node`, with indices
/// prefixed by `prefix`.
pub fn enumerate_autonomous_children(node: &NodeRef, prefix: &[usize]) -> Vec<(NodeIndex, NodeRef)> {
    let children = node.children();
    node.autonomous_child_indices()
        .filter_map(|idx| {
            let child = children.get(idx)?.clone();
            let mut index = prefix.to_vec();
            index.push(idx);
            Some((index, child))
        })
        .collect()
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[NodeRef]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_bfb(f: &mut fmt::Formatter<'_>, bfb: &BeforeFilterBy) -> fmt::Result {
    if bfb.is_empty() {
        return Ok(());
    }
    f.write_str(" BEFORE FILTER BY ")?;
    for (idx, name) in bfb.names().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "[{name}]")?;
    }
    Ok(())
}

impl fmt::Display for FormulaItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            NodeKind::Field { name } => write!(f, "[{name}]"),
            NodeKind::Literal(value) => write!(f, "{value}"),
            NodeKind::Parenthesized(expr) => write!(f, "({expr})"),
            NodeKind::Ordered { expr, direction } => match direction {
                OrderDirection::Asc => write!(f, "{expr} ASC"),
                OrderDirection::Desc => write!(f, "{expr} DESC"),
            },
            NodeKind::Unary { name, expr } => write!(f, "{}({expr})", name.to_uppercase()),
            NodeKind::Binary { name, left, right } => write!(f, "{left} {name} {right}"),
            NodeKind::Ternary {
                name,
                first,
                second,
                third,
            } => write!(f, "{}({first}, {second}, {third})", name.to_uppercase()),
            NodeKind::FuncCall(call) => {
                write!(f, "{}(", call.name.to_uppercase())?;
                write_list(f, &call.args)?;
                match &call.lod {
                    LodSpecifier::Fixed(dims) => {
                        f.write_str(" FIXED ")?;
                        write_list(f, dims)?;
                    }
                    LodSpecifier::Include(dims) => {
                        f.write_str(" INCLUDE ")?;
                        write_list(f, dims)?;
                    }
                    LodSpecifier::Exclude(dims) => {
                        f.write_str(" EXCLUDE ")?;
                        write_list(f, dims)?;
                    }
                    LodSpecifier::Inherited | LodSpecifier::DefaultAggregation => {}
                }
                if !call.ignore_dimensions.is_empty() {
                    f.write_str(" IGNORE DIMENSIONS ")?;
                    write_list(f, &call.ignore_dimensions)?;
                }
                write_bfb(f, &call.before_filter_by)?;
                f.write_str(")")
            }
            NodeKind::WindowFuncCall(call) => {
                write!(f, "{}(", call.name.to_uppercase())?;
                write_list(f, &call.args)?;
                match &call.grouping {
                    WindowGrouping::Total => f.write_str(" TOTAL")?,
                    WindowGrouping::Within(dims) => {
                        f.write_str(" WITHIN ")?;
                        write_list(f, dims)?;
                    }
                    WindowGrouping::Among(dims) => {
                        f.write_str(" AMONG ")?;
                        write_list(f, dims)?;
                    }
                }
                if !call.ordering.is_empty() {
                    f.write_str(" ORDER BY ")?;
                    write_list(f, &call.ordering)?;
                }
                write_bfb(f, &call.before_filter_by)?;
                f.write_str(")")
            }
            NodeKind::IfBlock {
                branches,
                else_expr,
            } => {
                for (idx, branch) in branches.iter().enumerate() {
                    let keyword = if idx == 0 { "IF" } else { " ELSEIF" };
                    write!(f, "{keyword} {} THEN {}", branch.cond, branch.then)?;
                }
                write!(f, " ELSE {else_expr} END")
            }
            NodeKind::CaseBlock {
                case_expr,
                branches,
                else_expr,
            } => {
                write!(f, "CASE {case_expr}")?;
                for branch in branches {
                    write!(f, " WHEN {} THEN {}", branch.when, branch.then)?;
                }
                write!(f, " ELSE {else_expr} END")
            }
            NodeKind::QueryFork(fork) => write!(f, "QUERY_FORK({})", fork.result_expr),
            NodeKind::Error { message, .. } => write!(f, "#ERROR({message})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shortcuts as n;
    use pretty_assertions::assert_eq;

    #[test]
    fn children_round_trip_through_with_children() {
        let node = n::func_lod(
            "sum",
            [n::field("sales")],
            LodSpecifier::Include(vec![n::field("city")]),
        );
        let rebuilt = Arc::new(node.with_children(node.children()));
        assert_eq!(rebuilt, node);
        assert_eq!(node.children().len(), 2);
        assert_eq!(node.autonomous_child_indices(), 0..1);
    }

    #[test]
    fn replace_nodes_returns_same_arc_when_unchanged() {
        let node = n::binary("+", n::field("a"), n::lit_int(1));
        let result = replace_nodes(&node, &mut |_, _| false, &mut |node, _| node.clone());
        assert!(Arc::ptr_eq(&result, &node));
    }

    #[test]
    fn replace_nodes_is_bottom_up_with_parent_stack() {
        let node = n::func("sum", [n::binary("+", n::field("a"), n::field("b"))]);
        let mut depths = Vec::new();
        let result = replace_nodes(
            &node,
            &mut |node, stack| {
                if node.field_name() == Some("a") {
                    depths.push(stack.len());
                    return true;
                }
                false
            },
            &mut |_, _| n::field("z"),
        );
        assert_eq!(depths, vec![2]);
        assert_eq!(
            result,
            n::func("sum", [n::binary("+", n::field("z"), n::field("b"))])
        );
    }

    #[test]
    fn get_and_replace_at_index() {
        let node = n::binary("*", n::func("sum", [n::field("a")]), n::lit_int(2));
        assert_eq!(get_at(&node, &[0, 0]), Some(n::field("a")));
        let replaced = replace_at(&node, &[0], n::field("res")).expect("valid index");
        assert_eq!(replaced, n::binary("*", n::field("res"), n::lit_int(2)));
        assert_eq!(get_at(&node, &[5]), None);
    }

    #[test]
    fn tagged_node_differs_from_untagged() {
        let plain = n::field("a");
        let tagged = plain.with_tag(LevelTag::new(["x"], 0));
        assert!(plain != tagged);
        assert_eq!(plain.complexity(), 1);
    }

    #[test]
    fn nodes_serialize_to_json() {
        let node = n::func("sum", [n::field("sales")]);
        let json = serde_json::to_string(&node).expect("serialize");
        let back: NodeRef = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, node);
    }
}
