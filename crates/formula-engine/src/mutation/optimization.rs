//! Constant folding and other simplifications.

use std::mem::discriminant;

use formula_core::shortcuts as n;
use formula_core::{DialectCombo, FormulaItem, FuncCall, IfPart, LiteralValue, NodeKind, NodeRef, WhenPart};
use ordered_float::OrderedFloat;

use crate::inspect;
use crate::mutation::{apply_mutations_to_fixpoint, FormulaMutation};

const EQUALITY_OPERATORS: &[&str] = &["==", "_==", "!=", "_!="];

/// Folded literal in place of `old`, keeping its meta.
fn folded(old: &NodeRef, value: LiteralValue) -> NodeRef {
    FormulaItem::with_meta(NodeKind::Literal(value), old.meta.clone())
}

/// `literal == literal` and friends.
pub struct ConstComparisonMutation;

impl FormulaMutation for ConstComparisonMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        let NodeKind::Binary { name, left, right } = &node.kind else {
            return false;
        };
        if !EQUALITY_OPERATORS.contains(&name.as_str()) {
            return false;
        }
        let (Some(l), Some(r)) = (left.literal(), right.literal()) else {
            return false;
        };
        // Plain comparisons with NULL are NULL, only the null-safe ones fold.
        if *l == LiteralValue::Null || *r == LiteralValue::Null {
            return name.starts_with('_');
        }
        discriminant(l) == discriminant(r)
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let NodeKind::Binary { name, left, right } = &old.kind else {
            return old.clone();
        };
        let equal = left.literal() == right.literal();
        let negated = name.ends_with("!=");
        folded(old, LiteralValue::Boolean(equal != negated))
    }
}

enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn from_literal(node: &NodeRef) -> Option<Number> {
        match node.literal()? {
            LiteralValue::Integer(v) => Some(Number::Int(*v)),
            LiteralValue::Float(v) => Some(Number::Float(v.0)),
            _ => None,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Number::Int(v) => *v as f64,
            Number::Float(v) => *v,
        }
    }
}

fn fold_math(op: &str, left: &Number, right: &Number) -> Option<LiteralValue> {
    if let (Number::Int(l), Number::Int(r)) = (left, right) {
        let folded = match op {
            "+" => l.checked_add(*r),
            "-" => l.checked_sub(*r),
            "*" => l.checked_mul(*r),
            "/" if *r != 0 => return Some(LiteralValue::Float(OrderedFloat(*l as f64 / *r as f64))),
            _ => None,
        };
        return folded.map(LiteralValue::Integer);
    }
    let (l, r) = (left.as_f64(), right.as_f64());
    let folded = match op {
        "+" => l + r,
        "-" => l - r,
        "*" => l * r,
        "/" if r != 0.0 => l / r,
        _ => return None,
    };
    folded
        .is_finite()
        .then_some(LiteralValue::Float(OrderedFloat(folded)))
}

/// Arithmetic on numeric literals.
pub struct ConstMathMutation;

impl ConstMathMutation {
    fn fold(node: &NodeRef) -> Option<LiteralValue> {
        let NodeKind::Binary { name, left, right } = &node.kind else {
            return None;
        };
        fold_math(name, &Number::from_literal(left)?, &Number::from_literal(right)?)
    }
}

impl FormulaMutation for ConstMathMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        Self::fold(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        Self::fold(old)
            .map(|value| folded(old, value))
            .unwrap_or_else(|| old.clone())
    }
}

pub type UnaryBoolFn = fn(&LiteralValue) -> bool;

fn is_null(value: &LiteralValue) -> bool {
    *value == LiteralValue::Null
}

/// Single-argument boolean functions folded when their argument is a literal.
///
/// `ANY` rows are the defaults; a row for a narrower combo overrides them for
/// the dialects it covers.
pub const UNARY_BOOL_FUNCTIONS: &[(&str, DialectCombo, UnaryBoolFn)] =
    &[("isnull", DialectCombo::ANY, is_null)];

/// `ISNULL(literal)` and the other [`UNARY_BOOL_FUNCTIONS`].
pub struct UnaryBoolFunctionMutation {
    dialect: DialectCombo,
    functions: &'static [(&'static str, DialectCombo, UnaryBoolFn)],
}

impl UnaryBoolFunctionMutation {
    pub fn new(dialect: DialectCombo) -> Self {
        UnaryBoolFunctionMutation {
            dialect,
            functions: UNARY_BOOL_FUNCTIONS,
        }
    }

    pub fn with_functions(mut self, functions: &'static [(&'static str, DialectCombo, UnaryBoolFn)]) -> Self {
        self.functions = functions;
        self
    }

    /// The most specific row for `name` covering the dialect.
    fn function_for(&self, name: &str) -> Option<UnaryBoolFn> {
        self.functions
            .iter()
            .filter(|(func_name, dialects, _)| {
                func_name.eq_ignore_ascii_case(name)
                    && (*dialects == DialectCombo::ANY
                        || (!self.dialect.is_empty() && dialects.contains(self.dialect)))
            })
            .min_by_key(|(_, dialects, _)| dialects.len())
            .map(|(_, _, f)| *f)
    }

    fn fold(&self, node: &NodeRef) -> Option<bool> {
        let call = node.func_call()?;
        if call.args.len() != 1 {
            return None;
        }
        let value = call.args[0].literal()?;
        Some(self.function_for(&call.name)?(value))
    }
}

impl FormulaMutation for UnaryBoolFunctionMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        self.fold(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        match self.fold(old) {
            Some(value) => folded(old, LiteralValue::Boolean(value)),
            None => old.clone(),
        }
    }
}

/// `AND`/`OR` with a literal operand.
pub struct ConstAndOrMutation;

impl FormulaMutation for ConstAndOrMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        matches!(
            &node.kind,
            NodeKind::Binary { name, left, right }
                if (name == "and" || name == "or") && (left.is_literal() || right.is_literal())
        )
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let NodeKind::Binary { name, left, right } = &old.kind else {
            return old.clone();
        };
        let (constant, other) = match left.literal() {
            Some(value) => (value, right),
            None => match right.literal() {
                Some(value) => (value, left),
                None => return old.clone(),
            },
        };
        match (name.as_str(), constant.is_truthy()) {
            ("and", true) | ("or", false) => other.clone(),
            ("and", false) => folded(old, LiteralValue::Boolean(false)),
            _ => folded(old, LiteralValue::Boolean(true)),
        }
    }
}

fn is_true_literal(node: &NodeRef) -> bool {
    node.literal() == Some(&LiteralValue::Boolean(true))
}

/// Conditionals whose conditions (or case operand) are constant.
pub struct ConstFuncMutation;

impl ConstFuncMutation {
    fn simplify_if(branches: &[(NodeRef, NodeRef)], else_expr: &NodeRef) -> (Vec<(NodeRef, NodeRef)>, NodeRef) {
        let mut kept = Vec::new();
        for (cond, then) in branches {
            if is_true_literal(cond) {
                return (kept, then.clone());
            }
            if !cond.is_literal() {
                kept.push((cond.clone(), then.clone()));
            }
        }
        (kept, else_expr.clone())
    }

    fn simplify_case(
        case_expr: &NodeRef,
        branches: &[(NodeRef, NodeRef)],
        else_expr: &NodeRef,
    ) -> (Vec<(NodeRef, NodeRef)>, NodeRef) {
        let mut kept = Vec::new();
        let value = case_expr.literal();
        for (when, then) in branches {
            match when.literal() {
                Some(candidate) if Some(candidate) == value => return (kept, then.clone()),
                Some(_) => {}
                None => kept.push((when.clone(), then.clone())),
            }
        }
        (kept, else_expr.clone())
    }

    fn pairs(args: &[NodeRef]) -> Vec<(NodeRef, NodeRef)> {
        args.chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    fn flatten(pairs: Vec<(NodeRef, NodeRef)>, tail: NodeRef) -> Vec<NodeRef> {
        let mut args = Vec::with_capacity(pairs.len() * 2 + 1);
        for (first, second) in pairs {
            args.push(first);
            args.push(second);
        }
        args.push(tail);
        args
    }

    fn rebuild_call(call: &FuncCall, args: Vec<NodeRef>) -> NodeRef {
        n::func_full(
            call.name.clone(),
            args,
            call.lod.clone(),
            call.before_filter_by.clone(),
        )
    }

    fn simplify(node: &NodeRef) -> Option<NodeRef> {
        match &node.kind {
            NodeKind::FuncCall(call) if call.name.eq_ignore_ascii_case("if") => {
                let (last, rest) = call.args.split_last()?;
                if rest.len() % 2 != 0 {
                    return None;
                }
                let (kept, tail) = Self::simplify_if(&Self::pairs(rest), last);
                let args = Self::flatten(kept, tail);
                match args.len() {
                    len if len == call.args.len() => None,
                    1 => args.into_iter().next(),
                    _ => Some(Self::rebuild_call(call, args)),
                }
            }
            NodeKind::FuncCall(call) if call.name.eq_ignore_ascii_case("case") => {
                if call.args.len() < 2 || call.args.len() % 2 != 0 || !call.args[0].is_literal() {
                    return None;
                }
                let (last, rest) = call.args.split_last()?;
                let (case_expr, branches) = rest.split_first()?;
                let (kept, tail) = Self::simplify_case(case_expr, &Self::pairs(branches), last);
                let mut args = vec![case_expr.clone()];
                args.extend(Self::flatten(kept, tail));
                match args.len() {
                    len if len == call.args.len() => None,
                    2 => args.pop(),
                    _ => Some(Self::rebuild_call(call, args)),
                }
            }
            NodeKind::IfBlock {
                branches,
                else_expr,
            } => {
                let pairs: Vec<_> = branches
                    .iter()
                    .map(|b| (b.cond.clone(), b.then.clone()))
                    .collect();
                let (kept, tail) = Self::simplify_if(&pairs, else_expr);
                if kept.len() == branches.len() && tail == *else_expr {
                    return None;
                }
                if kept.is_empty() {
                    return Some(tail);
                }
                Some(FormulaItem::with_meta(
                    NodeKind::IfBlock {
                        branches: kept
                            .into_iter()
                            .map(|(cond, then)| IfPart { cond, then })
                            .collect(),
                        else_expr: tail,
                    },
                    node.meta.clone(),
                ))
            }
            NodeKind::CaseBlock {
                case_expr,
                branches,
                else_expr,
            } if case_expr.is_literal() => {
                let pairs: Vec<_> = branches
                    .iter()
                    .map(|b| (b.when.clone(), b.then.clone()))
                    .collect();
                let (kept, tail) = Self::simplify_case(case_expr, &pairs, else_expr);
                if kept.len() == branches.len() && tail == *else_expr {
                    return None;
                }
                if kept.is_empty() {
                    return Some(tail);
                }
                Some(FormulaItem::with_meta(
                    NodeKind::CaseBlock {
                        case_expr: case_expr.clone(),
                        branches: kept
                            .into_iter()
                            .map(|(when, then)| WhenPart { when, then })
                            .collect(),
                        else_expr: tail,
                    },
                    node.meta.clone(),
                ))
            }
            _ => None,
        }
    }
}

impl FormulaMutation for ConstFuncMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        Self::simplify(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        Self::simplify(old).unwrap_or_else(|| old.clone())
    }
}

const COLLAPSIBLE_AGGREGATIONS: &[&str] = &["sum", "avg", "min", "max"];

/// `AVG(SUM(x))` at the same level of detail is just `SUM(x)`.
pub struct DoubleAggregationCollapsingMutation;

impl DoubleAggregationCollapsingMutation {
    fn inner(node: &NodeRef) -> Option<&NodeRef> {
        let outer = node.func_call()?;
        if !COLLAPSIBLE_AGGREGATIONS.contains(&outer.name.to_ascii_lowercase().as_str())
            || !outer.lod.is_inherited()
            || !outer.ignore_dimensions.is_empty()
            || outer.args.len() != 1
        {
            return None;
        }
        let arg = &outer.args[0];
        let inner = arg.func_call()?;
        let collapsible = inspect::is_aggregate_function(arg)
            && inner.lod.is_inherited()
            && (outer.before_filter_by.is_empty() || outer.before_filter_by == inner.before_filter_by);
        collapsible.then_some(arg)
    }
}

impl FormulaMutation for DoubleAggregationCollapsingMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        Self::inner(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        Self::inner(old).cloned().unwrap_or_else(|| old.clone())
    }
}

const COMPARISON_INVERSIONS: &[(&str, &str)] = &[
    (">", "<="),
    (">=", "<"),
    ("<", ">="),
    ("<=", ">"),
    ("==", "!="),
    ("!=", "=="),
    ("in", "notin"),
    ("notin", "in"),
];

fn zero_one_value(node: &NodeRef) -> Option<bool> {
    match node.literal()? {
        LiteralValue::Boolean(v) => Some(*v),
        LiteralValue::Integer(0) => Some(false),
        LiteralValue::Integer(1) => Some(true),
        LiteralValue::Float(v) if v.0 == 0.0 => Some(false),
        LiteralValue::Float(v) if v.0 == 1.0 => Some(true),
        _ => None,
    }
}

fn is_boolean_operation(node: &NodeRef) -> bool {
    matches!(
        &node.kind,
        NodeKind::Binary { name, .. }
            if name == "and"
                || name == "or"
                || COMPARISON_INVERSIONS.iter().any(|(op, _)| op == name)
    )
}

/// `(a > b) == 0` style comparisons of boolean operations with 0/1 in filters.
pub struct OptimizeZeroOneComparisonMutation;

impl OptimizeZeroOneComparisonMutation {
    fn parts(node: &NodeRef) -> Option<(&NodeRef, bool)> {
        let NodeKind::Binary { name, left, right } = &node.kind else {
            return None;
        };
        let negated = match name.as_str() {
            "==" => false,
            "!=" => true,
            _ => return None,
        };
        let (operation, value) = if is_boolean_operation(left) {
            (left, zero_one_value(right)?)
        } else if is_boolean_operation(right) {
            (right, zero_one_value(left)?)
        } else {
            return None;
        };
        Some((operation, value != negated))
    }

    fn invert(operation: &NodeRef) -> NodeRef {
        let NodeKind::Binary { name, left, right } = &operation.kind else {
            return n::unary("not", operation.clone());
        };
        match COMPARISON_INVERSIONS.iter().find(|(op, _)| op == name) {
            Some((_, inverted)) => n::binary(*inverted, left.clone(), right.clone()),
            None => n::unary("not", operation.clone()),
        }
    }
}

impl FormulaMutation for OptimizeZeroOneComparisonMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        Self::parts(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        match Self::parts(old) {
            Some((operation, true)) => operation.clone(),
            Some((operation, false)) => Self::invert(operation),
            None => old.clone(),
        }
    }
}

fn optimizations(unary_bool: &UnaryBoolFunctionMutation) -> [&dyn FormulaMutation; 6] {
    [
        &ConstMathMutation,
        &DoubleAggregationCollapsingMutation,
        &ConstComparisonMutation,
        &ConstAndOrMutation,
        unary_bool,
        &ConstFuncMutation,
    ]
}

/// Run the constant-folding passes for `dialect` until the formula is stable.
pub fn optimize_formula(tree: &NodeRef, dialect: DialectCombo) -> NodeRef {
    let unary_bool = UnaryBoolFunctionMutation::new(dialect);
    apply_mutations_to_fixpoint(tree, &optimizations(&unary_bool))
}

/// [`optimize_formula`] plus simplifications only valid in a boolean filter context.
pub fn optimize_filter(tree: &NodeRef, dialect: DialectCombo) -> NodeRef {
    let unary_bool = UnaryBoolFunctionMutation::new(dialect);
    let mut mutations: Vec<&dyn FormulaMutation> = vec![&OptimizeZeroOneComparisonMutation];
    mutations.extend(optimizations(&unary_bool));
    apply_mutations_to_fixpoint(tree, &mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::LevelTag;
    use pretty_assertions::assert_eq;

    fn optimize(tree: &NodeRef) -> NodeRef {
        optimize_formula(tree, DialectCombo::DUMMY)
    }

    fn optimize_filters(tree: &NodeRef) -> NodeRef {
        optimize_filter(tree, DialectCombo::DUMMY)
    }

    #[test]
    fn folds_arithmetic() {
        let tree = n::binary(
            "*",
            n::binary("+", n::lit_int(1), n::lit_int(2)),
            n::lit_float(1.5),
        );
        assert_eq!(optimize(&tree), n::lit_float(4.5));
        assert_eq!(
            optimize(&n::binary("/", n::lit_int(1), n::lit_int(0))),
            n::binary("/", n::lit_int(1), n::lit_int(0))
        );
        assert_eq!(
            optimize(&n::binary("+", n::lit_int(i64::MAX), n::lit_int(1))),
            n::binary("+", n::lit_int(i64::MAX), n::lit_int(1))
        );
    }

    #[test]
    fn folds_comparisons_and_logic() {
        let tree = n::binary(
            "and",
            n::binary("==", n::lit_str("a"), n::lit_str("a")),
            n::binary(">", n::field("x"), n::lit_int(0)),
        );
        assert_eq!(
            optimize(&tree),
            n::binary(">", n::field("x"), n::lit_int(0))
        );
        assert_eq!(
            optimize(&n::binary("or", n::field("flag"), n::lit_bool(true))),
            n::lit_bool(true)
        );
    }

    #[test]
    fn prunes_constant_conditions() {
        let tree = n::func(
            "if",
            [
                n::lit_bool(false),
                n::lit_int(1),
                n::field("c"),
                n::lit_int(2),
                n::lit_bool(true),
                n::lit_int(3),
                n::lit_int(4),
            ],
        );
        assert_eq!(
            optimize(&tree),
            n::func("if", [n::field("c"), n::lit_int(2), n::lit_int(3)])
        );

        let case = n::func(
            "case",
            [n::lit_str("b"), n::lit_str("a"), n::lit_int(1), n::lit_str("b"), n::lit_int(2), n::lit_int(0)],
        );
        assert_eq!(optimize(&case), n::lit_int(2));

        let block = n::if_block([(n::lit_bool(true), n::field("a"))], n::field("b"));
        assert_eq!(optimize(&block), n::field("a"));
    }

    #[test]
    fn collapses_double_aggregation() {
        let tree = n::func("max", [n::func("sum", [n::field("x")])]);
        assert_eq!(optimize(&tree), n::func("sum", [n::field("x")]));

        let with_lod = n::func(
            "avg",
            [n::func_lod("sum", [n::field("x")], n::include([n::field("city")]))],
        );
        assert_eq!(optimize(&with_lod), with_lod);
    }

    #[test]
    fn zero_one_comparisons_in_filters() {
        let cmp = n::binary(">", n::field("x"), n::lit_int(5));
        assert_eq!(
            optimize_filters(&n::binary("==", cmp.clone(), n::lit_int(1))),
            cmp
        );
        assert_eq!(
            optimize_filters(&n::binary("==", n::lit_bool(false), cmp)),
            n::binary("<=", n::field("x"), n::lit_int(5))
        );
        let both = n::binary("and", n::field("a"), n::field("b"));
        assert_eq!(
            optimize_filters(&n::binary("!=", both.clone(), n::lit_int(1))),
            n::unary("not", both)
        );
    }

    #[test]
    fn isnull_of_literal() {
        assert_eq!(
            optimize(&n::func("isnull", [n::lit_null()])),
            n::lit_bool(true)
        );
    }

    fn is_null_or_empty(value: &LiteralValue) -> bool {
        match value {
            LiteralValue::Null => true,
            LiteralValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    const EMPTY_IS_NULL: &[(&str, DialectCombo, UnaryBoolFn)] = &[
        ("isnull", DialectCombo::ANY, is_null),
        ("isnull", DialectCombo::CLICKHOUSE, is_null_or_empty),
    ];

    #[test]
    fn unary_bool_functions_follow_dialect_overrides() {
        let tree = n::func("isnull", [n::lit_str("")]);
        let fold = |dialect| {
            let mutation = UnaryBoolFunctionMutation::new(dialect).with_functions(EMPTY_IS_NULL);
            apply_mutations_to_fixpoint(&tree, &[&mutation])
        };
        assert_eq!(fold(DialectCombo::POSTGRESQL_9_4), n::lit_bool(false));
        assert_eq!(fold(DialectCombo::CLICKHOUSE_21_8), n::lit_bool(true));
        assert_eq!(fold(DialectCombo::EMPTY), n::lit_bool(false));
        assert_eq!(
            optimize_formula(&tree, DialectCombo::CLICKHOUSE_21_8),
            n::lit_bool(false)
        );
        assert_eq!(
            optimize(&n::func("isnull", [n::field("x")])),
            n::func("isnull", [n::field("x")])
        );
    }

    #[test]
    fn folded_literals_keep_the_level_tag() {
        let tag = LevelTag::new(["a"], 1);
        let sum = n::tagged(tag.clone(), n::binary("+", n::lit_int(1), n::lit_int(2)));
        let folded = optimize(&sum);
        assert_eq!(folded, n::tagged(tag.clone(), n::lit_int(3)));
        assert_eq!(folded.level_tag(), Some(&tag));

        let isnull = n::tagged(tag.clone(), n::func("isnull", [n::lit_int(1)]));
        assert_eq!(optimize(&isnull).level_tag(), Some(&tag));

        let cmp = n::tagged(tag.clone(), n::binary("==", n::lit_str("a"), n::lit_str("b")));
        assert_eq!(optimize(&cmp).level_tag(), Some(&tag));

        let and = n::tagged(tag.clone(), n::binary("and", n::field("x"), n::lit_bool(false)));
        assert_eq!(optimize(&and).level_tag(), Some(&tag));
    }
}
