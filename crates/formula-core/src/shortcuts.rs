//! Terse constructors for building formula trees by hand (tests, tools).

use chrono::NaiveDate;
use ordered_float::OrderedFloat;

use crate::fork::{JoinCondition, JoinType, QueryFork};
use crate::nodes::{
    BeforeFilterBy, FormulaItem, FuncCall, IfPart, LiteralValue, LodSpecifier, NodeKind, NodeRef,
    OrderDirection, WhenPart, WindowFuncCall, WindowGrouping,
};
use crate::tag::LevelTag;

pub fn field(name: impl Into<String>) -> NodeRef {
    FormulaItem::new(NodeKind::Field { name: name.into() })
}

pub fn lit(value: LiteralValue) -> NodeRef {
    FormulaItem::new(NodeKind::Literal(value))
}

pub fn lit_int(value: i64) -> NodeRef {
    lit(LiteralValue::Integer(value))
}

pub fn lit_float(value: f64) -> NodeRef {
    lit(LiteralValue::Float(OrderedFloat(value)))
}

pub fn lit_bool(value: bool) -> NodeRef {
    lit(LiteralValue::Boolean(value))
}

pub fn lit_str(value: impl Into<String>) -> NodeRef {
    lit(LiteralValue::String(value.into()))
}

pub fn lit_null() -> NodeRef {
    lit(LiteralValue::Null)
}

/// Returns a `NULL` literal for an invalid date instead of panicking.
pub fn lit_date(year: i32, month: u32, day: u32) -> NodeRef {
    match NaiveDate::from_ymd_opt(year, month, day) {
        Some(date) => lit(LiteralValue::Date(date)),
        None => lit_null(),
    }
}

pub fn lit_array_int(values: impl IntoIterator<Item = i64>) -> NodeRef {
    lit(LiteralValue::ArrayInt(values.into_iter().collect()))
}

pub fn lit_array_str<S: Into<String>>(values: impl IntoIterator<Item = S>) -> NodeRef {
    lit(LiteralValue::ArrayStr(
        values.into_iter().map(Into::into).collect(),
    ))
}

pub fn func(name: impl Into<String>, args: impl IntoIterator<Item = NodeRef>) -> NodeRef {
    func_full(name, args, LodSpecifier::Inherited, BeforeFilterBy::default())
}

pub fn func_lod(
    name: impl Into<String>,
    args: impl IntoIterator<Item = NodeRef>,
    lod: LodSpecifier,
) -> NodeRef {
    func_full(name, args, lod, BeforeFilterBy::default())
}

pub fn func_bfb<S: Into<String>>(
    name: impl Into<String>,
    args: impl IntoIterator<Item = NodeRef>,
    bfb: impl IntoIterator<Item = S>,
) -> NodeRef {
    func_full(name, args, LodSpecifier::Inherited, BeforeFilterBy::new(bfb))
}

pub fn func_full(
    name: impl Into<String>,
    args: impl IntoIterator<Item = NodeRef>,
    lod: LodSpecifier,
    before_filter_by: BeforeFilterBy,
) -> NodeRef {
    FormulaItem::new(NodeKind::FuncCall(FuncCall {
        name: name.into(),
        args: args.into_iter().collect(),
        lod,
        ignore_dimensions: Vec::new(),
        before_filter_by,
    }))
}

pub fn fixed(dims: impl IntoIterator<Item = NodeRef>) -> LodSpecifier {
    LodSpecifier::Fixed(dims.into_iter().collect())
}

pub fn include(dims: impl IntoIterator<Item = NodeRef>) -> LodSpecifier {
    LodSpecifier::Include(dims.into_iter().collect())
}

pub fn exclude(dims: impl IntoIterator<Item = NodeRef>) -> LodSpecifier {
    LodSpecifier::Exclude(dims.into_iter().collect())
}

/// Window call with `TOTAL` grouping and no ordering.
pub fn wfunc(name: impl Into<String>, args: impl IntoIterator<Item = NodeRef>) -> NodeRef {
    wfunc_full(
        name,
        args,
        WindowGrouping::Total,
        Vec::new(),
        BeforeFilterBy::default(),
    )
}

pub fn wfunc_bfb<S: Into<String>>(
    name: impl Into<String>,
    args: impl IntoIterator<Item = NodeRef>,
    bfb: impl IntoIterator<Item = S>,
) -> NodeRef {
    wfunc_full(
        name,
        args,
        WindowGrouping::Total,
        Vec::new(),
        BeforeFilterBy::new(bfb),
    )
}

pub fn wfunc_full(
    name: impl Into<String>,
    args: impl IntoIterator<Item = NodeRef>,
    grouping: WindowGrouping,
    ordering: Vec<NodeRef>,
    before_filter_by: BeforeFilterBy,
) -> NodeRef {
    FormulaItem::new(NodeKind::WindowFuncCall(WindowFuncCall {
        name: name.into(),
        args: args.into_iter().collect(),
        grouping,
        ordering,
        before_filter_by,
    }))
}

pub fn within(dims: impl IntoIterator<Item = NodeRef>) -> WindowGrouping {
    WindowGrouping::Within(dims.into_iter().collect())
}

pub fn among(dims: impl IntoIterator<Item = NodeRef>) -> WindowGrouping {
    WindowGrouping::Among(dims.into_iter().collect())
}

pub fn binary(name: impl Into<String>, left: NodeRef, right: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Binary {
        name: name.into(),
        left,
        right,
    })
}

pub fn unary(name: impl Into<String>, expr: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Unary {
        name: name.into(),
        expr,
    })
}

pub fn ternary(name: impl Into<String>, first: NodeRef, second: NodeRef, third: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Ternary {
        name: name.into(),
        first,
        second,
        third,
    })
}

pub fn if_block(branches: impl IntoIterator<Item = (NodeRef, NodeRef)>, else_expr: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::IfBlock {
        branches: branches
            .into_iter()
            .map(|(cond, then)| IfPart { cond, then })
            .collect(),
        else_expr,
    })
}

pub fn case_block(
    case_expr: NodeRef,
    branches: impl IntoIterator<Item = (NodeRef, NodeRef)>,
    else_expr: NodeRef,
) -> NodeRef {
    FormulaItem::new(NodeKind::CaseBlock {
        case_expr,
        branches: branches
            .into_iter()
            .map(|(when, then)| WhenPart { when, then })
            .collect(),
        else_expr,
    })
}

pub fn p(expr: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Parenthesized(expr))
}

pub fn tagged(tag: LevelTag, expr: NodeRef) -> NodeRef {
    expr.with_tag(tag)
}

pub fn asc(expr: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Ordered {
        expr,
        direction: OrderDirection::Asc,
    })
}

pub fn desc(expr: NodeRef) -> NodeRef {
    FormulaItem::new(NodeKind::Ordered {
        expr,
        direction: OrderDirection::Desc,
    })
}

pub fn error(message: impl Into<String>, code: impl Into<String>) -> NodeRef {
    FormulaItem::new(NodeKind::Error {
        message: message.into(),
        code: code.into(),
    })
}

pub fn fork(
    join_type: JoinType,
    result_expr: NodeRef,
    joining: Vec<JoinCondition>,
    lod: LodSpecifier,
) -> NodeRef {
    FormulaItem::new(NodeKind::QueryFork(QueryFork {
        join_type,
        result_expr,
        joining,
        lod,
        before_filter_by: BeforeFilterBy::default(),
        bfb_filter_mutations: Vec::new(),
    }))
}

pub fn self_eq(expr: NodeRef) -> JoinCondition {
    JoinCondition::self_eq(expr)
}
