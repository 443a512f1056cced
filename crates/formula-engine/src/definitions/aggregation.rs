use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue};

use crate::definitions::{arg, call, exprs, ANY_TYPE, BOOLEANS, DATELIKE, NUMBERS, ORDERED};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

const AGGREGATION: FunctionSpec = FunctionSpec {
    arg_names: &["value"],
    arity: Arity::Exact(1),
    category: Category::Aggregation,
    ..FunctionSpec::DEFAULT
};

inventory::submit! {
    FunctionSpec {
        name: "sum",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| call("SUM", args))],
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "avg",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| call("AVG", args))],
        ..AGGREGATION
    }
}

fn avg_dates(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::func(
        "TO_TIMESTAMP",
        [SqlExpr::func(
            "AVG",
            [SqlExpr::func(
                "EXTRACT",
                [SqlExpr::raw(format!("EPOCH FROM {}", arg(args, 0)?))],
            )],
        )],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "avg",
        argument_types: &[M::ForAll(DATELIKE)],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), avg_dates),
            V::new(D::CLICKHOUSE, |args| Ok(SqlExpr::func(
                "toDateTime",
                [SqlExpr::func("avg", [SqlExpr::func("toUnixTimestamp", [arg(args, 0)?])])],
            ))),
        ],
        priority: 1,
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "min",
        argument_types: &[M::ForAll(ORDERED)],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[V::new(D::ANY, |args| call("MIN", args))],
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "max",
        argument_types: &[M::ForAll(ORDERED)],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[V::new(D::ANY, |args| call("MAX", args))],
        ..AGGREGATION
    }
}

fn count(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    if args.is_empty() {
        return Ok(SqlExpr::func("COUNT", [SqlExpr::raw("*")]));
    }
    call("COUNT", args)
}

inventory::submit! {
    FunctionSpec {
        name: "count",
        arity: Arity::Range(0, 1),
        argument_types: &[M::ForAll(ANY_TYPE)],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, count)],
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "countd",
        argument_types: &[M::ForAll(ANY_TYPE)],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::DistinctFunc {
                name: "COUNT".to_string(),
                args: exprs(args),
            })),
            V::new(D::CLICKHOUSE, |args| call("uniqExact", args)),
        ],
        ..AGGREGATION
    }
}

fn median(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::raw(format!(
        "PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {})",
        arg(args, 0)?
    )))
}

inventory::submit! {
    FunctionSpec {
        name: "median",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), median),
            V::new(D::CLICKHOUSE, |args| call("quantileExact(0.5)", args)),
        ],
        ..AGGREGATION
    }
}

/// `CASE WHEN <cond> THEN <value> END`, the value being NULL when absent.
fn when_then(
    args: &[TranslationCtx],
    value_idx: Option<usize>,
    cond_idx: usize,
) -> Result<SqlExpr, FormulaError> {
    let value = match value_idx {
        Some(idx) => arg(args, idx)?,
        None => SqlExpr::Literal(LiteralValue::Integer(1)),
    };
    Ok(SqlExpr::Case {
        operand: None,
        whens: vec![(arg(args, cond_idx)?, value)],
        else_expr: None,
    })
}

inventory::submit! {
    FunctionSpec {
        name: "sum_if",
        arg_names: &["expression", "condition"],
        arity: Arity::Exact(2),
        argument_types: &[M::Sequence(&[NUMBERS, BOOLEANS])],
        return_type: ReturnType::FromArgs(0),
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::func("SUM", [when_then(args, Some(0), 1)?]))),
            V::new(D::CLICKHOUSE, |args| call("sumIf", args)),
        ],
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "avg_if",
        arg_names: &["expression", "condition"],
        arity: Arity::Exact(2),
        argument_types: &[M::Sequence(&[NUMBERS, BOOLEANS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::func("AVG", [when_then(args, Some(0), 1)?]))),
            V::new(D::CLICKHOUSE, |args| call("avgIf", args)),
        ],
        ..AGGREGATION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "count_if",
        arg_names: &["condition"],
        arity: Arity::Exact(1),
        argument_types: &[M::ForAll(BOOLEANS)],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::func("COUNT", [when_then(args, None, 0)?]))),
            V::new(D::CLICKHOUSE, |args| call("countIf", args)),
        ],
        ..AGGREGATION
    }
}
