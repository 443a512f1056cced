//! Window functions. Translations produce the `OVER (...)` shell with the frame and
//! any argument-derived ordering; partitioning and query ordering are filled in by
//! the translator from the call's grouping and `ORDER BY` clause.

use formula_core::{DataType, DialectCombo as D, FormulaError};

use crate::definitions::{arg, exprs, ANY_TYPE, CONST_INTEGERS, CONST_STRINGS, NUMBERS, ORDERED};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::{SqlExpr, WindowFrame};
use crate::translation::TranslationCtx;

const WINDOW: FunctionSpec = FunctionSpec {
    arg_names: &["value"],
    arity: Arity::Exact(1),
    category: Category::Window,
    is_window: true,
    ..FunctionSpec::DEFAULT
};

const ORDERED_WINDOW: FunctionSpec = FunctionSpec {
    uses_default_ordering: true,
    ..WINDOW
};

fn over(func: SqlExpr, order_by: Vec<SqlExpr>, frame: Option<WindowFrame>) -> SqlExpr {
    SqlExpr::Over {
        func: Box::new(func),
        partition_by: Vec::new(),
        order_by,
        frame,
    }
}

fn invalid_param(message: impl Into<String>) -> FormulaError {
    FormulaError::UnsupportedNode(message.into())
}

/// Whole-window aggregate over the value argument.
fn full_window(name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(over(
        SqlExpr::func(name, exprs(args)),
        Vec::new(),
        Some(WindowFrame::FULL),
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "sum",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| full_window("SUM", args))],
        ..WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "avg",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| full_window("AVG", args))],
        ..WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "min",
        argument_types: &[M::ForAll(ORDERED)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| full_window("MIN", args))],
        ..WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "max",
        argument_types: &[M::ForAll(ORDERED)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| full_window("MAX", args))],
        ..WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "count",
        arity: Arity::Range(0, 1),
        argument_types: &[M::ForAll(ANY_TYPE)],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| {
            if args.is_empty() {
                return Ok(over(
                    SqlExpr::func("COUNT", [SqlExpr::raw("*")]),
                    Vec::new(),
                    Some(WindowFrame::FULL),
                ));
            }
            full_window("COUNT", args)
        })],
        ..WINDOW
    }
}

// Running functions: the optional direction flips the stretching frame.

fn stretching_frame(args: &[TranslationCtx]) -> Result<WindowFrame, FormulaError> {
    let direction = match args.get(1) {
        Some(ctx) => ctx
            .expression
            .literal_str_lower()
            .ok_or_else(|| invalid_param("direction must be a constant string"))?,
        None => "asc".to_string(),
    };
    match direction.as_str() {
        "asc" => Ok(WindowFrame::rows(None, Some(0))),
        "desc" => Ok(WindowFrame::rows(Some(0), None)),
        other => Err(invalid_param(format!("invalid value for direction parameter: {other}"))),
    }
}

fn running(name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let frame = stretching_frame(args)?;
    Ok(over(SqlExpr::func(name, [arg(args, 0)?]), Vec::new(), Some(frame)))
}

const RUNNING: FunctionSpec = FunctionSpec {
    arg_names: &["value", "direction"],
    arity: Arity::Range(1, 2),
    ..ORDERED_WINDOW
};

const RUNNING_NUMERIC: &[M] = &[
    M::Sequence(&[NUMBERS]),
    M::Sequence(&[NUMBERS, CONST_STRINGS]),
];

const RUNNING_ORDERED: &[M] = &[
    M::Sequence(&[ORDERED]),
    M::Sequence(&[ORDERED, CONST_STRINGS]),
];

inventory::submit! {
    FunctionSpec {
        name: "rsum",
        argument_types: RUNNING_NUMERIC,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| running("SUM", args))],
        ..RUNNING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "ravg",
        argument_types: RUNNING_NUMERIC,
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| running("AVG", args))],
        ..RUNNING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rcount",
        argument_types: &[
            M::Sequence(&[ANY_TYPE]),
            M::Sequence(&[ANY_TYPE, CONST_STRINGS]),
        ],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| running("COUNT", args))],
        ..RUNNING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rmin",
        argument_types: RUNNING_ORDERED,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| running("MIN", args))],
        ..RUNNING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rmax",
        argument_types: RUNNING_ORDERED,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| running("MAX", args))],
        ..RUNNING
    }
}

// Moving functions: `MSUM(x, 5)` covers the current row and the 5 before it,
// `MSUM(x, -5)` the 5 after it, `MSUM(x, 3, 8)` 3 before and 8 after.

fn moving_frame(args: &[TranslationCtx]) -> Result<WindowFrame, FormulaError> {
    let rows = |idx: usize| -> Result<Option<i64>, FormulaError> {
        match args.get(idx) {
            Some(ctx) => ctx
                .expression
                .literal_int()
                .map(Some)
                .ok_or_else(|| invalid_param("row counts must be constant integers")),
            None => Ok(None),
        }
    };
    let first = rows(1)?.ok_or_else(|| invalid_param("missing row count"))?;
    Ok(match rows(2)? {
        Some(second) => WindowFrame::rows(Some(-first.abs()), Some(second.abs())),
        None if first >= 0 => WindowFrame::rows(Some(-first), Some(0)),
        None => WindowFrame::rows(Some(0), Some(first.abs())),
    })
}

fn moving(name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let frame = moving_frame(args)?;
    Ok(over(SqlExpr::func(name, [arg(args, 0)?]), Vec::new(), Some(frame)))
}

const MOVING: FunctionSpec = FunctionSpec {
    arg_names: &["value", "rows_1", "rows_2"],
    arity: Arity::Range(2, 3),
    ..ORDERED_WINDOW
};

const MOVING_NUMERIC: &[M] = &[
    M::Sequence(&[NUMBERS, CONST_INTEGERS]),
    M::Sequence(&[NUMBERS, CONST_INTEGERS, CONST_INTEGERS]),
];

const MOVING_ORDERED: &[M] = &[
    M::Sequence(&[ORDERED, CONST_INTEGERS]),
    M::Sequence(&[ORDERED, CONST_INTEGERS, CONST_INTEGERS]),
];

inventory::submit! {
    FunctionSpec {
        name: "msum",
        argument_types: MOVING_NUMERIC,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| moving("SUM", args))],
        ..MOVING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "mavg",
        argument_types: MOVING_NUMERIC,
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| moving("AVG", args))],
        ..MOVING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "mcount",
        argument_types: &[
            M::Sequence(&[ANY_TYPE, CONST_INTEGERS]),
            M::Sequence(&[ANY_TYPE, CONST_INTEGERS, CONST_INTEGERS]),
        ],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| moving("COUNT", args))],
        ..MOVING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "mmin",
        argument_types: MOVING_ORDERED,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| moving("MIN", args))],
        ..MOVING
    }
}

inventory::submit! {
    FunctionSpec {
        name: "mmax",
        argument_types: MOVING_ORDERED,
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| moving("MAX", args))],
        ..MOVING
    }
}

// Ranking: ordered by the value itself, greatest first unless told otherwise.

fn rank_order(args: &[TranslationCtx]) -> Result<Vec<SqlExpr>, FormulaError> {
    let direction = match args.get(1) {
        Some(ctx) => ctx
            .expression
            .literal_str_lower()
            .ok_or_else(|| invalid_param("direction must be a constant string"))?,
        None => "desc".to_string(),
    };
    let desc = match direction.as_str() {
        "asc" | "ascending" => false,
        "desc" | "descending" => true,
        other => return Err(invalid_param(format!("invalid ranking direction: {other}"))),
    };
    Ok(vec![SqlExpr::Ordered {
        expr: Box::new(arg(args, 0)?),
        desc,
    }])
}

fn ranking(name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let func = SqlExpr::Func {
        name: name.to_string(),
        args: Vec::new(),
    };
    Ok(over(func, rank_order(args)?, None))
}

const RANK: FunctionSpec = FunctionSpec {
    arg_names: &["value", "direction"],
    arity: Arity::Range(1, 2),
    argument_types: &[
        M::Sequence(&[ORDERED]),
        M::Sequence(&[ORDERED, CONST_STRINGS]),
    ],
    ..WINDOW
};

inventory::submit! {
    FunctionSpec {
        name: "rank",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| ranking("RANK", args))],
        ..RANK
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rank_dense",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| ranking("DENSE_RANK", args))],
        ..RANK
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rank_unique",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| ranking("ROW_NUMBER", args))],
        ..RANK
    }
}

inventory::submit! {
    FunctionSpec {
        name: "rank_percentile",
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| ranking("PERCENT_RANK", args))],
        ..RANK
    }
}

/// `LAG(x, n)` looks back, a negative offset looks ahead.
fn lag(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let offset = match args.get(1) {
        Some(ctx) => ctx
            .expression
            .literal_int()
            .ok_or_else(|| invalid_param("offset must be a constant integer"))?,
        None => 1,
    };
    let name = if offset < 0 { "LEAD" } else { "LAG" };
    let mut call_args = vec![
        arg(args, 0)?,
        SqlExpr::Literal(formula_core::LiteralValue::Integer(offset.abs())),
    ];
    if let Some(default) = args.get(2) {
        call_args.push(default.expression.clone());
    }
    Ok(over(SqlExpr::func(name, call_args), Vec::new(), None))
}

inventory::submit! {
    FunctionSpec {
        name: "lag",
        arg_names: &["value", "offset", "default"],
        arity: Arity::Range(1, 3),
        argument_types: &[
            M::Sequence(&[ANY_TYPE]),
            M::Sequence(&[ANY_TYPE, CONST_INTEGERS]),
            M::Sequence(&[ANY_TYPE, CONST_INTEGERS, ANY_TYPE]),
        ],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, lag)],
        ..ORDERED_WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "first",
        argument_types: &[M::ForAll(ANY_TYPE)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| Ok(over(
            SqlExpr::func("FIRST_VALUE", [arg(args, 0)?]),
            Vec::new(),
            Some(WindowFrame::FULL),
        )))],
        ..ORDERED_WINDOW
    }
}

inventory::submit! {
    FunctionSpec {
        name: "last",
        argument_types: &[M::ForAll(ANY_TYPE)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| Ok(over(
            SqlExpr::func("LAST_VALUE", [arg(args, 0)?]),
            Vec::new(),
            Some(WindowFrame::FULL),
        )))],
        ..ORDERED_WINDOW
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::FrameBound;
    use formula_core::LiteralValue;
    use pretty_assertions::assert_eq;

    fn ctx(value: LiteralValue) -> TranslationCtx {
        let data_type = value.data_type().const_version();
        TranslationCtx::new(SqlExpr::Literal(value), data_type)
    }

    #[test]
    fn moving_frames_follow_sign_of_row_count() {
        let value = TranslationCtx::new(SqlExpr::column("x"), DataType::Integer);
        let frame = moving_frame(&[value.clone(), ctx(LiteralValue::Integer(-5))]).expect("frame");
        assert_eq!(frame.start, FrameBound::CurrentRow);
        assert_eq!(frame.end, FrameBound::Following(5));

        let frame = moving_frame(&[
            value,
            ctx(LiteralValue::Integer(3)),
            ctx(LiteralValue::Integer(8)),
        ])
        .expect("frame");
        assert_eq!(frame, WindowFrame::rows(Some(-3), Some(8)));
    }

    #[test]
    fn descending_running_frame() {
        let value = TranslationCtx::new(SqlExpr::column("x"), DataType::Integer);
        let frame =
            stretching_frame(&[value, ctx(LiteralValue::String("DESC".into()))]).expect("frame");
        assert_eq!(frame.start, FrameBound::CurrentRow);
        assert_eq!(frame.end, FrameBound::UnboundedFollowing);
    }
}
