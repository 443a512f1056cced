use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue};

use crate::definitions::{
    arg, binary_op, call, BOOLEANS, DATES, DATETIMES, FLOATS, INTEGERS, NUMBERS, ORDERED, STRINGS,
};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, Scope, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

const BINARY: FunctionSpec = FunctionSpec {
    arg_names: &["left", "right"],
    arity: Arity::Exact(2),
    category: Category::Operator,
    ..FunctionSpec::DEFAULT
};

const UNARY: FunctionSpec = FunctionSpec {
    arg_names: &["value"],
    arity: Arity::Exact(1),
    category: Category::Operator,
    ..FunctionSpec::DEFAULT
};

/// Pairs accepted by equality and ordering comparisons.
const COMPARABLE: &[M] = &[
    M::Sequence(&[BOOLEANS, BOOLEANS]),
    M::Sequence(&[NUMBERS, NUMBERS]),
    M::Sequence(&[STRINGS, STRINGS]),
    M::Sequence(&[DATES, DATES]),
    M::Sequence(&[DATETIMES, DATETIMES]),
    M::Sequence(&[DATES, DATETIMES]),
    M::Sequence(&[DATETIMES, DATES]),
    M::Sequence(&[&[DataType::Geopoint], &[DataType::Geopoint]]),
    M::Sequence(&[&[DataType::Geopolygon], &[DataType::Geopolygon]]),
    M::Sequence(&[&[DataType::Uuid], &[DataType::Uuid]]),
    M::Sequence(&[&[DataType::ArrayInt], &[DataType::ArrayInt]]),
    M::Sequence(&[&[DataType::ArrayFloat], &[DataType::ArrayFloat]]),
    M::Sequence(&[&[DataType::ArrayStr], &[DataType::ArrayStr]]),
];

const COMPARABLE_INTERNAL: &[M] = &[
    M::Sequence(&[BOOLEANS, BOOLEANS]),
    M::Sequence(&[NUMBERS, NUMBERS]),
    M::Sequence(&[STRINGS, STRINGS]),
    M::Sequence(&[DATES, DATES]),
    M::Sequence(&[DATETIMES, DATETIMES]),
    M::Sequence(&[DATES, DATETIMES]),
    M::Sequence(&[DATETIMES, DATES]),
    M::Sequence(&[&[DataType::Geopoint], &[DataType::Geopoint]]),
    M::Sequence(&[&[DataType::Geopolygon], &[DataType::Geopolygon]]),
    M::Sequence(&[&[DataType::Uuid], &[DataType::Uuid]]),
    M::Sequence(&[&[DataType::ArrayInt], &[DataType::ArrayInt]]),
    M::Sequence(&[&[DataType::ArrayFloat], &[DataType::ArrayFloat]]),
    M::Sequence(&[&[DataType::ArrayStr], &[DataType::ArrayStr]]),
    M::Sequence(&[&[DataType::Markup], &[DataType::Markup]]),
];

const ORDERED_PAIRS: &[M] = &[
    M::Sequence(&[NUMBERS, NUMBERS]),
    M::Sequence(&[STRINGS, STRINGS]),
    M::Sequence(&[BOOLEANS, BOOLEANS]),
    M::Sequence(&[DATES, DATES]),
    M::Sequence(&[DATETIMES, DATETIMES]),
    M::Sequence(&[DATES, DATETIMES]),
    M::Sequence(&[DATETIMES, DATES]),
    M::Sequence(&[&[DataType::Uuid], &[DataType::Uuid]]),
];

fn reject_null_comparison(args: &[TranslationCtx]) -> Result<(), FormulaError> {
    if args.iter().any(|ctx| ctx.data_type.is_null()) {
        return Err(FormulaError::UnsupportedNode(
            "invalid comparison with NULL (use `<expr> IS [NOT] NULL`)".to_string(),
        ));
    }
    Ok(())
}

fn eq(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op("=", args)
}

fn neq(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op("<>", args)
}

/// Equality that treats two NULLs as equal; used for joining forked sub-queries.
fn denullified_eq(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let left = arg(args, 0)?;
    let right = arg(args, 1)?;
    Ok(SqlExpr::grouped(SqlExpr::or(
        SqlExpr::binary("=", left.clone(), right.clone()),
        SqlExpr::and(SqlExpr::is_null(left), SqlExpr::is_null(right)),
    )))
}

fn denullified_eq_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    call("isNotDistinctFrom", args)
}

fn denullified_eq_postgres(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    binary_op("IS NOT DISTINCT FROM", args)
}

fn lt(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op("<", args)
}

fn lte(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op("<=", args)
}

fn gt(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op(">", args)
}

fn gte(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    reject_null_comparison(args)?;
    binary_op(">=", args)
}

inventory::submit! {
    FunctionSpec {
        name: "==",
        argument_types: COMPARABLE,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, eq)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "_==",
        scopes: Scope::INTERNAL,
        argument_types: COMPARABLE_INTERNAL,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, eq)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "!=",
        argument_types: COMPARABLE,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, neq)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "_!=",
        scopes: Scope::INTERNAL,
        argument_types: COMPARABLE_INTERNAL,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, neq)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "_dneq",
        scopes: Scope::INTERNAL,
        argument_types: COMPARABLE_INTERNAL,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[
            V::new(D::DUMMY.union(D::SQLITE), denullified_eq),
            V::new(D::CLICKHOUSE, denullified_eq_clickhouse),
            V::new(D::POSTGRESQL, denullified_eq_postgres),
        ],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "<",
        argument_types: ORDERED_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, lt)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "<=",
        argument_types: ORDERED_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, lte)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: ">",
        argument_types: ORDERED_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, gt)],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: ">=",
        argument_types: ORDERED_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, gte)],
        ..BINARY
    }
}

// Arithmetic

fn plus(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    binary_op("+", args)
}

fn minus(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    binary_op("-", args)
}

fn mult(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    binary_op("*", args)
}

fn concat_pipes(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    binary_op("||", args)
}

inventory::submit! {
    FunctionSpec {
        name: "+",
        argument_types: &[M::Sequence(&[INTEGERS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, plus)],
        priority: 0,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "+",
        argument_types: &[M::Sequence(&[NUMBERS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, plus)],
        priority: 1,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "+",
        argument_types: &[M::Sequence(&[STRINGS, STRINGS])],
        return_type: ReturnType::Fixed(DataType::String),
        variants: &[
            V::new(D::DUMMY.union(D::SQLITE).union(D::POSTGRESQL), concat_pipes),
            V::new(D::CLICKHOUSE.union(D::MYSQL).union(D::MSSQL), |args| call("CONCAT", args)),
        ],
        priority: 2,
        ..BINARY
    }
}

fn date_plus_days(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let days = arg(args, 1)?;
    Ok(SqlExpr::binary(
        "+",
        arg(args, 0)?,
        SqlExpr::binary("*", days, SqlExpr::raw("INTERVAL '1 day'")),
    ))
}

fn date_plus_days_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    call("addDays", args)
}

inventory::submit! {
    FunctionSpec {
        name: "+",
        argument_types: &[
            M::Sequence(&[DATES, NUMBERS]),
            M::Sequence(&[DATETIMES, NUMBERS]),
        ],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[
            V::new(D::DUMMY, date_plus_days),
            V::new(D::CLICKHOUSE, date_plus_days_clickhouse),
        ],
        priority: 3,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "+",
        argument_types: &[
            M::Sequence(&[&[DataType::ArrayInt], &[DataType::ArrayInt]]),
            M::Sequence(&[&[DataType::ArrayFloat], &[DataType::ArrayFloat]]),
            M::Sequence(&[&[DataType::ArrayStr], &[DataType::ArrayStr]]),
        ],
        return_type: ReturnType::FromArgs(0),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), concat_pipes),
            V::new(D::CLICKHOUSE, |args| call("arrayConcat", args)),
        ],
        priority: 4,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "-",
        argument_types: &[M::Sequence(&[INTEGERS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, minus)],
        priority: 0,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "-",
        argument_types: &[M::Sequence(&[NUMBERS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, minus)],
        priority: 1,
        ..BINARY
    }
}

fn date_diff_days_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::func(
        "dateDiff",
        [SqlExpr::Literal(LiteralValue::String("day".to_string())), arg(args, 1)?, arg(args, 0)?],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "-",
        argument_types: &[M::Sequence(&[DATES, DATES])],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), minus),
            V::new(D::CLICKHOUSE, date_diff_days_clickhouse),
        ],
        priority: 2,
        ..BINARY
    }
}

fn date_minus_days(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let days = arg(args, 1)?;
    Ok(SqlExpr::binary(
        "-",
        arg(args, 0)?,
        SqlExpr::binary("*", days, SqlExpr::raw("INTERVAL '1 day'")),
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "-",
        argument_types: &[
            M::Sequence(&[DATES, NUMBERS]),
            M::Sequence(&[DATETIMES, NUMBERS]),
        ],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[
            V::new(D::DUMMY, date_minus_days),
            V::new(D::CLICKHOUSE, |args| call("subtractDays", args)),
        ],
        priority: 3,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "*",
        argument_types: &[M::Sequence(&[INTEGERS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, mult)],
        priority: 0,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "*",
        argument_types: &[M::Sequence(&[NUMBERS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, mult)],
        priority: 1,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "*",
        argument_types: &[M::Sequence(&[STRINGS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::String),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), |args| call("REPEAT", args)),
            V::new(D::CLICKHOUSE, |args| call("repeat", args)),
        ],
        priority: 2,
        ..BINARY
    }
}

/// `/` always yields a float.
fn div_float(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::binary(
        "/",
        SqlExpr::cast(arg(args, 0)?, "FLOAT"),
        arg(args, 1)?,
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "/",
        argument_types: &[M::Sequence(&[INTEGERS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[
            V::new(D::DUMMY, div_float),
            V::new(D::CLICKHOUSE, |args| binary_op("/", args)),
        ],
        priority: 0,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "/",
        argument_types: &[M::Sequence(&[NUMBERS, FLOATS]), M::Sequence(&[FLOATS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| binary_op("/", args))],
        priority: 1,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "%",
        argument_types: &[M::Sequence(&[INTEGERS, INTEGERS])],
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| binary_op("%", args))],
        priority: 0,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "%",
        argument_types: &[M::Sequence(&[NUMBERS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[
            V::new(D::DUMMY, |args| call("MOD", args)),
            V::new(D::CLICKHOUSE, |args| call("modulo", args)),
        ],
        priority: 1,
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "^",
        argument_types: &[M::Sequence(&[NUMBERS, NUMBERS])],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| call("POWER", args))],
        ..BINARY
    }
}

// Logical

inventory::submit! {
    FunctionSpec {
        name: "and",
        argument_types: &[M::Any],
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| binary_op("AND", args))],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "or",
        argument_types: &[M::Any],
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| binary_op("OR", args))],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "like",
        argument_types: &[M::Sequence(&[STRINGS, STRINGS])],
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| binary_op("LIKE", args))],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "notlike",
        argument_types: &[M::Sequence(&[STRINGS, STRINGS])],
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| binary_op("NOT LIKE", args))],
        ..BINARY
    }
}

/// Expands a constant array operand into an `IN` list, dropping NULL items.
fn in_list(args: &[TranslationCtx], negated: bool) -> Result<SqlExpr, FormulaError> {
    let item = arg(args, 0)?;
    let list = match arg(args, 1)? {
        SqlExpr::Literal(LiteralValue::ArrayInt(values)) => values
            .into_iter()
            .map(|v| SqlExpr::Literal(LiteralValue::Integer(v)))
            .collect(),
        SqlExpr::Literal(LiteralValue::ArrayFloat(values)) => values
            .into_iter()
            .map(|v| SqlExpr::Literal(LiteralValue::Float(v)))
            .collect(),
        SqlExpr::Literal(LiteralValue::ArrayStr(values)) => values
            .into_iter()
            .map(|v| SqlExpr::Literal(LiteralValue::String(v)))
            .collect(),
        SqlExpr::Array(items) => items,
        other => vec![other],
    };
    if list.is_empty() {
        return Ok(SqlExpr::Literal(LiteralValue::Boolean(negated)));
    }
    Ok(SqlExpr::InList {
        expr: Box::new(item),
        list,
        negated,
    })
}

const IN_TYPES: &[M] = &[
    M::Sequence(&[INTEGERS, &[DataType::ConstArrayInt]]),
    M::Sequence(&[NUMBERS, &[DataType::ConstArrayFloat]]),
    M::Sequence(&[STRINGS, &[DataType::ConstArrayStr]]),
];

inventory::submit! {
    FunctionSpec {
        name: "in",
        arg_names: &["item", "list"],
        argument_types: IN_TYPES,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| in_list(args, false))],
        ..BINARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "notin",
        arg_names: &["item", "list"],
        scopes: Scope::INTERNAL,
        argument_types: IN_TYPES,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| in_list(args, true))],
        ..BINARY
    }
}

// Unary

inventory::submit! {
    FunctionSpec {
        name: "not",
        argument_types: &[M::Any],
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| Ok(SqlExpr::prefix("NOT", arg(args, 0)?)))],
        ..UNARY
    }
}

inventory::submit! {
    FunctionSpec {
        name: "neg",
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, |args| Ok(SqlExpr::prefix("-", arg(args, 0)?)))],
        ..UNARY
    }
}

// Ternary

fn between(args: &[TranslationCtx], negated: bool) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::Between {
        expr: Box::new(arg(args, 0)?),
        low: Box::new(arg(args, 1)?),
        high: Box::new(arg(args, 2)?),
        negated,
    })
}

const BETWEEN_TYPES: &[M] = &[
    M::Sequence(&[NUMBERS, NUMBERS, NUMBERS]),
    M::Sequence(&[STRINGS, STRINGS, STRINGS]),
    M::Sequence(&[DATES, DATES, DATES]),
    M::Sequence(&[DATETIMES, DATETIMES, DATETIMES]),
    M::ForAll(ORDERED),
];

inventory::submit! {
    FunctionSpec {
        name: "between",
        arg_names: &["value", "low", "high"],
        arity: Arity::Exact(3),
        category: Category::Operator,
        argument_types: BETWEEN_TYPES,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| between(args, false))],
        ..FunctionSpec::DEFAULT
    }
}

inventory::submit! {
    FunctionSpec {
        name: "notbetween",
        arg_names: &["value", "low", "high"],
        arity: Arity::Exact(3),
        category: Category::Operator,
        argument_types: BETWEEN_TYPES,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| between(args, true))],
        ..FunctionSpec::DEFAULT
    }
}
