//! Date and time functions.

use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue, ValidationError};

use crate::definitions::{arg, call, CONST_STRINGS, DATELIKE, INTEGERS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

/// Time units accepted by `DATEADD`, `DATETRUNC` and the lookup functions.
pub const TIME_UNITS: &[&str] = &[
    "second", "minute", "hour", "day", "week", "month", "quarter", "year",
];

/// Canonical (lowercase, singular) name of a time unit.
pub fn normalize_time_unit(unit: &str) -> Result<&'static str, FormulaError> {
    let lowered = unit.trim().to_ascii_lowercase();
    let singular = lowered.strip_suffix('s').unwrap_or(&lowered);
    TIME_UNITS
        .iter()
        .copied()
        .find(|known| *known == singular)
        .ok_or_else(|| ValidationError::UnknownTimeUnit(unit.to_string()).into())
}

/// Unit argument at `idx`; `day` when absent.
fn unit_arg(args: &[TranslationCtx], idx: usize) -> Result<&'static str, FormulaError> {
    match args.get(idx) {
        None => Ok("day"),
        Some(ctx) => {
            let unit = ctx.expression.literal_str_lower().ok_or_else(|| {
                FormulaError::UnsupportedNode("time unit must be a string constant".to_string())
            })?;
            normalize_time_unit(&unit)
        }
    }
}

fn number_arg(args: &[TranslationCtx], idx: usize) -> SqlExpr {
    args.get(idx)
        .map(|ctx| ctx.expression.clone())
        .unwrap_or(SqlExpr::Literal(LiteralValue::Integer(1)))
}

fn capitalized(unit: &str) -> String {
    let mut chars = unit.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// `DATEADD(value, [unit, [number]])` or `DATEADD(value, number)` as
/// `(value, unit, number)`.
fn normalized_dateadd_args(
    args: &[TranslationCtx],
) -> Result<(SqlExpr, &'static str, SqlExpr), FormulaError> {
    let value = arg(args, 0)?;
    match args.get(1) {
        Some(ctx) if ctx.data_type.non_const() == DataType::Integer => {
            Ok((value, "day", ctx.expression.clone()))
        }
        _ => Ok((value, unit_arg(args, 1)?, number_arg(args, 2))),
    }
}

fn dateadd(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let (value, unit, number) = normalized_dateadd_args(args)?;
    let interval = match unit {
        "quarter" => "INTERVAL '3 month'".to_string(),
        other => format!("INTERVAL '1 {other}'"),
    };
    Ok(SqlExpr::grouped(SqlExpr::binary(
        "+",
        value,
        SqlExpr::binary("*", number, SqlExpr::raw(interval)),
    )))
}

fn dateadd_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let (value, unit, number) = normalized_dateadd_args(args)?;
    Ok(SqlExpr::func(
        format!("add{}s", capitalized(unit)),
        [value, number],
    ))
}

fn dateadd_mssql(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let (value, unit, number) = normalized_dateadd_args(args)?;
    Ok(SqlExpr::func(
        "DATEADD",
        [SqlExpr::raw(unit.to_ascii_uppercase()), number, value],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "dateadd",
        arg_names: &["datetime", "unit", "number"],
        arity: Arity::Range(1, 3),
        category: Category::Datetime,
        argument_types: &[
            M::Sequence(&[DATELIKE]),
            M::Sequence(&[DATELIKE, CONST_STRINGS]),
            M::Sequence(&[DATELIKE, INTEGERS]),
            M::Sequence(&[DATELIKE, CONST_STRINGS, INTEGERS]),
        ],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[
            V::new(D::DUMMY, dateadd),
            V::new(D::CLICKHOUSE, dateadd_clickhouse),
            V::new(D::MSSQL, dateadd_mssql),
        ],
        ..FunctionSpec::DEFAULT
    }
}

fn datetrunc(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let unit = unit_arg(args, 1)?;
    Ok(SqlExpr::func(
        "DATE_TRUNC",
        [SqlExpr::Literal(LiteralValue::String(unit.to_string())), arg(args, 0)?],
    ))
}

fn datetrunc_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let unit = unit_arg(args, 1)?;
    let name = match unit {
        "day" => "toStartOfDay".to_string(),
        "week" => "toMonday".to_string(),
        other => format!("toStartOf{}", capitalized(other)),
    };
    Ok(SqlExpr::func(name, [arg(args, 0)?]))
}

inventory::submit! {
    FunctionSpec {
        name: "datetrunc",
        arg_names: &["datetime", "unit"],
        arity: Arity::Exact(2),
        category: Category::Datetime,
        argument_types: &[M::Sequence(&[DATELIKE, CONST_STRINGS])],
        return_type: ReturnType::ParamsFromArgs(0),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), datetrunc),
            V::new(D::CLICKHOUSE, datetrunc_clickhouse),
        ],
        ..FunctionSpec::DEFAULT
    }
}

const DATE_PART: FunctionSpec = FunctionSpec {
    arg_names: &["datetime"],
    arity: Arity::Exact(1),
    category: Category::Datetime,
    argument_types: &[M::ForAll(DATELIKE)],
    return_type: ReturnType::Fixed(DataType::Integer),
    ..FunctionSpec::DEFAULT
};

fn extract(part: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::func(
        "EXTRACT",
        [SqlExpr::raw(format!("{part} FROM {}", arg(args, 0)?))],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "day",
        variants: &[
            V::new(D::DUMMY, |args| extract("DAY", args)),
            V::new(D::CLICKHOUSE, |args| call("toDayOfMonth", args)),
        ],
        ..DATE_PART
    }
}

inventory::submit! {
    FunctionSpec {
        name: "month",
        variants: &[
            V::new(D::DUMMY, |args| extract("MONTH", args)),
            V::new(D::CLICKHOUSE, |args| call("toMonth", args)),
        ],
        ..DATE_PART
    }
}

inventory::submit! {
    FunctionSpec {
        name: "quarter",
        variants: &[
            V::new(D::DUMMY, |args| extract("QUARTER", args)),
            V::new(D::CLICKHOUSE, |args| call("toQuarter", args)),
        ],
        ..DATE_PART
    }
}

inventory::submit! {
    FunctionSpec {
        name: "year",
        variants: &[
            V::new(D::DUMMY, |args| extract("YEAR", args)),
            V::new(D::CLICKHOUSE, |args| call("toYear", args)),
        ],
        ..DATE_PART
    }
}

inventory::submit! {
    FunctionSpec {
        name: "now",
        arity: Arity::Exact(0),
        category: Category::Datetime,
        return_type: ReturnType::Fixed(DataType::Datetime),
        variants: &[
            V::new(D::DUMMY, |_| Ok(SqlExpr::raw("CURRENT_TIMESTAMP"))),
            V::new(D::CLICKHOUSE, |_| Ok(SqlExpr::Func {
                name: "now".to_string(),
                args: Vec::new(),
            })),
        ],
        ..FunctionSpec::DEFAULT
    }
}

inventory::submit! {
    FunctionSpec {
        name: "today",
        arity: Arity::Exact(0),
        category: Category::Datetime,
        return_type: ReturnType::Fixed(DataType::Date),
        variants: &[
            V::new(D::DUMMY, |_| Ok(SqlExpr::raw("CURRENT_DATE"))),
            V::new(D::CLICKHOUSE, |_| Ok(SqlExpr::Func {
                name: "today".to_string(),
                args: Vec::new(),
            })),
        ],
        ..FunctionSpec::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn time_units_normalize() {
        assert_eq!(normalize_time_unit("Month").ok(), Some("month"));
        assert_eq!(normalize_time_unit("days").ok(), Some("day"));
        assert_eq!(
            normalize_time_unit("fortnight").map_err(|err| err.code().to_string()),
            Err(formula_core::codes::UNKNOWN_TIME_UNIT.to_string())
        );
    }

    #[test]
    fn dateadd_defaults_to_one_day() {
        let args = [TranslationCtx::new(SqlExpr::column("d"), DataType::Date)];
        assert_eq!(
            dateadd(&args).map(|expr| expr.to_string()).ok(),
            Some("(\"d\" + 1 * INTERVAL '1 day')".to_string())
        );
    }
}
