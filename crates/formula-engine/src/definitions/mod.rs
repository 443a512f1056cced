//! Built-in function and operator definitions registered with the inventory-backed
//! registry. Each module groups one family of functions.

use formula_core::{DataType, FormulaError};

use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

mod aggregation;
mod array;
mod datetime;
mod logical;
mod lookup;
mod math;
mod operators;
mod string;
mod window;

pub use datetime::{normalize_time_unit, TIME_UNITS};

use DataType::*;

pub(crate) const NUMBERS: &[DataType] = &[Integer, Float];
pub(crate) const INTEGERS: &[DataType] = &[Integer];
pub(crate) const FLOATS: &[DataType] = &[Float];
pub(crate) const BOOLEANS: &[DataType] = &[Boolean];
pub(crate) const STRINGS: &[DataType] = &[String];
pub(crate) const CONST_STRINGS: &[DataType] = &[ConstString];
pub(crate) const CONST_INTEGERS: &[DataType] = &[ConstInteger];
pub(crate) const DATES: &[DataType] = &[Date];
pub(crate) const DATETIMES: &[DataType] = &[Datetime, Datetimetz, Genericdatetime];
pub(crate) const DATELIKE: &[DataType] = &[Date, Datetime, Datetimetz, Genericdatetime];
pub(crate) const ARRAYS: &[DataType] = &[ArrayInt, ArrayFloat, ArrayStr];
pub(crate) const ANY_TYPE: &[DataType] = &DataType::ALL_NON_CONST;

/// Types usable with ordering comparisons and `MIN`/`MAX`.
pub(crate) const ORDERED: &[DataType] = &[
    Boolean,
    Integer,
    Float,
    String,
    Date,
    Datetime,
    Datetimetz,
    Genericdatetime,
    Uuid,
];

/// Translated argument at `idx`.
pub(crate) fn arg(args: &[TranslationCtx], idx: usize) -> Result<SqlExpr, FormulaError> {
    args.get(idx)
        .map(|ctx| ctx.expression.clone())
        .ok_or_else(|| FormulaError::UnsupportedNode(format!("missing argument #{}", idx + 1)))
}

pub(crate) fn exprs(args: &[TranslationCtx]) -> Vec<SqlExpr> {
    args.iter().map(|ctx| ctx.expression.clone()).collect()
}

pub(crate) fn call(name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::func(name, exprs(args)))
}

pub(crate) fn binary_op(op: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::binary(op, arg(args, 0)?, arg(args, 1)?))
}

/// Widest of `types` under the implicit casts; `NULL` when all are null.
pub(crate) fn common_type(types: impl IntoIterator<Item = DataType>) -> DataType {
    let mut result: Option<DataType> = None;
    for t in types.into_iter().map(DataType::non_const) {
        if t == Null {
            continue;
        }
        result = match result {
            None => Some(t),
            Some(current) if t.casts_to(current) => Some(current),
            Some(current) if current.casts_to(t) => Some(t),
            Some(current) => Some(current),
        };
    }
    result.unwrap_or(Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn common_type_widens() {
        assert_eq!(common_type([Integer, ConstFloat]), Float);
        assert_eq!(common_type([Null, String]), String);
        assert_eq!(common_type([ConstNull]), Null);
    }
}
