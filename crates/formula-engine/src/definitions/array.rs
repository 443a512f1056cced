//! Array functions. Several names (`CONTAINS`, `LEN`) are shared with string
//! functions and are told apart by argument types alone.

use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue};
use ordered_float::OrderedFloat;

use crate::definitions::{arg, call, exprs, ARRAYS, CONST_STRINGS, INTEGERS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

use DataType::{
    ArrayFloat, ArrayInt, ArrayStr, ConstArrayFloat, ConstArrayInt, ConstArrayStr, ConstFloat,
    ConstInteger, ConstString, Float, Integer, Null,
};

// `ARRAY(...)` built from constants is itself a constant. Constant overloads are
// tried first. Each needs at least one non-NULL item of its own type.
const CREATE_ARRAY: FunctionSpec = FunctionSpec {
    name: "array",
    arg_names: &["value_1", "value_2", "value_3"],
    arity: Arity::AtLeast(1),
    category: Category::Array,
    ..FunctionSpec::DEFAULT
};

fn literal_items<T>(
    args: &[TranslationCtx],
    convert: impl Fn(&LiteralValue) -> Option<T>,
) -> Option<Vec<T>> {
    args.iter()
        .map(|ctx| ctx.expression.literal().and_then(&convert))
        .collect()
}

/// A single array literal, or `ARRAY[...]` when some item is `NULL`.
fn const_array(args: &[TranslationCtx], literal: Option<LiteralValue>) -> SqlExpr {
    match literal {
        Some(value) => SqlExpr::Literal(value),
        None => SqlExpr::Array(exprs(args)),
    }
}

fn const_array_int(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let items = literal_items(args, |value| match value {
        LiteralValue::Integer(v) => Some(*v),
        _ => None,
    });
    Ok(const_array(args, items.map(LiteralValue::ArrayInt)))
}

fn const_array_float(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let items = literal_items(args, |value| match value {
        LiteralValue::Integer(v) => Some(OrderedFloat(*v as f64)),
        LiteralValue::Float(v) => Some(*v),
        _ => None,
    });
    Ok(const_array(args, items.map(LiteralValue::ArrayFloat)))
}

fn const_array_str(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let items = literal_items(args, |value| match value {
        LiteralValue::String(v) => Some(v.clone()),
        _ => None,
    });
    Ok(const_array(args, items.map(LiteralValue::ArrayStr)))
}

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[ConstInteger, Null],
            required: &[ConstInteger],
        }],
        return_type: ReturnType::Fixed(ConstArrayInt),
        variants: &[V::new(D::DUMMY, const_array_int)],
        ..CREATE_ARRAY
    }
}

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[ConstFloat, Null],
            required: &[ConstFloat],
        }],
        return_type: ReturnType::Fixed(ConstArrayFloat),
        variants: &[V::new(D::DUMMY, const_array_float)],
        ..CREATE_ARRAY
    }
}

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[ConstString, Null],
            required: &[ConstString],
        }],
        return_type: ReturnType::Fixed(ConstArrayStr),
        variants: &[V::new(D::DUMMY, const_array_str)],
        ..CREATE_ARRAY
    }
}

fn array_of(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::Array(exprs(args)))
}

const NON_CONST_ARRAY_VARIANTS: &[V] = &[
    V::new(D::DUMMY.union(D::POSTGRESQL), array_of),
    V::new(D::CLICKHOUSE, |args| call("array", args)),
];

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[Integer],
            required: &[Integer, ConstInteger],
        }],
        return_type: ReturnType::Fixed(ArrayInt),
        variants: NON_CONST_ARRAY_VARIANTS,
        priority: 1,
        ..CREATE_ARRAY
    }
}

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[Float],
            required: &[Float, ConstFloat],
        }],
        return_type: ReturnType::Fixed(ArrayFloat),
        variants: NON_CONST_ARRAY_VARIANTS,
        priority: 1,
        ..CREATE_ARRAY
    }
}

inventory::submit! {
    FunctionSpec {
        argument_types: &[M::ForAllRequiring {
            allowed: &[DataType::String],
            required: &[DataType::String, ConstString],
        }],
        return_type: ReturnType::Fixed(ArrayStr),
        variants: NON_CONST_ARRAY_VARIANTS,
        priority: 1,
        ..CREATE_ARRAY
    }
}

const ARRAY_FUNCTION: FunctionSpec = FunctionSpec {
    arg_names: &["array"],
    arity: Arity::Exact(1),
    category: Category::Array,
    argument_types: &[M::ForAll(ARRAYS)],
    priority: 1,
    ..FunctionSpec::DEFAULT
};

const ARRAY_AND_ITEM: &[M] = &[
    M::Sequence(&[&[ArrayInt], &[DataType::Integer]]),
    M::Sequence(&[&[ArrayFloat], &[DataType::Float]]),
    M::Sequence(&[&[ArrayStr], &[DataType::String]]),
];

const ARRAY_PAIRS: &[M] = &[
    M::Sequence(&[&[ArrayInt], &[ArrayInt]]),
    M::Sequence(&[&[ArrayFloat], &[ArrayFloat]]),
    M::Sequence(&[&[ArrayStr], &[ArrayStr]]),
];

fn array_contains(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::binary(
        "=",
        arg(args, 1)?,
        SqlExpr::func("ANY", [arg(args, 0)?]),
    ))
}

fn array_contains_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    call("has", args)
}

inventory::submit! {
    FunctionSpec {
        name: "contains",
        arg_names: &["array", "value"],
        arity: Arity::Exact(2),
        argument_types: ARRAY_AND_ITEM,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), array_contains),
            V::new(D::CLICKHOUSE, array_contains_clickhouse),
        ],
        ..ARRAY_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "notcontains",
        arg_names: &["array", "value"],
        arity: Arity::Exact(2),
        argument_types: ARRAY_AND_ITEM,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), |args| Ok(SqlExpr::prefix(
                "NOT",
                SqlExpr::grouped(array_contains(args)?),
            ))),
            V::new(D::CLICKHOUSE, |args| Ok(SqlExpr::prefix(
                "NOT",
                array_contains_clickhouse(args)?,
            ))),
        ],
        ..ARRAY_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "contains_all",
        arg_names: &["array_1", "array_2"],
        arity: Arity::Exact(2),
        argument_types: ARRAY_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), |args| Ok(SqlExpr::binary(
                "@>",
                arg(args, 0)?,
                arg(args, 1)?,
            ))),
            V::new(D::CLICKHOUSE, |args| call("hasAll", args)),
        ],
        ..ARRAY_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "contains_any",
        arg_names: &["array_1", "array_2"],
        arity: Arity::Exact(2),
        argument_types: ARRAY_PAIRS,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), |args| Ok(SqlExpr::binary(
                "&&",
                arg(args, 0)?,
                arg(args, 1)?,
            ))),
            V::new(D::CLICKHOUSE, |args| call("hasAny", args)),
        ],
        ..ARRAY_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "len",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), |args| call("CARDINALITY", args)),
            V::new(D::CLICKHOUSE, |args| call("length", args)),
        ],
        ..ARRAY_FUNCTION
    }
}

fn item_type(types: &[DataType]) -> DataType {
    match types.first().map(|t| t.non_const()) {
        Some(ArrayInt) => DataType::Integer,
        Some(ArrayFloat) => DataType::Float,
        Some(ArrayStr) => DataType::String,
        _ => DataType::Null,
    }
}

fn subscript(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::raw(format!(
        "({})[{}]",
        arg(args, 0)?,
        arg(args, 1)?
    )))
}

inventory::submit! {
    FunctionSpec {
        name: "get_item",
        arg_names: &["array", "index"],
        arity: Arity::Exact(2),
        argument_types: &[M::Sequence(&[ARRAYS, INTEGERS])],
        return_type: ReturnType::Derived(item_type),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), subscript),
            V::new(D::CLICKHOUSE, |args| call("arrayElement", args)),
        ],
        ..ARRAY_FUNCTION
    }
}

fn array_to_string(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let delimiter = match args.get(1) {
        Some(ctx) => ctx.expression.clone(),
        None => SqlExpr::Literal(LiteralValue::String(",".to_string())),
    };
    Ok(SqlExpr::func("ARRAY_TO_STRING", [arg(args, 0)?, delimiter]))
}

fn array_to_string_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    let delimiter = match args.get(1) {
        Some(ctx) => ctx.expression.clone(),
        None => SqlExpr::Literal(LiteralValue::String(",".to_string())),
    };
    Ok(SqlExpr::func(
        "arrayStringConcat",
        [
            SqlExpr::func("arrayMap", [SqlExpr::raw("x -> toString(x)"), arg(args, 0)?]),
            delimiter,
        ],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "arr_str",
        arg_names: &["array", "delimiter"],
        arity: Arity::Range(1, 2),
        argument_types: &[
            M::Sequence(&[ARRAYS]),
            M::Sequence(&[ARRAYS, CONST_STRINGS]),
        ],
        return_type: ReturnType::Fixed(DataType::String),
        variants: &[
            V::new(D::DUMMY.union(D::POSTGRESQL), array_to_string),
            V::new(D::CLICKHOUSE, array_to_string_clickhouse),
        ],
        ..ARRAY_FUNCTION
    }
}
