use formula_core::{DataType, DialectCombo as D, FormulaError};

use crate::definitions::{arg, call, ANY_TYPE, DATELIKE, FLOATS, INTEGERS, NUMBERS, STRINGS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

const MATH_FUNCTION: FunctionSpec = FunctionSpec {
    arg_names: &["number"],
    arity: Arity::Exact(1),
    category: Category::Mathematical,
    argument_types: &[M::ForAll(NUMBERS)],
    return_type: ReturnType::FromArgs(0),
    ..FunctionSpec::DEFAULT
};

inventory::submit! {
    FunctionSpec {
        name: "abs",
        variants: &[V::new(D::ANY, |args| call("ABS", args))],
        ..MATH_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "round",
        arg_names: &["number", "precision"],
        arity: Arity::Range(1, 2),
        argument_types: &[
            M::Sequence(&[NUMBERS]),
            M::Sequence(&[NUMBERS, INTEGERS]),
        ],
        variants: &[V::new(D::ANY, |args| call("ROUND", args))],
        ..MATH_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "floor",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[V::new(D::ANY, |args| call("FLOOR", args))],
        ..MATH_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "ceiling",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY, |args| call("CEILING", args)),
            V::new(D::CLICKHOUSE, |args| call("ceil", args)),
        ],
        ..MATH_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "sqrt",
        argument_types: &[M::ForAll(FLOATS)],
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[V::new(D::ANY, |args| call("SQRT", args))],
        ..MATH_FUNCTION
    }
}

// Type conversions.

const TYPE_FUNCTION: FunctionSpec = FunctionSpec {
    arg_names: &["expression"],
    arity: Arity::Exact(1),
    category: Category::Type,
    argument_types: &[M::ForAll(ANY_TYPE)],
    ..FunctionSpec::DEFAULT
};

fn cast_to(type_name: &str, args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::cast(arg(args, 0)?, type_name))
}

inventory::submit! {
    FunctionSpec {
        name: "int",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY, |args| cast_to("BIGINT", args)),
            V::new(D::CLICKHOUSE, |args| call("toInt64", args)),
        ],
        ..TYPE_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "float",
        return_type: ReturnType::Fixed(DataType::Float),
        variants: &[
            V::new(D::DUMMY, |args| cast_to("FLOAT", args)),
            V::new(D::CLICKHOUSE, |args| call("toFloat64", args)),
        ],
        ..TYPE_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "str",
        return_type: ReturnType::Fixed(DataType::String),
        variants: &[
            V::new(D::DUMMY, |args| cast_to("TEXT", args)),
            V::new(D::CLICKHOUSE, |args| call("toString", args)),
        ],
        ..TYPE_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "date",
        argument_types: &[M::ForAll(STRINGS), M::ForAll(DATELIKE)],
        return_type: ReturnType::Fixed(DataType::Date),
        variants: &[
            V::new(D::DUMMY, |args| cast_to("DATE", args)),
            V::new(D::CLICKHOUSE, |args| call("toDate", args)),
        ],
        ..TYPE_FUNCTION
    }
}
