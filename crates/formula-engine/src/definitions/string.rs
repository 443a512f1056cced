use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue};

use crate::definitions::{arg, call, ANY_TYPE, INTEGERS, STRINGS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

const STRING_FUNCTION: FunctionSpec = FunctionSpec {
    arg_names: &["string"],
    arity: Arity::Exact(1),
    category: Category::String,
    argument_types: &[M::ForAll(STRINGS)],
    return_type: ReturnType::Fixed(DataType::String),
    ..FunctionSpec::DEFAULT
};

fn to_text(args: &[TranslationCtx]) -> Vec<SqlExpr> {
    args.iter()
        .map(|ctx| {
            if ctx.data_type.non_const() == DataType::String {
                ctx.expression.clone()
            } else {
                SqlExpr::cast(ctx.expression.clone(), "TEXT")
            }
        })
        .collect()
}

inventory::submit! {
    FunctionSpec {
        name: "concat",
        arg_names: &["string_1", "string_2"],
        arity: Arity::AtLeast(1),
        argument_types: &[M::ForAll(ANY_TYPE)],
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::func("CONCAT", to_text(args)))),
            V::new(D::CLICKHOUSE, |args| Ok(SqlExpr::func(
                "concat",
                args.iter().map(|ctx| SqlExpr::func("toString", [ctx.expression.clone()])),
            ))),
        ],
        ..STRING_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "upper",
        variants: &[V::new(D::ANY, |args| call("UPPER", args))],
        ..STRING_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "lower",
        variants: &[V::new(D::ANY, |args| call("LOWER", args))],
        ..STRING_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "trim",
        variants: &[V::new(D::ANY, |args| call("TRIM", args))],
        ..STRING_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "len",
        return_type: ReturnType::Fixed(DataType::Integer),
        variants: &[
            V::new(D::DUMMY, |args| call("CHAR_LENGTH", args)),
            V::new(D::CLICKHOUSE, |args| call("lengthUTF8", args)),
            V::new(D::MSSQL, |args| call("LEN", args)),
        ],
        ..STRING_FUNCTION
    }
}

/// `'%' || pattern || '%'` style wrapping used by LIKE-based matching.
fn like_pattern(prefix: bool, pattern: SqlExpr, suffix: bool) -> SqlExpr {
    if let Some(LiteralValue::String(text)) = pattern.literal() {
        let escaped = text
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let wrapped = format!(
            "{}{escaped}{}",
            if prefix { "%" } else { "" },
            if suffix { "%" } else { "" }
        );
        return SqlExpr::Literal(LiteralValue::String(wrapped));
    }
    let mut result = pattern;
    if prefix {
        result = SqlExpr::binary("||", SqlExpr::Literal(LiteralValue::String("%".into())), result);
    }
    if suffix {
        result = SqlExpr::binary("||", result, SqlExpr::Literal(LiteralValue::String("%".into())));
    }
    result
}

fn contains(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::binary(
        "LIKE",
        arg(args, 0)?,
        like_pattern(true, arg(args, 1)?, true),
    ))
}

fn contains_clickhouse(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::binary(
        ">",
        SqlExpr::func("positionUTF8", [arg(args, 0)?, arg(args, 1)?]),
        SqlExpr::Literal(LiteralValue::Integer(0)),
    ))
}

const STRING_PAIR: FunctionSpec = FunctionSpec {
    arg_names: &["string", "substring"],
    arity: Arity::Exact(2),
    argument_types: &[M::Sequence(&[STRINGS, STRINGS])],
    return_type: ReturnType::Fixed(DataType::Boolean),
    ..STRING_FUNCTION
};

inventory::submit! {
    FunctionSpec {
        name: "contains",
        variants: &[
            V::new(D::DUMMY, contains),
            V::new(D::CLICKHOUSE, contains_clickhouse),
        ],
        ..STRING_PAIR
    }
}

inventory::submit! {
    FunctionSpec {
        name: "notcontains",
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::prefix("NOT", SqlExpr::grouped(contains(args)?)))),
            V::new(D::CLICKHOUSE, |args| Ok(SqlExpr::prefix(
                "NOT",
                SqlExpr::grouped(contains_clickhouse(args)?),
            ))),
        ],
        ..STRING_PAIR
    }
}

inventory::submit! {
    FunctionSpec {
        name: "startswith",
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::binary(
                "LIKE",
                arg(args, 0)?,
                like_pattern(false, arg(args, 1)?, true),
            ))),
            V::new(D::CLICKHOUSE, |args| call("startsWith", args)),
        ],
        ..STRING_PAIR
    }
}

inventory::submit! {
    FunctionSpec {
        name: "endswith",
        variants: &[
            V::new(D::DUMMY, |args| Ok(SqlExpr::binary(
                "LIKE",
                arg(args, 0)?,
                like_pattern(true, arg(args, 1)?, false),
            ))),
            V::new(D::CLICKHOUSE, |args| call("endsWith", args)),
        ],
        ..STRING_PAIR
    }
}

inventory::submit! {
    FunctionSpec {
        name: "substr",
        arg_names: &["string", "from_index", "length"],
        arity: Arity::Range(2, 3),
        argument_types: &[
            M::Sequence(&[STRINGS, INTEGERS]),
            M::Sequence(&[STRINGS, INTEGERS, INTEGERS]),
        ],
        variants: &[
            V::new(D::DUMMY, |args| call("SUBSTRING", args)),
            V::new(D::CLICKHOUSE, |args| call("substringUTF8", args)),
        ],
        ..STRING_FUNCTION
    }
}

inventory::submit! {
    FunctionSpec {
        name: "replace",
        arg_names: &["string", "substring", "replace_with"],
        arity: Arity::Exact(3),
        argument_types: &[M::Sequence(&[STRINGS, STRINGS, STRINGS])],
        variants: &[
            V::new(D::DUMMY, |args| call("REPLACE", args)),
            V::new(D::CLICKHOUSE, |args| call("replaceAll", args)),
        ],
        ..STRING_FUNCTION
    }
}
