use formula_core::{DataType, DialectCombo as D, FormulaError, LiteralValue, ValidationError};

use crate::definitions::{arg, call, common_type, exprs, NUMBERS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, Scope, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::{TranslationCtx, CASE_BLOCK_FUNCTION, IF_BLOCK_FUNCTION};

/// `cond, then, [cond, then, ...] else`: the result type covers every branch value.
fn if_return_type(types: &[DataType]) -> DataType {
    let branches = types
        .iter()
        .enumerate()
        .filter(|(idx, _)| idx % 2 == 1 || *idx + 1 == types.len())
        .map(|(_, t)| *t);
    common_type(branches)
}

/// `case, when, then, [when, then, ...] else`.
fn case_return_type(types: &[DataType]) -> DataType {
    let branches = types
        .iter()
        .enumerate()
        .filter(|(idx, _)| (*idx >= 2 && idx % 2 == 0) || *idx + 1 == types.len())
        .map(|(_, t)| *t);
    common_type(branches)
}

fn translate_if(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    if args.len() < 3 || args.len() % 2 == 0 {
        return Err(ValidationError::ArgCount {
            name: "IF".to_string(),
            got: args.len(),
        }
        .into());
    }
    let values = exprs(args);
    let (else_expr, pairs) = values
        .split_last()
        .ok_or_else(|| FormulaError::UnsupportedNode("empty IF".to_string()))?;
    let whens = pairs
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok(SqlExpr::Case {
        operand: None,
        whens,
        else_expr: Some(Box::new(else_expr.clone())),
    })
}

fn translate_case(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    if args.len() < 4 || args.len() % 2 == 1 {
        return Err(ValidationError::ArgCount {
            name: "CASE".to_string(),
            got: args.len(),
        }
        .into());
    }
    let values = exprs(args);
    let operand = values[0].clone();
    let (else_expr, pairs) = values[1..]
        .split_last()
        .ok_or_else(|| FormulaError::UnsupportedNode("empty CASE".to_string()))?;
    let whens = pairs
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok(SqlExpr::Case {
        operand: Some(Box::new(operand)),
        whens,
        else_expr: Some(Box::new(else_expr.clone())),
    })
}

const IF: FunctionSpec = FunctionSpec {
    name: "if",
    arg_names: &["condition_1", "result_1", "default_result"],
    arity: Arity::AtLeast(3),
    category: Category::Logical,
    return_type: ReturnType::Derived(if_return_type),
    variants: &[V::new(D::ANY, translate_if)],
    ..FunctionSpec::DEFAULT
};

const CASE: FunctionSpec = FunctionSpec {
    name: "case",
    arg_names: &["expression", "pattern_1", "result_1", "default_result"],
    arity: Arity::AtLeast(4),
    category: Category::Logical,
    return_type: ReturnType::Derived(case_return_type),
    variants: &[V::new(D::ANY, translate_case)],
    ..FunctionSpec::DEFAULT
};

inventory::submit! { IF }

inventory::submit! {
    FunctionSpec {
        name: IF_BLOCK_FUNCTION,
        scopes: Scope::INTERNAL,
        ..IF
    }
}

inventory::submit! { CASE }

inventory::submit! {
    FunctionSpec {
        name: CASE_BLOCK_FUNCTION,
        scopes: Scope::INTERNAL,
        ..CASE
    }
}

inventory::submit! {
    FunctionSpec {
        name: "iif",
        arg_names: &["condition", "then_result", "else_result"],
        arity: Arity::Exact(3),
        category: Category::Logical,
        return_type: ReturnType::Derived(if_return_type),
        variants: &[V::new(D::ANY, translate_if)],
        ..FunctionSpec::DEFAULT
    }
}

inventory::submit! {
    FunctionSpec {
        name: "isnull",
        arg_names: &["expression"],
        arity: Arity::Exact(1),
        category: Category::Logical,
        return_type: ReturnType::Fixed(DataType::Boolean),
        variants: &[V::new(D::ANY, |args| Ok(SqlExpr::is_null(arg(args, 0)?)))],
        ..FunctionSpec::DEFAULT
    }
}

inventory::submit! {
    FunctionSpec {
        name: "ifnull",
        arg_names: &["check_value", "alt_value"],
        arity: Arity::Exact(2),
        category: Category::Logical,
        return_type: ReturnType::Derived(|types| common_type(types.iter().copied())),
        variants: &[V::new(D::ANY, |args| call("COALESCE", args))],
        ..FunctionSpec::DEFAULT
    }
}

fn zero_if_null(args: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Ok(SqlExpr::func(
        "COALESCE",
        [arg(args, 0)?, SqlExpr::Literal(LiteralValue::Integer(0))],
    ))
}

inventory::submit! {
    FunctionSpec {
        name: "zn",
        arg_names: &["expression"],
        arity: Arity::Exact(1),
        category: Category::Logical,
        argument_types: &[M::ForAll(NUMBERS)],
        return_type: ReturnType::FromArgs(0),
        variants: &[V::new(D::ANY, zero_if_null)],
        ..FunctionSpec::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn if_type_covers_branches() {
        use DataType::*;
        assert_eq!(if_return_type(&[Boolean, Integer, Float]), Float);
        assert_eq!(
            if_return_type(&[Boolean, Integer, Boolean, Null, Integer]),
            Integer
        );
        assert_eq!(case_return_type(&[String, String, Float, ConstInteger]), Float);
    }
}
