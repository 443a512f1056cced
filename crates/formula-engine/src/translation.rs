//! Translation of formula trees into SQL expressions.
//!
//! Every call-like node is dispatched through the function registry: the argument
//! types select a definition, the environment's dialect selects its variant.

use std::collections::HashMap;

use formula_core::{
    DataType, DataTypeParams, DialectCombo, FormulaError, LiteralValue, NodeKind, NodeRef,
    OrderDirection, WindowGrouping,
};
use smallvec::SmallVec;

use crate::registry::{self, Scope};
use crate::sql::SqlExpr;

/// Name of the internal function IF blocks are translated through.
pub const IF_BLOCK_FUNCTION: &str = "_if_block_";
/// Name of the internal function CASE blocks are translated through.
pub const CASE_BLOCK_FUNCTION: &str = "_case_block_";

/// A translated expression with its resolved type.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationCtx {
    pub expression: SqlExpr,
    pub data_type: DataType,
    pub params: DataTypeParams,
}

impl TranslationCtx {
    pub fn new(expression: SqlExpr, data_type: DataType) -> Self {
        TranslationCtx {
            expression,
            data_type,
            params: DataTypeParams::default(),
        }
    }
}

/// Source column and type of one field reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub column: SqlExpr,
    pub data_type: DataType,
    pub params: DataTypeParams,
}

#[derive(Debug, Clone)]
pub struct TranslationEnv {
    pub dialect: DialectCombo,
    pub required_scopes: Scope,
    pub fields: HashMap<String, FieldInfo>,
}

impl TranslationEnv {
    pub fn new(dialect: DialectCombo) -> Self {
        TranslationEnv {
            dialect,
            required_scopes: Scope::EXPLICIT_USAGE,
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, name: impl Into<String>, column: SqlExpr, data_type: DataType) {
        self.fields.insert(
            name.into(),
            FieldInfo {
                column,
                data_type,
                params: DataTypeParams::default(),
            },
        );
    }

    /// Like [`TranslationEnv::with_field`], for types carrying params (timezone).
    pub fn with_field_params(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        params: DataTypeParams,
    ) -> Self {
        let name = name.into();
        let column = SqlExpr::column(name.clone());
        self.fields.insert(
            name,
            FieldInfo {
                column,
                data_type,
                params,
            },
        );
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let name = name.into();
        let column = SqlExpr::column(name.clone());
        self.add_field(name, column, data_type);
        self
    }
}

/// Translate `node` for `env.dialect`.
pub fn translate(node: &NodeRef, env: &TranslationEnv) -> Result<TranslationCtx, FormulaError> {
    match &node.kind {
        NodeKind::Field { name } => {
            let info = env
                .fields
                .get(name)
                .ok_or_else(|| FormulaError::UnknownField(name.clone()))?;
            Ok(TranslationCtx {
                expression: info.column.clone(),
                data_type: info.data_type,
                params: info.params.clone(),
            })
        }
        NodeKind::Literal(value) => Ok(translate_literal(value)),
        NodeKind::Parenthesized(expr) => {
            let inner = translate(expr, env)?;
            Ok(TranslationCtx {
                expression: SqlExpr::grouped(inner.expression),
                ..inner
            })
        }
        NodeKind::Ordered { expr, direction } => {
            let inner = translate(expr, env)?;
            Ok(TranslationCtx {
                expression: SqlExpr::Ordered {
                    expr: Box::new(inner.expression),
                    desc: *direction == OrderDirection::Desc,
                },
                ..inner
            })
        }
        NodeKind::Binary { name, left, right } => {
            translate_call(name, &[left.clone(), right.clone()], env)
        }
        NodeKind::Unary { name, expr } => translate_call(name, &[expr.clone()], env),
        NodeKind::Ternary {
            name,
            first,
            second,
            third,
        } => translate_call(name, &[first.clone(), second.clone(), third.clone()], env),
        NodeKind::FuncCall(call) => translate_call(&call.name, &call.args, env),
        NodeKind::WindowFuncCall(_) => translate_window(node, env),
        NodeKind::IfBlock {
            branches,
            else_expr,
        } => {
            let mut args = Vec::with_capacity(branches.len() * 2 + 1);
            for branch in branches {
                args.push(branch.cond.clone());
                args.push(branch.then.clone());
            }
            args.push(else_expr.clone());
            translate_call(IF_BLOCK_FUNCTION, &args, env)
        }
        NodeKind::CaseBlock {
            case_expr,
            branches,
            else_expr,
        } => {
            let mut args = Vec::with_capacity(branches.len() * 2 + 2);
            args.push(case_expr.clone());
            for branch in branches {
                args.push(branch.when.clone());
                args.push(branch.then.clone());
            }
            args.push(else_expr.clone());
            translate_call(CASE_BLOCK_FUNCTION, &args, env)
        }
        NodeKind::QueryFork(_) => Err(FormulaError::UnsupportedNode(format!(
            "query fork must be split into a sub-query before translation: {node}"
        ))),
        NodeKind::Error { message, code } => Err(FormulaError::from_error_node(code, message)),
    }
}

fn translate_literal(value: &LiteralValue) -> TranslationCtx {
    let params = match value {
        LiteralValue::DatetimeTz { timezone, .. } => DataTypeParams::with_timezone(timezone.clone()),
        _ => DataTypeParams::default(),
    };
    TranslationCtx {
        expression: SqlExpr::Literal(value.clone()),
        data_type: value.data_type().const_version(),
        params,
    }
}

fn translate_args(args: &[NodeRef], env: &TranslationEnv) -> Result<Vec<TranslationCtx>, FormulaError> {
    args.iter().map(|arg| translate(arg, env)).collect()
}

fn dispatch(
    name: &str,
    args: Vec<TranslationCtx>,
    is_window: bool,
    env: &TranslationEnv,
) -> Result<TranslationCtx, FormulaError> {
    let arg_types: SmallVec<[DataType; 4]> = args.iter().map(|arg| arg.data_type).collect();
    let resolution = registry::resolve(name, &arg_types, is_window, env.dialect, env.required_scopes)?;
    let expression = (resolution.variant.translate)(&args)?;
    let params = resolution
        .spec
        .return_type
        .params_source()
        .and_then(|idx| args.get(idx))
        .map(|arg| arg.params.clone())
        .unwrap_or_default();
    Ok(TranslationCtx {
        expression,
        data_type: resolution.return_type,
        params,
    })
}

fn translate_call(
    name: &str,
    args: &[NodeRef],
    env: &TranslationEnv,
) -> Result<TranslationCtx, FormulaError> {
    let args = translate_args(args, env)?;
    dispatch(name, args, false, env)
}

fn translate_window(node: &NodeRef, env: &TranslationEnv) -> Result<TranslationCtx, FormulaError> {
    let Some(call) = node.window_call() else {
        return Err(FormulaError::UnsupportedNode(node.to_string()));
    };
    let partition_by = match &call.grouping {
        WindowGrouping::Total => Vec::new(),
        WindowGrouping::Within(dims) => translate_args(dims, env)?
            .into_iter()
            .map(|ctx| ctx.expression)
            .collect(),
        WindowGrouping::Among(_) => {
            return Err(FormulaError::UnsupportedNode(format!(
                "AMONG must be converted to WITHIN before translation: {node}"
            )))
        }
    };
    let ordering: Vec<SqlExpr> = translate_args(&call.ordering, env)?
        .into_iter()
        .map(|ctx| ctx.expression)
        .collect();

    let args = translate_args(&call.args, env)?;
    let translated = dispatch(&call.name, args, true, env)?;
    let expression = match translated.expression {
        SqlExpr::Over {
            func,
            partition_by: _,
            order_by,
            frame,
        } => {
            // Ordering from arguments (RANK) goes first.
            let mut full_order = order_by;
            full_order.extend(ordering);
            SqlExpr::Over {
                func,
                partition_by,
                order_by: full_order,
                frame,
            }
        }
        other => SqlExpr::Over {
            func: Box::new(other),
            partition_by,
            order_by: ordering,
            frame: None,
        },
    };
    Ok(TranslationCtx {
        expression,
        ..translated
    })
}
