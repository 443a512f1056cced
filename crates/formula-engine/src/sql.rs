//! Dialect-neutral SQL expression tree produced by translation.
//!
//! Translation variants pick dialect-specific function names and shapes; rendering
//! through [`std::fmt::Display`] yields generic SQL text that is good enough for
//! inspection, logging and tests. Quoting rules of concrete engines live elsewhere.

use std::fmt;

use formula_core::LiteralValue;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(u64),
    CurrentRow,
    Following(u64),
    UnboundedFollowing,
}

impl fmt::Display for FrameBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameBound::UnboundedPreceding => f.write_str("UNBOUNDED PRECEDING"),
            FrameBound::Preceding(n) => write!(f, "{n} PRECEDING"),
            FrameBound::CurrentRow => f.write_str("CURRENT ROW"),
            FrameBound::Following(n) => write!(f, "{n} FOLLOWING"),
            FrameBound::UnboundedFollowing => f.write_str("UNBOUNDED FOLLOWING"),
        }
    }
}

/// `ROWS BETWEEN <start> AND <end>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WindowFrame {
    pub start: FrameBound,
    pub end: FrameBound,
}

impl WindowFrame {
    pub const FULL: WindowFrame = WindowFrame {
        start: FrameBound::UnboundedPreceding,
        end: FrameBound::UnboundedFollowing,
    };

    /// Frame spanning `before` rows back to `after` rows ahead. Negative `before` or
    /// positive `after` extend past the current row; `None` is unbounded.
    pub fn rows(before: Option<i64>, after: Option<i64>) -> WindowFrame {
        let start = match before {
            None => FrameBound::UnboundedPreceding,
            Some(0) => FrameBound::CurrentRow,
            Some(n) if n < 0 => FrameBound::Preceding(n.unsigned_abs()),
            Some(n) => FrameBound::Following(n.unsigned_abs()),
        };
        let end = match after {
            None => FrameBound::UnboundedFollowing,
            Some(0) => FrameBound::CurrentRow,
            Some(n) if n < 0 => FrameBound::Preceding(n.unsigned_abs()),
            Some(n) => FrameBound::Following(n.unsigned_abs()),
        };
        WindowFrame { start, end }
    }
}

impl fmt::Display for WindowFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ROWS BETWEEN {} AND {}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(LiteralValue),
    Func {
        name: String,
        args: Vec<SqlExpr>,
    },
    /// `name(DISTINCT args)`
    DistinctFunc {
        name: String,
        args: Vec<SqlExpr>,
    },
    Binary {
        op: String,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Prefix {
        op: String,
        expr: Box<SqlExpr>,
    },
    /// `expr IS NULL` and friends.
    Postfix {
        op: String,
        expr: Box<SqlExpr>,
    },
    Between {
        expr: Box<SqlExpr>,
        low: Box<SqlExpr>,
        high: Box<SqlExpr>,
        negated: bool,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<SqlExpr>>,
        whens: Vec<(SqlExpr, SqlExpr)>,
        else_expr: Option<Box<SqlExpr>>,
    },
    Cast {
        expr: Box<SqlExpr>,
        type_name: String,
    },
    Array(Vec<SqlExpr>),
    Ordered {
        expr: Box<SqlExpr>,
        desc: bool,
    },
    Over {
        func: Box<SqlExpr>,
        partition_by: Vec<SqlExpr>,
        order_by: Vec<SqlExpr>,
        frame: Option<WindowFrame>,
    },
    Grouped(Box<SqlExpr>),
    /// Verbatim SQL keyword or fragment (`CURRENT_DATE`, interval units).
    Raw(String),
}

impl SqlExpr {
    pub fn column(name: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> SqlExpr {
        SqlExpr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn func(name: impl Into<String>, args: impl IntoIterator<Item = SqlExpr>) -> SqlExpr {
        SqlExpr::Func {
            name: name.into(),
            args: args.into_iter().collect(),
        }
    }

    pub fn binary(op: impl Into<String>, left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Binary {
            op: op.into(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn prefix(op: impl Into<String>, expr: SqlExpr) -> SqlExpr {
        SqlExpr::Prefix {
            op: op.into(),
            expr: Box::new(expr),
        }
    }

    pub fn postfix(op: impl Into<String>, expr: SqlExpr) -> SqlExpr {
        SqlExpr::Postfix {
            op: op.into(),
            expr: Box::new(expr),
        }
    }

    pub fn grouped(expr: SqlExpr) -> SqlExpr {
        SqlExpr::Grouped(Box::new(expr))
    }

    pub fn cast(expr: SqlExpr, type_name: impl Into<String>) -> SqlExpr {
        SqlExpr::Cast {
            expr: Box::new(expr),
            type_name: type_name.into(),
        }
    }

    pub fn null() -> SqlExpr {
        SqlExpr::Literal(LiteralValue::Null)
    }

    pub fn raw(text: impl Into<String>) -> SqlExpr {
        SqlExpr::Raw(text.into())
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::binary("AND", left, right)
    }

    pub fn or(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::binary("OR", left, right)
    }

    pub fn is_null(expr: SqlExpr) -> SqlExpr {
        SqlExpr::postfix("IS NULL", expr)
    }

    pub fn literal(&self) -> Option<&LiteralValue> {
        match self {
            SqlExpr::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// String value of a string literal, lowercased.
    pub fn literal_str_lower(&self) -> Option<String> {
        match self.literal()? {
            LiteralValue::String(value) => Some(value.to_lowercase()),
            _ => None,
        }
    }

    pub fn literal_int(&self) -> Option<i64> {
        match self.literal()? {
            LiteralValue::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[SqlExpr], sep: &str) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &LiteralValue) -> fmt::Result {
    match value {
        LiteralValue::String(v) | LiteralValue::Uuid(v) => {
            write!(f, "'{}'", v.replace('\'', "''"))
        }
        LiteralValue::Date(v) => write!(f, "DATE '{v}'"),
        LiteralValue::Datetime(v) | LiteralValue::GenericDatetime(v) => {
            write!(f, "TIMESTAMP '{v}'")
        }
        LiteralValue::DatetimeTz { value, timezone } => {
            write!(f, "TIMESTAMP '{value}' AT TIME ZONE '{timezone}'")
        }
        LiteralValue::ArrayInt(values) => {
            let items: Vec<String> = values.iter().map(i64::to_string).collect();
            write!(f, "ARRAY[{}]", items.join(", "))
        }
        LiteralValue::ArrayFloat(values) => {
            let items: Vec<String> = values.iter().map(|v| format!("{:?}", v.0)).collect();
            write!(f, "ARRAY[{}]", items.join(", "))
        }
        LiteralValue::ArrayStr(values) | LiteralValue::TreeStr(values) => {
            let items: Vec<String> = values
                .iter()
                .map(|v| format!("'{}'", v.replace('\'', "''")))
                .collect();
            write!(f, "ARRAY[{}]", items.join(", "))
        }
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlExpr::Column { table: None, name } => write!(f, "\"{name}\""),
            SqlExpr::Column {
                table: Some(table),
                name,
            } => write!(f, "{table}.\"{name}\""),
            SqlExpr::Literal(value) => write_literal(f, value),
            SqlExpr::Func { name, args } => {
                write!(f, "{name}(")?;
                write_joined(f, args, ", ")?;
                f.write_str(")")
            }
            SqlExpr::DistinctFunc { name, args } => {
                write!(f, "{name}(DISTINCT ")?;
                write_joined(f, args, ", ")?;
                f.write_str(")")
            }
            SqlExpr::Binary { op, left, right } => write!(f, "{left} {op} {right}"),
            SqlExpr::Prefix { op, expr } => write!(f, "{op} {expr}"),
            SqlExpr::Postfix { op, expr } => write!(f, "{expr} {op}"),
            SqlExpr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}BETWEEN {low} AND {high}")
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}IN (")?;
                write_joined(f, list, ", ")?;
                f.write_str(")")
            }
            SqlExpr::Case {
                operand,
                whens,
                else_expr,
            } => {
                f.write_str("CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {operand}")?;
                }
                for (when, then) in whens {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(else_expr) = else_expr {
                    write!(f, " ELSE {else_expr}")?;
                }
                f.write_str(" END")
            }
            SqlExpr::Cast { expr, type_name } => write!(f, "CAST({expr} AS {type_name})"),
            SqlExpr::Array(items) => {
                f.write_str("ARRAY[")?;
                write_joined(f, items, ", ")?;
                f.write_str("]")
            }
            SqlExpr::Ordered { expr, desc } => {
                if *desc {
                    write!(f, "{expr} DESC")
                } else {
                    write!(f, "{expr} ASC")
                }
            }
            SqlExpr::Over {
                func,
                partition_by,
                order_by,
                frame,
            } => {
                write!(f, "{func} OVER (")?;
                let mut need_space = false;
                if !partition_by.is_empty() {
                    f.write_str("PARTITION BY ")?;
                    write_joined(f, partition_by, ", ")?;
                    need_space = true;
                }
                if !order_by.is_empty() {
                    if need_space {
                        f.write_str(" ")?;
                    }
                    f.write_str("ORDER BY ")?;
                    write_joined(f, order_by, ", ")?;
                    need_space = true;
                }
                if let Some(frame) = frame {
                    if need_space {
                        f.write_str(" ")?;
                    }
                    write!(f, "{frame}")?;
                }
                f.write_str(")")
            }
            SqlExpr::Grouped(expr) => write!(f, "({expr})"),
            SqlExpr::Raw(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_window_expression() {
        let expr = SqlExpr::Over {
            func: Box::new(SqlExpr::func("SUM", [SqlExpr::column("sales")])),
            partition_by: vec![SqlExpr::qualified("t1", "city")],
            order_by: vec![SqlExpr::Ordered {
                expr: Box::new(SqlExpr::column("date")),
                desc: false,
            }],
            frame: Some(WindowFrame::rows(None, Some(0))),
        };
        assert_eq!(
            expr.to_string(),
            "SUM(\"sales\") OVER (PARTITION BY t1.\"city\" ORDER BY \"date\" ASC \
             ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW)"
        );
    }

    #[test]
    fn escapes_string_literals() {
        let expr = SqlExpr::Literal(LiteralValue::String("it's".to_string()));
        assert_eq!(expr.to_string(), "'it''s'");
    }

    #[test]
    fn moving_frame_bounds() {
        assert_eq!(
            WindowFrame::rows(Some(-3), Some(5)).to_string(),
            "ROWS BETWEEN 3 PRECEDING AND 5 FOLLOWING"
        );
    }
}
