//! Core data model for BI formulas: the expression tree, the type system and the
//! dialect identifiers used to dispatch translations.

pub mod datatype;
pub mod dialect;
pub mod error;
pub mod fork;
pub mod nodes;
pub mod shortcuts;
pub mod tag;

pub use crate::datatype::{DataType, DataTypeParams};
pub use crate::dialect::DialectCombo;
pub use crate::error::{codes, FormulaError, ValidationError};
pub use crate::fork::{BfbFilterMutation, JoinCondition, JoinType, QueryFork};
pub use crate::nodes::{
    enumerate_autonomous_children, get_at, replace_at, replace_nodes, BeforeFilterBy,
    FormulaItem, FuncCall, IfPart, LiteralValue, LodSpecifier, NodeIndex, NodeKind, NodeMeta,
    NodeRef, OrderDirection, Position, WhenPart, WindowFuncCall, WindowGrouping,
};
pub use crate::tag::LevelTag;
