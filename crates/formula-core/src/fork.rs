use serde::{Deserialize, Serialize};

use crate::nodes::{BeforeFilterBy, LodSpecifier, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Left,
    Inner,
}

/// One condition of a query fork's `joining` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinCondition {
    /// The same expression evaluated on both sides must be equal.
    SelfEquality { expr: NodeRef },
    /// `expr` on the main side equals `fork_expr` on the forked side.
    Binary { expr: NodeRef, fork_expr: NodeRef },
}

impl JoinCondition {
    pub fn self_eq(expr: NodeRef) -> Self {
        JoinCondition::SelfEquality { expr }
    }

    pub fn binary(expr: NodeRef, fork_expr: NodeRef) -> Self {
        JoinCondition::Binary { expr, fork_expr }
    }

    pub fn expressions(&self) -> Vec<&NodeRef> {
        match self {
            JoinCondition::SelfEquality { expr } => vec![expr],
            JoinCondition::Binary { expr, fork_expr } => vec![expr, fork_expr],
        }
    }
}

/// Rewrites a before-filter-by filter for the forked sub-query
/// (e.g. shifting a date filter by the lookup offset).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BfbFilterMutation {
    pub original: NodeRef,
    pub replacement: NodeRef,
}

/// A join against a separately-grained sub-query.
///
/// `result_expr` is evaluated at the grain given by `lod` and joined back to the main
/// query through `joining`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFork {
    pub join_type: JoinType,
    pub result_expr: NodeRef,
    #[serde(default)]
    pub joining: Vec<JoinCondition>,
    #[serde(default)]
    pub lod: LodSpecifier,
    #[serde(default)]
    pub before_filter_by: BeforeFilterBy,
    #[serde(default)]
    pub bfb_filter_mutations: Vec<BfbFilterMutation>,
}

impl QueryFork {
    /// Position of `result_expr` among the fork node's children.
    pub const RESULT_EXPR_INDEX: usize = 0;
}
