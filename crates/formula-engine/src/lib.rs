#![forbid(unsafe_code)]
#![deny(unreachable_patterns)]

//! Function registry, tree rewrites and SQL translation for BI formulas.
//!
//! Every function, operator and internal helper is registered as a
//! [`registry::FunctionSpec`] carrying argument-type alternatives and per-dialect
//! translation variants. [`translation::translate`] dispatches a formula tree
//! through the registry for one dialect and produces a [`sql::SqlExpr`].
//!
//! Before translation, query-level code runs the passes in [`mutation`] over each
//! formula: constant folding, window normalization, and the rewrites that turn
//! lookups, LOD aggregations and window functions into query forks.
//!
//! ## Deferred errors
//!
//! Passes never fail. A rewrite that finds an invalid construct replaces it with an
//! `Error` node; [`mutation::collect_errors`] reports them once all passes ran.

pub mod definitions;
pub mod inspect;
pub mod mutation;
pub mod registry;
pub mod sql;
pub mod translation;
pub mod validation;

pub use mutation::{apply_mutations, apply_mutations_to_fixpoint, collect_errors, FormulaMutation};
pub use registry::{resolve, FunctionSpec, Resolution, Scope};
pub use sql::SqlExpr;
pub use translation::{translate, FieldInfo, TranslationCtx, TranslationEnv};
pub use validation::{AggState, AggregationChecker};
