//! Query compilation on top of the formula engine.
//!
//! A [`QuerySpec`] is compiled into a [`CompiledQuery`], run through the query
//! mutator pipeline, split into a [`CompiledMultiQuery`] wherever query forks remain
//! and finally translated into SQL for one dialect.

#![forbid(unsafe_code)]

pub mod column_registry;
pub mod compiler;
pub mod error;
pub mod mutator;
pub mod name_gen;
pub mod primitives;
pub mod query_spec;
pub mod settings;
pub mod splitter;
pub mod translation;

pub use crate::column_registry::{AvatarInfo, ColumnInfo, ColumnRegistry};
pub use crate::compiler::QueryCompiler;
pub use crate::error::QueryError;
pub use crate::mutator::{process_compiled_query, QueryMutator};
pub use crate::primitives::{
    CompiledFormulaInfo, CompiledMultiQuery, CompiledQuery, FromObject, JoinSpec, JoinedFrom,
    QueryMeta, QueryPart, QueryType,
};
pub use crate::query_spec::{JoinOnItem, QueryItem, QuerySpec};
pub use crate::settings::CompilerSettings;
pub use crate::splitter::split_query_forks;
pub use crate::translation::{
    AvatarAliasMapper, MultiQueryTranslator, TranslatedMultiQuery, TranslatedQuery,
};

/// Compile `spec` and split it into sub-queries.
pub fn compile_multi_query(
    spec: &QuerySpec,
    registry: &ColumnRegistry,
    settings: &CompilerSettings,
) -> Result<CompiledMultiQuery, QueryError> {
    let query = QueryCompiler::new(registry, settings.clone()).compile(spec)?;
    split_query_forks(query)
}

/// Compile, split and translate `spec` for `settings.dialect`.
pub fn translate_query_spec(
    spec: &QuerySpec,
    registry: &ColumnRegistry,
    settings: &CompilerSettings,
) -> Result<TranslatedMultiQuery, QueryError> {
    let multi_query = compile_multi_query(spec, registry, settings)?;
    MultiQueryTranslator::new(registry, settings.dialect).translate(&multi_query)
}
