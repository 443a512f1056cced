//! Query-level mutation pipeline.
//!
//! Each [`QueryMutator`] looks at a whole [`CompiledQuery`] (its dimensions,
//! filters and type) and then rewrites its formulas with formula mutations from
//! `formula_engine::mutation`. [`process_compiled_query`] runs them in order:
//!
//! 1. window and lookup preparation (default ordering, `AMONG`, lookup bfb);
//! 2. constant optimizations (skipped in validation mode);
//! 3. removal of constant group-by items for opted-in dialects;
//! 4. removal of always-true filters;
//! 5. nullification of non-flat formulas in totals queries;
//! 6. the top-level LOD check, then lookup, extended aggregation and window forking;
//! 7. before-filter-by normalization;
//! 8. level tagging.

use formula_core::{DialectCombo, FormulaItem, LiteralValue, NodeKind, NodeRef};
use formula_engine::inspect;
use formula_engine::mutation::bfb::NormalizeBeforeFilterByMutation;
use formula_engine::mutation::lod::{check_toplevel_dimensions, ExtAggregationToQueryForkMutation};
use formula_engine::mutation::lookup::{LookupDefaultBfbMutation, LookupFunctionToQueryForkMutation};
use formula_engine::mutation::optimization::{optimize_filter, optimize_formula};
use formula_engine::mutation::tagging::LevelTagMutation;
use formula_engine::mutation::window::{
    AmongToWithinGroupingMutation, DefaultWindowOrderingMutation,
    IgnoreExtraWithinGroupingMutation, WindowFunctionToQueryForkMutation,
};
use formula_engine::mutation::{apply_mutations, FormulaMutation};
use formula_engine::validation::contains_inconsistent_aggregations;

use crate::error::QueryError;
use crate::primitives::{CompiledQuery, QueryPart, QueryType};
use crate::settings::CompilerSettings;

/// Dialects that drop constant expressions from `GROUP BY`.
///
/// No dialect is registered for it out of the box.
pub const REMOVE_CONST_FROM_GROUP_BY_DIALECTS: DialectCombo = DialectCombo::EMPTY;

pub trait QueryMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError>;
}

fn apply_to_parts(
    query: CompiledQuery,
    parts: &[QueryPart],
    mutations: &[&dyn FormulaMutation],
) -> CompiledQuery {
    query.map_formulas(parts, |_, formula| apply_mutations(formula, mutations))
}

fn any_formula(query: &CompiledQuery, predicate: impl Fn(&NodeRef) -> bool) -> bool {
    query.all_formulas().any(|(_, info)| predicate(&info.formula))
}

/// Normalizes window calls and lookups before anything else looks at them.
pub struct FormulaPreparationMutator {
    default_ordering: Vec<NodeRef>,
}

impl FormulaPreparationMutator {
    pub fn new(default_ordering: Vec<NodeRef>) -> Self {
        FormulaPreparationMutator { default_ordering }
    }
}

impl QueryMutator for FormulaPreparationMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        let dimensions = query.dimensions();
        let default_ordering = DefaultWindowOrderingMutation::new(self.default_ordering.clone());
        let among = AmongToWithinGroupingMutation::new(dimensions.clone());
        let extra_within = IgnoreExtraWithinGroupingMutation::new(dimensions);
        Ok(apply_to_parts(
            query,
            &QueryPart::ALL,
            &[&default_ordering, &LookupDefaultBfbMutation, &among, &extra_within],
        ))
    }
}

/// Constant folding. Filters also get the filter-only simplifications.
pub struct OptimizingQueryMutator {
    disable_optimizations: bool,
    dialect: DialectCombo,
}

impl OptimizingQueryMutator {
    pub fn new(disable_optimizations: bool, dialect: DialectCombo) -> Self {
        OptimizingQueryMutator {
            disable_optimizations,
            dialect,
        }
    }
}

impl QueryMutator for OptimizingQueryMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        if self.disable_optimizations {
            return Ok(query);
        }
        Ok(query.map_formulas(&QueryPart::ALL, |part, formula| match part {
            QueryPart::Filters => optimize_filter(formula, self.dialect),
            _ => optimize_formula(formula, self.dialect),
        }))
    }
}

pub struct RemoveConstFromGroupByMutator {
    dialect: DialectCombo,
    applicable_dialects: DialectCombo,
}

impl RemoveConstFromGroupByMutator {
    pub fn new(dialect: DialectCombo) -> Self {
        RemoveConstFromGroupByMutator {
            dialect,
            applicable_dialects: REMOVE_CONST_FROM_GROUP_BY_DIALECTS,
        }
    }

    pub fn with_applicable_dialects(mut self, dialects: DialectCombo) -> Self {
        self.applicable_dialects = dialects;
        self
    }

    fn applies(&self) -> bool {
        !self.dialect.is_empty() && self.applicable_dialects.contains(self.dialect)
    }
}

impl QueryMutator for RemoveConstFromGroupByMutator {
    fn mutate_query(&self, mut query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        if self.applies() {
            query
                .group_by
                .retain(|info| !inspect::is_bound_only_to(&info.formula, &[]));
        }
        Ok(query)
    }
}

fn is_true_literal(formula: &NodeRef) -> bool {
    matches!(formula.literal(), Some(LiteralValue::Boolean(true)))
}

pub struct DropTrueFiltersMutator;

impl QueryMutator for DropTrueFiltersMutator {
    fn mutate_query(&self, mut query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        query.filters.retain(|info| !is_true_literal(&info.formula));
        Ok(query)
    }
}

/// Totals cannot reproduce forked or window semantics: such formulas become `NULL`.
pub struct TotalsNullificationMutator;

impl TotalsNullificationMutator {
    fn should_nullify(formula: &NodeRef, dimensions: &[NodeRef]) -> bool {
        inspect::contains_lookup_functions(formula)
            || inspect::contains_extended_aggregations(formula, true)
            || contains_inconsistent_aggregations(formula, dimensions)
            || inspect::is_window_expression(formula)
    }
}

impl QueryMutator for TotalsNullificationMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        if query.meta.query_type != QueryType::Totals {
            return Ok(query);
        }
        let dimensions = query.dimensions();
        if !any_formula(&query, |formula| Self::should_nullify(formula, &dimensions)) {
            return Ok(query);
        }
        Ok(query.map_formulas(&QueryPart::ALL, |_, formula| {
            if Self::should_nullify(formula, &dimensions) {
                log::debug!("nullifying totals formula {formula}");
                FormulaItem::with_meta(NodeKind::Literal(LiteralValue::Null), formula.meta.clone())
            } else {
                formula.clone()
            }
        }))
    }
}

/// Turns lookups, extended aggregations and window calls into query forks.
pub struct ExtendedAggregationQueryMutator {
    allow_empty_dimensions: bool,
    allow_arbitrary_toplevel_lod_dimensions: bool,
}

impl ExtendedAggregationQueryMutator {
    pub fn new(settings: &CompilerSettings) -> Self {
        ExtendedAggregationQueryMutator {
            allow_empty_dimensions: settings.allow_empty_dimensions,
            allow_arbitrary_toplevel_lod_dimensions: settings
                .allow_arbitrary_toplevel_lod_dimensions,
        }
    }
}

impl QueryMutator for ExtendedAggregationQueryMutator {
    fn mutate_query(&self, mut query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        let dimensions = query.dimensions();
        let has_lookups = any_formula(&query, inspect::contains_lookup_functions);
        let has_extaggs = any_formula(&query, |formula| {
            inspect::contains_extended_aggregations(formula, true)
        });
        let has_winfuncs = any_formula(&query, inspect::is_window_expression);
        log::debug!(
            "query {}: lookups={has_lookups} extended aggregations={has_extaggs} windows={has_winfuncs}",
            query.id
        );

        // Checked on the unforked formulas: a fork at incompatible dimensions
        // turns into an error node that no longer shows its dimensions.
        if has_extaggs && !self.allow_arbitrary_toplevel_lod_dimensions {
            for (_, info) in query.all_formulas() {
                check_toplevel_dimensions(&info.formula, &dimensions)?;
            }
        }

        if has_lookups {
            let lookup =
                LookupFunctionToQueryForkMutation::new(dimensions.clone(), self.allow_empty_dimensions);
            query = apply_to_parts(query, &QueryPart::ALL, &[&lookup]);
        }
        if has_extaggs || has_winfuncs {
            let ext_agg = ExtAggregationToQueryForkMutation::new(dimensions.clone());
            query = apply_to_parts(query, &QueryPart::ALL, &[&ext_agg]);
        }
        if has_winfuncs {
            let window = WindowFunctionToQueryForkMutation::new(dimensions.clone());
            query = apply_to_parts(query, &QueryPart::ALL, &[&window]);
        }

        Ok(query)
    }
}

/// Limits before-filter-by sets to the filters of the query and propagates them
/// down through nested windows and forks.
pub struct NormalizeBfbQueryMutator;

impl QueryMutator for NormalizeBfbQueryMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        let normalize = NormalizeBeforeFilterByMutation::new(query.filter_ids());
        Ok(apply_to_parts(query, &QueryPart::ALL, &[&normalize]))
    }
}

pub struct LevelTagQueryMutator;

impl QueryMutator for LevelTagQueryMutator {
    fn mutate_query(&self, query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
        Ok(apply_to_parts(query, &QueryPart::ALL, &[&LevelTagMutation]))
    }
}

/// The mutators [`process_compiled_query`] runs, in order.
pub fn default_mutators(
    settings: &CompilerSettings,
    default_ordering: &[NodeRef],
) -> Vec<Box<dyn QueryMutator>> {
    vec![
        Box::new(FormulaPreparationMutator::new(default_ordering.to_vec())),
        Box::new(OptimizingQueryMutator::new(
            settings.disable_optimizations,
            settings.dialect,
        )),
        Box::new(RemoveConstFromGroupByMutator::new(settings.dialect)),
        Box::new(DropTrueFiltersMutator),
        Box::new(TotalsNullificationMutator),
        Box::new(ExtendedAggregationQueryMutator::new(settings)),
        Box::new(NormalizeBfbQueryMutator),
        Box::new(LevelTagQueryMutator),
    ]
}

/// Run the whole mutation pipeline over a compiled query.
pub fn process_compiled_query(
    query: CompiledQuery,
    settings: &CompilerSettings,
    default_ordering: &[NodeRef],
) -> Result<CompiledQuery, QueryError> {
    default_mutators(settings, default_ordering)
        .iter()
        .try_fold(query, |query, mutator| mutator.mutate_query(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::CompiledFormulaInfo;
    use formula_core::shortcuts as n;
    use formula_core::{codes, LevelTag};
    use pretty_assertions::assert_eq;

    fn query(select: Vec<NodeRef>, group_by: Vec<NodeRef>) -> CompiledQuery {
        let mut query = CompiledQuery::new("qq");
        query.select = select.into_iter().map(CompiledFormulaInfo::new).collect();
        query.group_by = group_by.into_iter().map(CompiledFormulaInfo::new).collect();
        query
    }

    fn selected(query: &CompiledQuery) -> Vec<NodeRef> {
        query.select.iter().map(|info| info.formula.clone()).collect()
    }

    #[test]
    fn true_filters_are_dropped_after_folding() {
        let mut q = query(vec![n::field("city")], vec![n::field("city")]);
        q.filters.push(CompiledFormulaInfo::new(n::binary("==", n::lit_int(1), n::lit_int(1))));
        q.filters.push(CompiledFormulaInfo::new(n::binary(">", n::field("sales"), n::lit_int(1))));
        let q = process_compiled_query(q, &CompilerSettings::default(), &[]).expect("processed");
        assert_eq!(q.filters.len(), 1);
    }

    #[test]
    fn folded_and_literal_formulas_compile_alike() {
        let folded = query(
            vec![n::binary("==", n::binary("+", n::lit_int(2), n::lit_int(2)), n::field("x"))],
            vec![n::field("x")],
        );
        let literal = query(
            vec![n::binary("==", n::lit_int(4), n::field("x"))],
            vec![n::field("x")],
        );
        let settings = CompilerSettings::new(DialectCombo::POSTGRESQL_9_4);

        let process = |q: &CompiledQuery, settings: &CompilerSettings| {
            process_compiled_query(q.clone(), settings, &[]).expect("processed")
        };
        assert_eq!(
            selected(&process(&folded, &settings)),
            selected(&process(&literal, &settings))
        );

        let settings = settings.with_disabled_optimizations(true);
        let unfolded = process(&folded, &settings);
        assert_ne!(selected(&unfolded), selected(&process(&literal, &settings)));
        let NodeKind::Binary { left, .. } = &unfolded.select[0].formula.kind else {
            panic!("comparison expected");
        };
        assert!(matches!(&left.kind, NodeKind::Binary { name, .. } if name == "+"));
    }

    #[test]
    fn constant_group_by_items_are_kept_unless_the_dialect_opts_in() {
        let q = query(vec![n::field("city")], vec![n::field("city"), n::lit_int(1)]);
        let kept = RemoveConstFromGroupByMutator::new(DialectCombo::POSTGRESQL_9_4)
            .mutate_query(q.clone())
            .expect("mutated");
        assert_eq!(kept.group_by.len(), 2);

        let removed = RemoveConstFromGroupByMutator::new(DialectCombo::POSTGRESQL_9_4)
            .with_applicable_dialects(DialectCombo::POSTGRESQL)
            .mutate_query(q)
            .expect("mutated");
        assert_eq!(removed.dimensions(), vec![n::field("city")]);
    }

    #[test]
    fn totals_keep_flat_aggregations() {
        let mut q = query(
            vec![
                n::func("sum", [n::field("sales")]),
                n::func("avg", [n::func_lod("sum", [n::field("sales")], n::include([n::field("city")]))]),
            ],
            Vec::new(),
        );
        q.meta.query_type = QueryType::Totals;
        let q = process_compiled_query(q, &CompilerSettings::default(), &[]).expect("processed");
        assert_eq!(selected(&q), vec![n::func("sum", [n::field("sales")]), n::lit_null()]);
        assert!(!q.contains_query_forks());
    }

    #[test]
    fn window_calls_are_forked_and_tagged() {
        let q = query(
            vec![n::field("city"), n::wfunc("rank", [n::func("sum", [n::field("sales")])])],
            vec![n::field("city")],
        );
        let q = process_compiled_query(q, &CompilerSettings::default(), &[]).expect("processed");
        let fork = q.select[1].formula.query_fork().cloned().expect("window fork");
        assert_eq!(fork.result_expr.level_tag(), Some(&LevelTag::new(Vec::<String>::new(), -1).with_qfork_nesting(1)));
        assert_eq!(
            process_compiled_query(q.clone(), &CompilerSettings::default(), &[]).expect("processed"),
            q
        );
    }

    #[test]
    fn toplevel_lod_outside_group_by_is_rejected() {
        let lod = n::func_lod("sum", [n::field("sales")], n::fixed([n::field("category")]));
        let q = query(vec![n::field("city"), lod], vec![n::field("city")]);
        let err = process_compiled_query(q.clone(), &CompilerSettings::default(), &[])
            .expect_err("invalid dimensions");
        assert_eq!(
            err.formula_errors().iter().map(|e| e.code()).collect::<Vec<_>>(),
            vec![codes::LOD_INVALID_TOPLEVEL_DIMENSIONS]
        );

        let settings = CompilerSettings::default().with_arbitrary_toplevel_lod_dimensions(true);
        assert!(process_compiled_query(q, &settings, &[]).is_ok());
    }
}
