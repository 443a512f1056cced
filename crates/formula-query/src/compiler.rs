//! [`QuerySpec`] to [`CompiledQuery`].

use std::collections::BTreeSet;

use formula_core::{FormulaError, NodeKind, NodeRef, OrderDirection, ValidationError};
use formula_engine::mutation::collect_errors;
use formula_engine::validation::{AggState, AggregationChecker};
use formula_engine::{inspect, translate, SqlExpr, TranslationEnv};

use crate::column_registry::ColumnRegistry;
use crate::error::QueryError;
use crate::mutator::process_compiled_query;
use crate::name_gen::PrefixedIdGen;
use crate::primitives::{
    CompiledFormulaInfo, CompiledQuery, FromObject, JoinSpec, JoinedFrom, QueryPart, QueryType,
};
use crate::query_spec::{QueryItem, QuerySpec};
use crate::settings::CompilerSettings;

/// Id of the query a spec compiles into (the top query after splitting).
pub const BASE_QUERY_ID: &str = "qq";

const RESULT_ALIAS_PREFIX: &str = "res_";

/// Translation environment with every registered field bound to its avatar's column.
pub fn registry_env(registry: &ColumnRegistry, settings: &CompilerSettings) -> TranslationEnv {
    let mut env = TranslationEnv::new(settings.dialect);
    for info in registry.columns() {
        env.add_field(
            info.field_id.clone(),
            SqlExpr::qualified(info.avatar_id.clone(), info.column.clone()),
            info.data_type,
        );
        if let Some(field) = env.fields.get_mut(&info.field_id) {
            field.params = info.params.clone();
        }
    }
    env
}

pub struct QueryCompiler<'a> {
    registry: &'a ColumnRegistry,
    settings: CompilerSettings,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(registry: &'a ColumnRegistry, settings: CompilerSettings) -> Self {
        QueryCompiler { registry, settings }
    }

    /// Build, validate and mutate the query described by `spec`.
    ///
    /// Every formula-level problem found along the way is reported together in
    /// one [`QueryError::FormulaHandling`].
    pub fn compile(&self, spec: &QuerySpec) -> Result<CompiledQuery, QueryError> {
        let mut errors = Vec::new();
        let mut query = self.build_query(spec, &mut errors);

        let env = registry_env(self.registry, &self.settings);
        for (_, info) in query.all_formulas() {
            match translate(&info.formula, &env) {
                // Lookups and AMONG groupings only translate once they are mutated.
                Ok(_) | Err(FormulaError::UnsupportedNode(_)) => {}
                Err(err) => push_error(&mut errors, err),
            }
        }
        if spec.query_type != QueryType::Totals {
            self.check_aggregation(&query, &mut errors);
        }
        if !errors.is_empty() {
            return Err(QueryError::FormulaHandling(errors));
        }

        query.joined_from = self.joined_from(&query, spec)?;
        let query = process_compiled_query(query, &self.settings, &spec.default_ordering)?;

        let errors: Vec<FormulaError> = query
            .all_formulas()
            .flat_map(|(_, info)| collect_errors(&info.formula))
            .collect();
        if !errors.is_empty() {
            return Err(QueryError::FormulaHandling(errors));
        }
        log::debug!(
            "compiled query {} with {} select items",
            query.id,
            query.select.len()
        );
        Ok(query)
    }

    fn build_query(&self, spec: &QuerySpec, errors: &mut Vec<FormulaError>) -> CompiledQuery {
        let mut aliases = PrefixedIdGen::new(RESULT_ALIAS_PREFIX);
        let mut query = CompiledQuery::new(BASE_QUERY_ID);
        query.meta.query_type = spec.query_type;

        query.select = spec
            .select
            .iter()
            .map(|item| {
                let alias = item.alias.clone().unwrap_or_else(|| aliases.get_id());
                self.formula_info(item, errors).with_alias(alias)
            })
            .collect();
        // A dimension that is also selected shares its alias.
        query.group_by = spec
            .group_by
            .iter()
            .map(|item| {
                let alias = item
                    .alias
                    .clone()
                    .or_else(|| {
                        query
                            .select
                            .iter()
                            .find(|info| info.formula == item.formula)
                            .and_then(|info| info.alias.clone())
                    })
                    .unwrap_or_else(|| aliases.get_id());
                self.formula_info(item, errors).with_alias(alias)
            })
            .collect();
        query.filters = spec
            .filters
            .iter()
            .map(|item| self.formula_info(item, errors))
            .collect();
        // Ordering by a dimension reuses the dimension's alias.
        query.order_by = spec
            .order_by
            .iter()
            .map(|item| {
                let (formula, direction) = match &item.formula.kind {
                    NodeKind::Ordered { expr, direction } => (expr.clone(), *direction),
                    _ => (item.formula.clone(), OrderDirection::Asc),
                };
                let item = QueryItem {
                    formula,
                    ..item.clone()
                };
                let mut info = self.formula_info(&item, errors).with_direction(direction);
                if info.alias.is_none() {
                    info.alias = query
                        .group_by
                        .iter()
                        .find(|dim| dim.formula == item.formula)
                        .and_then(|dim| dim.alias.clone());
                }
                info
            })
            .collect();
        query.join_on = spec
            .join_on
            .iter()
            .map(|item| {
                let mut info = self.formula_info(&QueryItem::new(item.formula.clone()), errors);
                info.join = Some(JoinSpec {
                    left_id: item.left_id.clone(),
                    right_id: item.right_id.clone(),
                    join_type: item.join_type,
                });
                info
            })
            .collect();
        query
    }

    fn formula_info(&self, item: &QueryItem, errors: &mut Vec<FormulaError>) -> CompiledFormulaInfo {
        let mut avatar_ids = BTreeSet::new();
        for name in inspect::used_field_names(&item.formula) {
            match self.registry.resolve(&name) {
                Ok(column) => {
                    avatar_ids.insert(column.avatar_id.clone());
                }
                Err(err) => push_error(errors, err),
            }
        }
        let mut info = CompiledFormulaInfo::new(item.formula.clone()).with_avatar_ids(avatar_ids);
        info.original_field_id = item.field_id.clone();
        info.alias = item.alias.clone();
        info
    }

    fn check_aggregation(&self, query: &CompiledQuery, errors: &mut Vec<FormulaError>) {
        let dimensions = query.dimensions();
        let checker = AggregationChecker::new(&dimensions);
        let mut states: Vec<(NodeRef, AggState)> = Vec::new();
        for part in [QueryPart::Select, QueryPart::OrderBy, QueryPart::Filters] {
            for info in query.formulas(part) {
                match checker.check(&info.formula) {
                    Ok(state) if part != QueryPart::Filters => {
                        states.push((info.formula.clone(), state));
                    }
                    Ok(_) => {}
                    Err(err) => push_error(errors, err.into()),
                }
            }
        }

        // Row-level values cannot be selected next to groups.
        let grouped = !dimensions.is_empty()
            || states.iter().any(|(_, state)| *state == AggState::Aggregated);
        if grouped {
            for (formula, state) in &states {
                if *state == AggState::Unaggregated {
                    push_error(
                        errors,
                        ValidationError::InconsistentAggregation(formula.to_string()).into(),
                    );
                }
            }
        }
    }

    /// Join-on avatars first, in join order, then those referenced by formulas.
    fn joined_from(&self, query: &CompiledQuery, spec: &QuerySpec) -> Result<JoinedFrom, QueryError> {
        let mut ids: Vec<String> = Vec::new();
        let mut push = |id: &str| {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        };
        for item in &spec.join_on {
            push(&item.left_id);
            push(&item.right_id);
        }
        for (_, info) in query.all_formulas() {
            for id in &info.avatar_ids {
                push(id);
            }
        }

        let froms = ids
            .into_iter()
            .map(|id| {
                let avatar = self
                    .registry
                    .avatar(&id)
                    .ok_or_else(|| QueryError::UnknownAvatar(id.clone()))?;
                Ok(FromObject::Table {
                    alias: id.clone(),
                    source: avatar.source.clone(),
                    id,
                })
            })
            .collect::<Result<Vec<_>, QueryError>>()?;
        Ok(JoinedFrom { froms })
    }
}

fn push_error(errors: &mut Vec<FormulaError>, err: FormulaError) {
    if !errors.contains(&err) {
        errors.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::shortcuts as n;
    use formula_core::{codes, DataType};
    use pretty_assertions::assert_eq;

    fn registry() -> ColumnRegistry {
        let mut registry = ColumnRegistry::new();
        registry.add_avatar("orders", "orders").expect("avatar");
        registry
            .with_column("city", "orders", "city", DataType::String)
            .and_then(|r| r.with_column("sales", "orders", "sales", DataType::Float))
            .expect("columns")
    }

    fn codes_of(err: &QueryError) -> Vec<String> {
        err.formula_errors()
            .iter()
            .map(|err| err.code().to_string())
            .collect()
    }

    #[test]
    fn selected_dimensions_share_their_alias() {
        let spec = QuerySpec::new()
            .select(n::field("city"))
            .select(n::func("sum", [n::field("sales")]))
            .group_by(n::field("city"));
        let query = QueryCompiler::new(&registry(), CompilerSettings::default())
            .compile(&spec)
            .expect("compiled");
        assert_eq!(query.id, BASE_QUERY_ID);
        assert_eq!(query.group_by[0].alias.as_deref(), Some("res_1"));
        assert_eq!(query.select[1].alias.as_deref(), Some("res_2"));
        assert_eq!(
            query.joined_from.froms,
            vec![FromObject::Table {
                id: "orders".to_string(),
                alias: "orders".to_string(),
                source: "orders".to_string(),
            }]
        );
    }

    #[test]
    fn errors_are_reported_together() {
        let spec = QuerySpec::new()
            .select(n::field("missing"))
            .select(n::binary("*", n::func("sum", [n::field("sales")]), n::field("sales")));
        let err = QueryCompiler::new(&registry(), CompilerSettings::default())
            .compile(&spec)
            .expect_err("invalid query");
        assert_eq!(
            codes_of(&err),
            vec![codes::UNKNOWN_FIELD, codes::INCONSISTENT_AGGREGATION]
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn row_level_values_next_to_aggregates_are_rejected() {
        let spec = QuerySpec::new()
            .select(n::field("city"))
            .select(n::func("sum", [n::field("sales")]));
        let err = QueryCompiler::new(&registry(), CompilerSettings::default())
            .compile(&spec)
            .expect_err("city is not grouped");
        assert_eq!(codes_of(&err), vec![codes::INCONSISTENT_AGGREGATION.to_string()]);
    }
}
