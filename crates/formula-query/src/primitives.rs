//! Compiled query structures.
//!
//! A [`CompiledQuery`] holds its formulas in five ordered lists (see [`QueryPart`]).
//! Splitting turns one compiled query into a [`CompiledMultiQuery`]: sub-queries
//! first, each query after the ones it selects from, the top query last.

use std::collections::BTreeSet;

use formula_core::{JoinType, NodeRef, OrderDirection};
use serde::{Deserialize, Serialize};

use formula_engine::inspect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPart {
    Select,
    GroupBy,
    Filters,
    OrderBy,
    JoinOn,
}

impl QueryPart {
    pub const ALL: [QueryPart; 5] = [
        QueryPart::Select,
        QueryPart::GroupBy,
        QueryPart::Filters,
        QueryPart::OrderBy,
        QueryPart::JoinOn,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Normal,
    Totals,
    Subtotals,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryMeta {
    pub query_type: QueryType,
}

/// The two FROM objects a `join_on` formula connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_id: String,
    pub right_id: String,
    pub join_type: JoinType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledFormulaInfo {
    pub formula: NodeRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Field the formula was built for; `None` for anonymous and system formulas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_field_id: Option<String>,
    /// FROM objects the formula reads from.
    pub avatar_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    /// Sort direction of `order_by` items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<OrderDirection>,
}

impl CompiledFormulaInfo {
    pub fn new(formula: NodeRef) -> Self {
        CompiledFormulaInfo {
            formula,
            alias: None,
            original_field_id: None,
            avatar_ids: BTreeSet::new(),
            join: None,
            direction: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_field_id(mut self, field_id: impl Into<String>) -> Self {
        self.original_field_id = Some(field_id.into());
        self
    }

    pub fn with_direction(mut self, direction: OrderDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_avatar_ids<I, S>(mut self, avatar_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.avatar_ids = avatar_ids.into_iter().map(Into::into).collect();
        self
    }

    /// The same formula info around a different tree.
    pub fn with_formula(&self, formula: NodeRef) -> Self {
        CompiledFormulaInfo {
            formula,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FromObject {
    /// Physical table behind a data source avatar.
    Table {
        id: String,
        alias: String,
        source: String,
    },
    /// Result of another query of the same multi-query.
    Subquery {
        id: String,
        alias: String,
        query_id: String,
        columns: Vec<String>,
    },
}

impl FromObject {
    pub fn id(&self) -> &str {
        match self {
            FromObject::Table { id, .. } | FromObject::Subquery { id, .. } => id,
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            FromObject::Table { alias, .. } | FromObject::Subquery { alias, .. } => alias,
        }
    }
}

/// FROM objects of a query. The first one is the root the others are joined to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinedFrom {
    pub froms: Vec<FromObject>,
}

impl JoinedFrom {
    pub fn root(&self) -> Option<&FromObject> {
        self.froms.first()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = &str> {
        self.froms.iter().map(FromObject::id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledQuery {
    pub id: String,
    pub select: Vec<CompiledFormulaInfo>,
    pub group_by: Vec<CompiledFormulaInfo>,
    pub filters: Vec<CompiledFormulaInfo>,
    pub order_by: Vec<CompiledFormulaInfo>,
    pub join_on: Vec<CompiledFormulaInfo>,
    pub joined_from: JoinedFrom,
    pub meta: QueryMeta,
}

impl CompiledQuery {
    pub fn new(id: impl Into<String>) -> Self {
        CompiledQuery {
            id: id.into(),
            select: Vec::new(),
            group_by: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
            join_on: Vec::new(),
            joined_from: JoinedFrom::default(),
            meta: QueryMeta::default(),
        }
    }

    pub fn formulas(&self, part: QueryPart) -> &[CompiledFormulaInfo] {
        match part {
            QueryPart::Select => &self.select,
            QueryPart::GroupBy => &self.group_by,
            QueryPart::Filters => &self.filters,
            QueryPart::OrderBy => &self.order_by,
            QueryPart::JoinOn => &self.join_on,
        }
    }

    pub fn formulas_mut(&mut self, part: QueryPart) -> &mut Vec<CompiledFormulaInfo> {
        match part {
            QueryPart::Select => &mut self.select,
            QueryPart::GroupBy => &mut self.group_by,
            QueryPart::Filters => &mut self.filters,
            QueryPart::OrderBy => &mut self.order_by,
            QueryPart::JoinOn => &mut self.join_on,
        }
    }

    pub fn all_formulas(&self) -> impl Iterator<Item = (QueryPart, &CompiledFormulaInfo)> {
        QueryPart::ALL
            .into_iter()
            .flat_map(move |part| self.formulas(part).iter().map(move |info| (part, info)))
    }

    /// The group-by expressions, which are the dimensions of the query.
    pub fn dimensions(&self) -> Vec<NodeRef> {
        self.group_by.iter().map(|info| info.formula.clone()).collect()
    }

    /// Ids of the filters of this query that belong to a field.
    pub fn filter_ids(&self) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter_map(|info| info.original_field_id.clone())
            .collect()
    }

    /// Rewrite the formulas of `parts`; unchanged formulas are kept as they are.
    pub fn map_formulas<F>(mut self, parts: &[QueryPart], mut rewrite: F) -> Self
    where
        F: FnMut(QueryPart, &NodeRef) -> NodeRef,
    {
        for &part in parts {
            for info in self.formulas_mut(part).iter_mut() {
                let formula = rewrite(part, &info.formula);
                if formula != info.formula {
                    info.formula = formula;
                }
            }
        }
        self
    }

    /// Whether any formula that can be split still holds a query fork.
    pub fn contains_query_forks(&self) -> bool {
        [QueryPart::Select, QueryPart::OrderBy, QueryPart::Filters]
            .into_iter()
            .any(|part| {
                self.formulas(part)
                    .iter()
                    .any(|info| inspect::contains_query_forks(&info.formula))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompiledMultiQuery {
    pub queries: Vec<CompiledQuery>,
}

impl CompiledMultiQuery {
    pub fn single(query: CompiledQuery) -> Self {
        CompiledMultiQuery {
            queries: vec![query],
        }
    }

    pub fn top_query(&self) -> Option<&CompiledQuery> {
        self.queries.last()
    }

    pub fn query(&self, id: &str) -> Option<&CompiledQuery> {
        self.queries.iter().find(|query| query.id == id)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// `(query id, sub-query id)` pairs: which query selects from which.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.queries
            .iter()
            .flat_map(|query| {
                query.joined_from.froms.iter().filter_map(|from| match from {
                    FromObject::Subquery { query_id, .. } => {
                        Some((query.id.as_str(), query_id.as_str()))
                    }
                    FromObject::Table { .. } => None,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::shortcuts as n;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_formulas_only_touches_requested_parts() {
        let mut query = CompiledQuery::new("q");
        query.select.push(CompiledFormulaInfo::new(n::field("a")));
        query.filters.push(CompiledFormulaInfo::new(n::field("a")));
        let query = query.map_formulas(&[QueryPart::Filters], |_, _| n::lit_bool(true));
        assert_eq!(query.select[0].formula, n::field("a"));
        assert_eq!(query.filters[0].formula, n::lit_bool(true));
    }

    #[test]
    fn group_by_items_are_the_dimensions() {
        let mut query = CompiledQuery::new("q");
        query.group_by.push(CompiledFormulaInfo::new(n::field("city")));
        query
            .filters
            .push(CompiledFormulaInfo::new(n::lit_bool(true)).with_field_id("city"));
        query.filters.push(CompiledFormulaInfo::new(n::lit_bool(true)));
        assert_eq!(query.dimensions(), vec![n::field("city")]);
        assert_eq!(query.filter_ids(), BTreeSet::from(["city".to_string()]));
    }
}
