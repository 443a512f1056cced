//! Translation of compiled multi-queries into SQL expressions.
//!
//! Every query of a [`CompiledMultiQuery`] is translated on its own, against
//! the columns of the FROM objects it reads: registry columns for avatars and
//! the selected columns of already translated sub-queries.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use formula_core::{DataType, DialectCombo, JoinType, OrderDirection};
use formula_engine::{inspect, translate, SqlExpr, TranslationEnv};
use serde::Serialize;
use uuid::Uuid;

use crate::column_registry::ColumnRegistry;
use crate::error::QueryError;
use crate::name_gen::PrefixedIdGen;
use crate::primitives::{CompiledFormulaInfo, CompiledMultiQuery, CompiledQuery, FromObject};

const TABLE_ALIAS_PREFIX: &str = "t";

/// Short table aliases for avatars identified by UUIDs; other ids are used as
/// they are unless the name is already taken.
#[derive(Debug, Clone)]
pub struct AvatarAliasMapper {
    aliases: BTreeMap<String, String>,
    taken: BTreeSet<String>,
    ids: PrefixedIdGen,
}

impl Default for AvatarAliasMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl AvatarAliasMapper {
    pub fn new() -> Self {
        AvatarAliasMapper {
            aliases: BTreeMap::new(),
            taken: BTreeSet::new(),
            ids: PrefixedIdGen::new(TABLE_ALIAS_PREFIX),
        }
    }

    pub fn alias_for(&mut self, avatar_id: &str) -> String {
        if let Some(alias) = self.aliases.get(avatar_id) {
            return alias.clone();
        }
        let alias = if Uuid::parse_str(avatar_id).is_err() && !self.taken.contains(avatar_id) {
            avatar_id.to_string()
        } else {
            self.fresh_alias()
        };
        self.taken.insert(alias.clone());
        self.aliases.insert(avatar_id.to_string(), alias.clone());
        alias
    }

    fn fresh_alias(&mut self) -> String {
        loop {
            let alias = self.ids.get_id();
            if !self.taken.contains(&alias) {
                return alias;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedItem {
    pub expression: SqlExpr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranslatedFrom {
    Table { source: String, alias: String },
    Subquery { query_id: String, alias: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedJoin {
    pub from: TranslatedFrom,
    pub join_type: JoinType,
    pub condition: SqlExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedQuery {
    pub id: String,
    pub select: Vec<TranslatedItem>,
    pub group_by: Vec<SqlExpr>,
    /// Row-level filters.
    #[serde(rename = "where")]
    pub where_: Vec<SqlExpr>,
    /// Filters over aggregates.
    pub having: Vec<SqlExpr>,
    pub order_by: Vec<SqlExpr>,
    pub root_from: TranslatedFrom,
    pub joins: Vec<TranslatedJoin>,
}

impl TranslatedQuery {
    fn item(&self, alias: &str) -> Option<&TranslatedItem> {
        self.select
            .iter()
            .find(|item| item.alias.as_deref() == Some(alias))
    }
}

/// Translated queries, each after the sub-queries it selects from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedMultiQuery {
    pub queries: Vec<TranslatedQuery>,
}

impl TranslatedMultiQuery {
    pub fn top_query(&self) -> Option<&TranslatedQuery> {
        self.queries.last()
    }

    pub fn query(&self, id: &str) -> Option<&TranslatedQuery> {
        self.queries.iter().find(|query| query.id == id)
    }

    /// One SQL statement with the sub-queries inlined into the top query.
    pub fn to_sql(&self) -> Result<String, QueryError> {
        let top = self
            .top_query()
            .ok_or_else(|| QueryError::UnknownQuery(String::new()))?;
        self.render(top)
    }

    fn render_from(&self, from: &TranslatedFrom) -> Result<String, QueryError> {
        match from {
            TranslatedFrom::Table { source, alias } => Ok(format!("\"{source}\" AS {alias}")),
            TranslatedFrom::Subquery { query_id, alias } => {
                let subquery = self
                    .query(query_id)
                    .ok_or_else(|| QueryError::UnknownQuery(query_id.clone()))?;
                Ok(format!("({}) AS {alias}", self.render(subquery)?))
            }
        }
    }

    fn render(&self, query: &TranslatedQuery) -> Result<String, QueryError> {
        let mut sql = String::from("SELECT ");
        let select = query
            .select
            .iter()
            .map(|item| match &item.alias {
                Some(alias) => format!("{} AS \"{alias}\"", item.expression),
                None => item.expression.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&select);

        let _ = write!(sql, " FROM {}", self.render_from(&query.root_from)?);
        for join in &query.joins {
            let keyword = match join.join_type {
                JoinType::Left => "LEFT JOIN",
                JoinType::Inner => "JOIN",
            };
            let _ = write!(
                sql,
                " {keyword} {} ON {}",
                self.render_from(&join.from)?,
                join.condition
            );
        }
        write_clause(&mut sql, " WHERE ", &query.where_, " AND ");
        write_clause(&mut sql, " GROUP BY ", &query.group_by, ", ");
        write_clause(&mut sql, " HAVING ", &query.having, " AND ");
        write_clause(&mut sql, " ORDER BY ", &query.order_by, ", ");
        Ok(sql)
    }
}

fn write_clause(sql: &mut String, keyword: &str, items: &[SqlExpr], separator: &str) {
    if items.is_empty() {
        return;
    }
    sql.push_str(keyword);
    let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
    sql.push_str(&rendered.join(separator));
}

pub struct MultiQueryTranslator<'a> {
    registry: &'a ColumnRegistry,
    dialect: DialectCombo,
}

impl<'a> MultiQueryTranslator<'a> {
    pub fn new(registry: &'a ColumnRegistry, dialect: DialectCombo) -> Self {
        MultiQueryTranslator { registry, dialect }
    }

    pub fn translate(&self, multi_query: &CompiledMultiQuery) -> Result<TranslatedMultiQuery, QueryError> {
        let mut aliases = AvatarAliasMapper::new();
        let mut queries: Vec<TranslatedQuery> = Vec::with_capacity(multi_query.len());
        for query in &multi_query.queries {
            let translated = self.translate_query(query, &queries, &mut aliases)?;
            queries.push(translated);
        }
        Ok(TranslatedMultiQuery { queries })
    }

    fn translate_query(
        &self,
        query: &CompiledQuery,
        translated: &[TranslatedQuery],
        aliases: &mut AvatarAliasMapper,
    ) -> Result<TranslatedQuery, QueryError> {
        let mut env = TranslationEnv::new(self.dialect);
        let mut froms = Vec::with_capacity(query.joined_from.froms.len());
        for from in &query.joined_from.froms {
            froms.push(self.bind_from(from, translated, aliases, &mut env)?);
        }
        let mut froms = froms.into_iter();
        let (_, root_from) = froms
            .next()
            .ok_or_else(|| QueryError::MissingJoin(query.id.clone()))?;

        let expression = |info: &CompiledFormulaInfo| -> Result<_, QueryError> {
            translate(&info.formula, &env).map_err(|source| QueryError::Translation {
                query_id: query.id.clone(),
                source,
            })
        };

        let mut joins = Vec::new();
        for (from_id, translated_from) in froms {
            let mut join_type = JoinType::Inner;
            let mut condition: Option<SqlExpr> = None;
            for info in &query.join_on {
                let Some(spec) = info.join.as_ref().filter(|spec| spec.right_id == from_id) else {
                    continue;
                };
                join_type = spec.join_type;
                let part = expression(info)?.expression;
                condition = Some(match condition {
                    Some(previous) => SqlExpr::and(previous, part),
                    None => part,
                });
            }
            let condition = condition.ok_or_else(|| QueryError::MissingJoin(from_id.clone()))?;
            joins.push(TranslatedJoin {
                from: translated_from,
                join_type,
                condition,
            });
        }

        let mut select = Vec::with_capacity(query.select.len());
        for info in &query.select {
            let ctx = expression(info)?;
            select.push(TranslatedItem {
                expression: ctx.expression,
                alias: info.alias.clone(),
                data_type: ctx.data_type,
            });
        }
        let group_by = query
            .group_by
            .iter()
            .map(|info| expression(info).map(|ctx| ctx.expression))
            .collect::<Result<Vec<_>, _>>()?;
        let mut where_ = Vec::new();
        let mut having = Vec::new();
        for info in &query.filters {
            let condition = expression(info)?.expression;
            if inspect::is_aggregate_expression(&info.formula) {
                having.push(condition);
            } else {
                where_.push(condition);
            }
        }
        let order_by = query
            .order_by
            .iter()
            .map(|info| {
                expression(info).map(|ctx| SqlExpr::Ordered {
                    expr: Box::new(ctx.expression),
                    desc: info.direction == Some(OrderDirection::Desc),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::trace!("translated query {}", query.id);
        Ok(TranslatedQuery {
            id: query.id.clone(),
            select,
            group_by,
            where_,
            having,
            order_by,
            root_from,
            joins,
        })
    }

    /// Make the columns of `from` visible to formulas.
    fn bind_from(
        &self,
        from: &FromObject,
        translated: &[TranslatedQuery],
        aliases: &mut AvatarAliasMapper,
        env: &mut TranslationEnv,
    ) -> Result<(String, TranslatedFrom), QueryError> {
        match from {
            FromObject::Table { id, alias, source } => {
                let alias = aliases.alias_for(alias);
                for column in self.registry.columns_of(id) {
                    env.add_field(
                        column.field_id.clone(),
                        SqlExpr::qualified(alias.clone(), column.column.clone()),
                        column.data_type,
                    );
                    if let Some(field) = env.fields.get_mut(&column.field_id) {
                        field.params = column.params.clone();
                    }
                }
                Ok((
                    id.clone(),
                    TranslatedFrom::Table {
                        source: source.clone(),
                        alias,
                    },
                ))
            }
            FromObject::Subquery {
                id,
                alias,
                query_id,
                columns,
            } => {
                let subquery = translated
                    .iter()
                    .find(|query| query.id == *query_id)
                    .ok_or_else(|| QueryError::UnknownQuery(query_id.clone()))?;
                for column in columns {
                    let item = subquery.item(column).ok_or_else(|| QueryError::Translation {
                        query_id: query_id.clone(),
                        source: formula_core::FormulaError::UnknownField(column.clone()),
                    })?;
                    env.add_field(
                        column.clone(),
                        SqlExpr::qualified(alias.clone(), column.clone()),
                        item.data_type,
                    );
                }
                Ok((
                    id.clone(),
                    TranslatedFrom::Subquery {
                        query_id: query_id.clone(),
                        alias: alias.clone(),
                    },
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{JoinSpec, JoinedFrom};
    use formula_core::shortcuts as n;
    use pretty_assertions::assert_eq;

    const AVATAR: &str = "5a8f7d38-37c1-4d4a-9d3c-3a5a0b6e2f10";

    fn registry() -> ColumnRegistry {
        let mut registry = ColumnRegistry::new();
        registry.add_avatar(AVATAR, "orders").expect("avatar");
        registry
            .with_column("city", AVATAR, "city", DataType::String)
            .and_then(|r| r.with_column("sales", AVATAR, "sales", DataType::Float))
            .expect("columns")
    }

    fn table_query(id: &str) -> CompiledQuery {
        let mut query = CompiledQuery::new(id);
        query.joined_from = JoinedFrom {
            froms: vec![FromObject::Table {
                id: AVATAR.to_string(),
                alias: AVATAR.to_string(),
                source: "orders".to_string(),
            }],
        };
        query
    }

    #[test]
    fn uuid_avatars_get_short_aliases() {
        let mut mapper = AvatarAliasMapper::new();
        assert_eq!(mapper.alias_for(AVATAR), "t1");
        assert_eq!(mapper.alias_for("orders"), "orders");
        assert_eq!(mapper.alias_for(AVATAR), "t1");
    }

    #[test]
    fn plain_ids_never_collide_with_generated_aliases() {
        const OTHER: &str = "0c1e3f6a-8b2d-4f71-9a55-6d0e4c2b7a31";

        let mut mapper = AvatarAliasMapper::new();
        assert_eq!(mapper.alias_for("t1"), "t1");
        assert_eq!(mapper.alias_for(AVATAR), "t2");
        assert_eq!(mapper.alias_for("t1"), "t1");

        let mut mapper = AvatarAliasMapper::new();
        assert_eq!(mapper.alias_for(AVATAR), "t1");
        assert_eq!(mapper.alias_for("t1"), "t2");
        assert_eq!(mapper.alias_for(OTHER), "t3");
        assert_eq!(mapper.alias_for(AVATAR), "t1");
    }

    #[test]
    fn filters_are_split_into_where_and_having() {
        let mut query = table_query("qq");
        query.select.push(CompiledFormulaInfo::new(n::field("city")).with_alias("res_1"));
        query.group_by.push(CompiledFormulaInfo::new(n::field("city")).with_alias("res_1"));
        query.filters.push(CompiledFormulaInfo::new(n::binary(
            ">",
            n::func("sum", [n::field("sales")]),
            n::lit_int(10),
        )));
        query
            .filters
            .push(CompiledFormulaInfo::new(n::binary("==", n::field("city"), n::lit_str("Oslo"))));
        query.order_by.push(
            CompiledFormulaInfo::new(n::field("city"))
                .with_alias("res_1")
                .with_direction(OrderDirection::Desc),
        );

        let translated = MultiQueryTranslator::new(&registry(), DialectCombo::DUMMY)
            .translate(&CompiledMultiQuery::single(query))
            .expect("translated");
        let top = translated.top_query().expect("top query");
        assert_eq!(top.where_.len(), 1);
        assert_eq!(top.having.len(), 1);
        assert_eq!(top.select[0].data_type, DataType::String);
        assert_eq!(top.order_by[0].to_string(), "t1.\"city\" DESC");
        assert_eq!(
            top.root_from,
            TranslatedFrom::Table {
                source: "orders".to_string(),
                alias: "t1".to_string(),
            }
        );
    }

    #[test]
    fn sub_queries_are_inlined() {
        let mut sub = table_query("q1");
        sub.select.push(CompiledFormulaInfo::new(n::field("city")).with_alias("_cp1"));
        sub.group_by.push(CompiledFormulaInfo::new(n::field("city")).with_alias("_cp1"));

        let mut top = CompiledQuery::new("qq");
        top.select.push(CompiledFormulaInfo::new(n::field("_cp1")).with_alias("res_1"));
        top.joined_from = JoinedFrom {
            froms: vec![FromObject::Subquery {
                id: "q1".to_string(),
                alias: "q1".to_string(),
                query_id: "q1".to_string(),
                columns: vec!["_cp1".to_string()],
            }],
        };

        let multi = CompiledMultiQuery {
            queries: vec![sub, top],
        };
        let translated = MultiQueryTranslator::new(&registry(), DialectCombo::DUMMY)
            .translate(&multi)
            .expect("translated");
        assert_eq!(
            translated.to_sql().expect("sql"),
            "SELECT q1.\"_cp1\" AS \"res_1\" FROM (SELECT t1.\"city\" AS \"_cp1\" \
             FROM \"orders\" AS t1 GROUP BY t1.\"city\") AS q1"
        );
    }

    #[test]
    fn every_joined_from_needs_a_condition() {
        let mut query = table_query("qq");
        query.joined_from.froms.push(FromObject::Subquery {
            id: "q1".to_string(),
            alias: "q1".to_string(),
            query_id: "q1".to_string(),
            columns: Vec::new(),
        });
        query.select.push(CompiledFormulaInfo::new(n::field("city")));
        let mut sub = table_query("q1");
        sub.select.push(CompiledFormulaInfo::new(n::field("city")).with_alias("_cp1"));

        let multi = CompiledMultiQuery {
            queries: vec![sub.clone(), query.clone()],
        };
        let registry = registry();
        let translator = MultiQueryTranslator::new(&registry, DialectCombo::DUMMY);
        assert_eq!(
            translator.translate(&multi).map(|_| ()),
            Err(QueryError::MissingJoin("q1".to_string()))
        );

        query.join_on.push(CompiledFormulaInfo {
            join: Some(JoinSpec {
                left_id: AVATAR.to_string(),
                right_id: "q1".to_string(),
                join_type: JoinType::Left,
            }),
            ..CompiledFormulaInfo::new(n::lit_bool(true))
        });
        let multi = CompiledMultiQuery {
            queries: vec![sub, query],
        };
        let translated = translator.translate(&multi).expect("translated");
        let top = translated.top_query().expect("top query");
        assert_eq!(top.joins.len(), 1);
        assert_eq!(top.joins[0].join_type, JoinType::Left);
    }
}
