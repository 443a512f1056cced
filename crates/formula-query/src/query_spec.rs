//! Input description of a query.

use formula_core::{JoinType, NodeRef};
use serde::{Deserialize, Serialize};

use crate::primitives::QueryType;

fn default_join_type() -> JoinType {
    JoinType::Inner
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryItem {
    pub formula: NodeRef,
    /// Field the item was built for. Filters use it to match before-filter-by sets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl QueryItem {
    pub fn new(formula: NodeRef) -> Self {
        QueryItem {
            formula,
            field_id: None,
            alias: None,
        }
    }

    pub fn with_field_id(mut self, field_id: impl Into<String>) -> Self {
        self.field_id = Some(field_id.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

impl From<NodeRef> for QueryItem {
    fn from(formula: NodeRef) -> Self {
        QueryItem::new(formula)
    }
}

/// Condition joining the avatar `right_id` to `left_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOnItem {
    pub formula: NodeRef,
    pub left_id: String,
    pub right_id: String,
    #[serde(default = "default_join_type")]
    pub join_type: JoinType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    pub select: Vec<QueryItem>,
    pub group_by: Vec<QueryItem>,
    pub filters: Vec<QueryItem>,
    pub order_by: Vec<QueryItem>,
    pub join_on: Vec<JoinOnItem>,
    pub query_type: QueryType,
    /// Ordering window functions fall back to when they have none of their own.
    pub default_ordering: Vec<NodeRef>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, item: impl Into<QueryItem>) -> Self {
        self.select.push(item.into());
        self
    }

    pub fn group_by(mut self, item: impl Into<QueryItem>) -> Self {
        self.group_by.push(item.into());
        self
    }

    pub fn filter(mut self, item: impl Into<QueryItem>) -> Self {
        self.filters.push(item.into());
        self
    }

    pub fn order_by(mut self, item: impl Into<QueryItem>) -> Self {
        self.order_by.push(item.into());
        self
    }

    pub fn join_on(mut self, item: JoinOnItem) -> Self {
        self.join_on.push(item);
        self
    }

    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    pub fn with_default_ordering(mut self, ordering: impl IntoIterator<Item = NodeRef>) -> Self {
        self.default_ordering = ordering.into_iter().collect();
        self
    }
}
