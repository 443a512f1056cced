//! Data source columns visible to formulas.
//!
//! Every field a formula can reference maps to one column of one avatar (an
//! instance of a data source in the query's FROM clause).

use std::collections::BTreeMap;

use formula_core::{DataType, DataTypeParams, FormulaError};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarInfo {
    pub id: String,
    /// Table (or other relation) name the avatar reads from.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub field_id: String,
    pub avatar_id: String,
    pub column: String,
    pub data_type: DataType,
    #[serde(default)]
    pub params: DataTypeParams,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySource {
    #[serde(default)]
    avatars: Vec<AvatarInfo>,
    #[serde(default)]
    columns: Vec<ColumnInfo>,
}

/// Avatars and field columns, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RegistrySource", into = "RegistrySource")]
pub struct ColumnRegistry {
    avatars: Vec<AvatarInfo>,
    columns: BTreeMap<String, ColumnInfo>,
    column_order: Vec<String>,
}

impl ColumnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_avatar(
        &mut self,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), QueryError> {
        let id = id.into();
        if self.avatar(&id).is_some() {
            return Err(QueryError::DuplicateAvatar(id));
        }
        self.avatars.push(AvatarInfo {
            id,
            source: source.into(),
        });
        Ok(())
    }

    pub fn add_column(&mut self, info: ColumnInfo) -> Result<(), QueryError> {
        if self.avatar(&info.avatar_id).is_none() {
            return Err(QueryError::UnknownAvatar(info.avatar_id));
        }
        if self.columns.contains_key(&info.field_id) {
            return Err(QueryError::DuplicateField(info.field_id));
        }
        self.column_order.push(info.field_id.clone());
        self.columns.insert(info.field_id.clone(), info);
        Ok(())
    }

    /// Shorthand for a column without type parameters.
    pub fn with_column(
        mut self,
        field_id: &str,
        avatar_id: &str,
        column: &str,
        data_type: DataType,
    ) -> Result<Self, QueryError> {
        self.add_column(ColumnInfo {
            field_id: field_id.to_string(),
            avatar_id: avatar_id.to_string(),
            column: column.to_string(),
            data_type,
            params: DataTypeParams::default(),
        })?;
        Ok(self)
    }

    pub fn resolve(&self, field_id: &str) -> Result<&ColumnInfo, FormulaError> {
        self.columns
            .get(field_id)
            .ok_or_else(|| FormulaError::UnknownField(field_id.to_string()))
    }

    pub fn avatar(&self, id: &str) -> Option<&AvatarInfo> {
        self.avatars.iter().find(|avatar| avatar.id == id)
    }

    pub fn avatars(&self) -> &[AvatarInfo] {
        &self.avatars
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.column_order
            .iter()
            .filter_map(|field_id| self.columns.get(field_id))
    }

    pub fn columns_of<'a>(&'a self, avatar_id: &'a str) -> impl Iterator<Item = &'a ColumnInfo> {
        self.columns().filter(move |info| info.avatar_id == avatar_id)
    }
}

impl TryFrom<RegistrySource> for ColumnRegistry {
    type Error = QueryError;

    fn try_from(source: RegistrySource) -> Result<Self, Self::Error> {
        let mut registry = ColumnRegistry::new();
        for avatar in source.avatars {
            registry.add_avatar(avatar.id, avatar.source)?;
        }
        for column in source.columns {
            registry.add_column(column)?;
        }
        Ok(registry)
    }
}

impl From<ColumnRegistry> for RegistrySource {
    fn from(registry: ColumnRegistry) -> Self {
        let columns = registry.columns().cloned().collect();
        RegistrySource {
            avatars: registry.avatars,
            columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn columns_must_belong_to_known_avatars() {
        let mut registry = ColumnRegistry::new();
        registry.add_avatar("orders", "public.orders").expect("new avatar");
        assert_eq!(
            registry.add_avatar("orders", "other"),
            Err(QueryError::DuplicateAvatar("orders".to_string()))
        );
        let err = registry
            .clone()
            .with_column("sales", "customers", "sales", DataType::Float)
            .unwrap_err();
        assert_eq!(err, QueryError::UnknownAvatar("customers".to_string()));

        let registry = registry
            .with_column("sales", "orders", "amount", DataType::Float)
            .expect("column");
        assert_eq!(registry.resolve("sales").map(|c| c.column.as_str()), Ok("amount"));
        assert_eq!(
            registry.resolve("profit").map(|c| c.column.clone()),
            Err(FormulaError::UnknownField("profit".to_string()))
        );
    }

    #[test]
    fn deserializes_and_validates() {
        let registry: ColumnRegistry = serde_json::from_str(
            r#"{
                "avatars": [{"id": "orders", "source": "orders"}],
                "columns": [
                    {"field_id": "sales", "avatar_id": "orders", "column": "sales", "data_type": "FLOAT"},
                    {"field_id": "city", "avatar_id": "orders", "column": "city", "data_type": "STRING"}
                ]
            }"#,
        )
        .expect("valid registry");
        let names: Vec<_> = registry.columns_of("orders").map(|c| c.field_id.as_str()).collect();
        assert_eq!(names, vec!["sales", "city"]);

        let duplicate = serde_json::from_str::<ColumnRegistry>(
            r#"{"avatars": [{"id": "a", "source": "t"}, {"id": "a", "source": "t"}]}"#,
        );
        assert!(duplicate.is_err());
    }
}
