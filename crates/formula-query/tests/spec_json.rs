use formula_core::shortcuts as n;
use formula_core::{DataType, DialectCombo};
use formula_query::{translate_query_spec, ColumnRegistry, CompilerSettings, QueryError, QuerySpec};
use pretty_assertions::assert_eq;

const REGISTRY: &str = r#"{
    "avatars": [{"id": "orders", "source": "public.orders"}],
    "columns": [
        {"field_id": "city", "avatar_id": "orders", "column": "city", "data_type": "STRING"},
        {"field_id": "sales", "avatar_id": "orders", "column": "amount", "data_type": "FLOAT"}
    ]
}"#;

const SPEC: &str = r#"{
    "select": [
        {"formula": {"kind": {"field": {"name": "city"}}}},
        {
            "formula": {"kind": {"func_call": {
                "name": "sum",
                "args": [{"kind": {"field": {"name": "sales"}}}]
            }}},
            "alias": "total"
        }
    ],
    "group_by": [{"formula": {"kind": {"field": {"name": "city"}}}}]
}"#;

#[test]
fn registry_and_spec_load_from_json() {
    let registry: ColumnRegistry = serde_json::from_str(REGISTRY).expect("registry");
    assert_eq!(
        registry.resolve("sales").map(|column| column.data_type),
        Ok(DataType::Float)
    );

    let spec: QuerySpec = serde_json::from_str(SPEC).expect("spec");
    assert_eq!(spec.select[1].formula, n::func("sum", [n::field("sales")]));
    assert_eq!(spec.select[1].alias.as_deref(), Some("total"));

    let translated =
        translate_query_spec(&spec, &registry, &CompilerSettings::default()).expect("translated");
    assert_eq!(
        translated.to_sql().expect("sql"),
        "SELECT orders.\"city\" AS \"res_1\", SUM(orders.\"amount\") AS \"total\" \
         FROM \"public.orders\" AS orders GROUP BY orders.\"city\""
    );
}

#[test]
fn duplicate_fields_are_rejected_while_loading() {
    let json = r#"{
        "avatars": [{"id": "orders", "source": "orders"}],
        "columns": [
            {"field_id": "city", "avatar_id": "orders", "column": "city", "data_type": "STRING"},
            {"field_id": "city", "avatar_id": "orders", "column": "town", "data_type": "STRING"}
        ]
    }"#;
    let err = serde_json::from_str::<ColumnRegistry>(json).expect_err("duplicate field");
    assert!(
        err.to_string()
            .contains(&QueryError::DuplicateField("city".to_string()).to_string()),
        "{err}"
    );
}

#[test]
fn settings_load_with_defaults() {
    let settings: CompilerSettings =
        serde_json::from_str(r#"{"dialect": "POSTGRESQL_9_4", "disable_optimizations": true}"#)
            .expect("settings");
    assert_eq!(settings.dialect, DialectCombo::POSTGRESQL_9_4);
    assert!(settings.disable_optimizations);
    assert!(!settings.allow_empty_dimensions);
}
