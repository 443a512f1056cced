use formula_core::shortcuts as n;
use formula_core::{codes, DataType, DataTypeParams, DialectCombo, FormulaError};
use formula_engine::registry::{self, Category};
use formula_engine::{translate, TranslationEnv};
use pretty_assertions::assert_eq;

fn env(dialect: DialectCombo) -> TranslationEnv {
    TranslationEnv::new(dialect)
        .with_field("arr", DataType::ArrayInt)
        .with_field("name", DataType::String)
        .with_field("sales", DataType::Float)
        .with_field("order_date", DataType::Date)
        .with_field("qty", DataType::Integer)
}

fn sql(node: &formula_core::NodeRef, dialect: DialectCombo) -> Result<String, FormulaError> {
    translate(node, &env(dialect)).map(|ctx| ctx.expression.to_string())
}

#[test]
fn every_definition_has_a_fallback_translation() {
    for spec in registry::iter_function_specs() {
        assert!(
            spec.select_variant(DialectCombo::DUMMY).is_some(),
            "{} has no DUMMY translation",
            spec.name
        );
        assert!(!spec.variants.is_empty(), "{} has no variants", spec.name);
    }
}

#[test]
fn aggregate_and_lookup_categories_are_known() {
    assert!(registry::is_aggregate_function("SUM"));
    assert!(registry::is_aggregate_function("countd"));
    assert!(!registry::is_aggregate_function("rsum"));
    assert!(registry::is_lookup_function("ago"));
    assert!(registry::uses_default_ordering("rsum"));
    assert!(!registry::uses_default_ordering("sum"));
    assert!(registry::lookup_definitions("sum", false)
        .iter()
        .all(|spec| spec.category == Category::Aggregation));
}

#[test]
fn contains_dispatches_on_argument_types() {
    let on_array = n::func("contains", [n::field("arr"), n::lit_int(3)]);
    assert_eq!(
        sql(&on_array, DialectCombo::POSTGRESQL_9_4),
        Ok("3 = ANY(\"arr\")".to_string())
    );
    assert_eq!(
        sql(&on_array, DialectCombo::CLICKHOUSE_22_10),
        Ok("has(\"arr\", 3)".to_string())
    );

    let on_string = n::func("contains", [n::field("name"), n::lit_str("x")]);
    let rendered = sql(&on_string, DialectCombo::POSTGRESQL_9_4).expect("string contains");
    assert!(rendered.starts_with("\"name\" LIKE"), "{rendered}");

    let mismatched = n::func("contains", [n::field("arr"), n::lit_str("x")]);
    assert_eq!(
        sql(&mismatched, DialectCombo::POSTGRESQL_9_4).map_err(|err| err.code().to_string()),
        Err(codes::TRANSLATION_NOT_FOUND.to_string())
    );
}

#[test]
fn dialect_specific_variant_beats_fallback() {
    let node = n::func("dateadd", [n::field("order_date"), n::lit_str("month"), n::lit_int(2)]);
    assert_eq!(
        sql(&node, DialectCombo::CLICKHOUSE_21_8),
        Ok("addMonths(\"order_date\", 2)".to_string())
    );
    assert_eq!(
        sql(&node, DialectCombo::SQLITE),
        Ok("(\"order_date\" + 2 * INTERVAL '1 month')".to_string())
    );
}

#[test]
fn resolution_errors() {
    assert_eq!(
        sql(&n::func("no_such_function", [n::lit_int(1)]), DialectCombo::DUMMY)
            .map_err(|err| err.code().to_string()),
        Err(codes::UNKNOWN_FUNCTION.to_string())
    );
    assert_eq!(
        sql(&n::func("sum", [n::field("sales"), n::field("sales")]), DialectCombo::DUMMY)
            .map_err(|err| err.code().to_string()),
        Err(codes::ARG_COUNT.to_string())
    );
    assert_eq!(
        sql(&n::field("missing"), DialectCombo::DUMMY).map_err(|err| err.code().to_string()),
        Err(codes::UNKNOWN_FIELD.to_string())
    );
}

#[test]
fn aggregates_are_never_constant() {
    let ctx = translate(&n::func("sum", [n::lit_int(1)]), &env(DialectCombo::DUMMY))
        .expect("translated");
    assert_eq!(ctx.data_type, DataType::Integer);

    let ctx = translate(&n::binary("+", n::lit_int(1), n::lit_int(2)), &env(DialectCombo::DUMMY))
        .expect("translated");
    assert!(ctx.data_type.is_const());
}

#[test]
fn array_constructor_prefers_constant_overloads() {
    let dialect = DialectCombo::POSTGRESQL_9_4;
    let consts = translate(&n::func("array", [n::lit_int(1), n::lit_int(2)]), &env(dialect))
        .expect("const int array");
    assert_eq!(consts.data_type, DataType::ConstArrayInt);
    assert_eq!(consts.expression.to_string(), "ARRAY[1, 2]");

    let with_null = translate(&n::func("array", [n::lit_str("a"), n::lit_null()]), &env(dialect))
        .expect("const string array");
    assert_eq!(with_null.data_type, DataType::ConstArrayStr);

    let floats = translate(&n::func("array", [n::lit_float(0.5), n::lit_int(1)]), &env(dialect))
        .expect("const float array");
    assert_eq!(floats.data_type, DataType::ConstArrayFloat);

    let columns = translate(&n::func("array", [n::field("qty"), n::lit_int(2)]), &env(dialect))
        .expect("int array");
    assert_eq!(columns.data_type, DataType::ArrayInt);
    assert_eq!(columns.expression.to_string(), "ARRAY[\"qty\", 2]");
    assert_eq!(
        sql(&n::func("array", [n::field("qty")]), DialectCombo::CLICKHOUSE_21_8),
        Ok("array(\"qty\")".to_string())
    );

    let nulls = n::func("array", [n::lit_null(), n::lit_null()]);
    assert_eq!(
        sql(&nulls, dialect).map_err(|err| err.code().to_string()),
        Err(codes::TRANSLATION_NOT_FOUND.to_string())
    );
}

#[test]
fn timezone_follows_datetime_results() {
    let moscow = DataTypeParams::with_timezone("Europe/Moscow");
    let env = env(DialectCombo::POSTGRESQL_9_4).with_field_params("ts", DataType::Datetimetz, moscow.clone());

    let truncated = translate(&n::func("datetrunc", [n::field("ts"), n::lit_str("day")]), &env)
        .expect("datetrunc");
    assert_eq!(truncated.data_type, DataType::Datetimetz);
    assert_eq!(truncated.params, moscow);
    assert_eq!(truncated.expression.to_string(), "DATE_TRUNC('day', \"ts\")");

    let earliest = translate(&n::func("min", [n::field("ts")]), &env).expect("min");
    assert_eq!(earliest.params, moscow);

    let total = translate(&n::func("sum", [n::field("qty")]), &env).expect("sum");
    assert_eq!(total.params, DataTypeParams::default());
}
