use formula_core::shortcuts as n;
use formula_core::{codes, DataType, JoinType, NodeRef};
use formula_query::{
    compile_multi_query, process_compiled_query, translate_query_spec, ColumnRegistry,
    CompiledMultiQuery, CompilerSettings, QueryCompiler, QueryError, QueryItem, QuerySpec,
    QueryType,
};
use pretty_assertions::assert_eq;

fn registry() -> ColumnRegistry {
    let mut registry = ColumnRegistry::new();
    registry.add_avatar("orders", "orders").expect("avatar");
    registry
        .with_column("city", "orders", "city", DataType::String)
        .and_then(|r| r.with_column("category", "orders", "category", DataType::String))
        .and_then(|r| r.with_column("order_date", "orders", "order_date", DataType::Date))
        .and_then(|r| r.with_column("sales", "orders", "sales", DataType::Float))
        .expect("columns")
}

fn sum_sales() -> NodeRef {
    n::func("sum", [n::field("sales")])
}

fn compile(spec: &QuerySpec) -> Result<CompiledMultiQuery, QueryError> {
    compile_multi_query(spec, &registry(), &CompilerSettings::default())
}

fn error_codes(err: &QueryError) -> Vec<String> {
    err.formula_errors()
        .iter()
        .map(|err| err.code().to_string())
        .collect()
}

/// Running the mutation pipeline again over a compiled query changes nothing.
fn assert_recompiling_is_stable(spec: &QuerySpec) {
    let registry = registry();
    let settings = CompilerSettings::default();
    let compiled = QueryCompiler::new(&registry, settings.clone())
        .compile(spec)
        .expect("compiled");
    assert!(compiled.contains_query_forks());
    let again = process_compiled_query(compiled.clone(), &settings, &spec.default_ordering)
        .expect("processed again");
    assert_eq!(again, compiled);
}

#[test]
fn flat_query_renders_as_one_statement() {
    let spec = QuerySpec::new()
        .select(n::field("city"))
        .select(sum_sales())
        .group_by(n::field("city"))
        .filter(n::binary(">", n::field("sales"), n::lit_int(0)))
        .order_by(n::desc(sum_sales()));
    let translated =
        translate_query_spec(&spec, &registry(), &CompilerSettings::default()).expect("translated");
    assert_eq!(translated.queries.len(), 1);
    assert_eq!(
        translated.to_sql().expect("sql"),
        "SELECT orders.\"city\" AS \"res_1\", SUM(orders.\"sales\") AS \"res_2\" \
         FROM \"orders\" AS orders WHERE orders.\"sales\" > 0 GROUP BY orders.\"city\" \
         ORDER BY SUM(orders.\"sales\") DESC"
    );
}

#[test]
fn fixed_lod_outside_query_dimensions_is_rejected() {
    let spec = QuerySpec::new()
        .select(n::field("city"))
        .select(n::func_lod("sum", [n::field("sales")], n::fixed([n::field("category")])))
        .group_by(n::field("city"));
    let err = compile(&spec).expect_err("fixed dimensions do not cover the query");
    assert_eq!(
        error_codes(&err),
        vec![codes::LOD_INVALID_TOPLEVEL_DIMENSIONS.to_string()]
    );

    // Without the early check the mismatch surfaces when the aggregation is forked.
    let settings = CompilerSettings::default().with_arbitrary_toplevel_lod_dimensions(true);
    let err = compile_multi_query(&spec, &registry(), &settings).expect_err("incompatible dimensions");
    assert_eq!(
        error_codes(&err),
        vec![codes::LOD_INCOMPATIBLE_DIMENSIONS.to_string()]
    );
}

#[test]
fn totals_replace_extended_aggregations_with_null() {
    let spec = QuerySpec::new()
        .select(sum_sales())
        .select(n::func(
            "avg",
            [n::func_lod("sum", [n::field("sales")], n::include([n::field("city")]))],
        ))
        .with_query_type(QueryType::Totals);
    let multi = compile(&spec).expect("compiled");
    assert_eq!(multi.len(), 1);
    let top = multi.top_query().expect("top query");
    assert_eq!(top.select[0].formula, sum_sales());
    assert_eq!(top.select[1].formula, n::lit_null());
}

#[test]
fn constants_fold_unless_optimizations_are_disabled() {
    let spec = QuerySpec::new()
        .select(n::field("city"))
        .select(n::binary("+", n::lit_int(1), n::lit_int(2)))
        .group_by(n::field("city"))
        .filter(n::binary("==", n::lit_str("a"), n::lit_str("a")));

    let multi = compile(&spec).expect("compiled");
    let top = multi.top_query().expect("top query");
    assert_eq!(top.select[1].formula, n::lit_int(3));
    assert!(top.filters.is_empty());

    let settings = CompilerSettings::default().with_disabled_optimizations(true);
    let multi = compile_multi_query(&spec, &registry(), &settings).expect("compiled");
    let top = multi.top_query().expect("top query");
    assert_eq!(top.select[1].formula, n::binary("+", n::lit_int(1), n::lit_int(2)));
    assert_eq!(top.filters.len(), 1);
}

#[test]
fn include_inside_aggregation_is_computed_in_nested_sub_queries() {
    let spec = QuerySpec::new()
        .select(n::field("category"))
        .select(n::func(
            "avg",
            [n::func_lod("sum", [n::field("sales")], n::include([n::field("city")]))],
        ))
        .group_by(n::field("category"));
    let multi = compile(&spec).expect("compiled");
    // City-level sums, their category base, the category averages and the top query.
    assert_eq!(multi.len(), 4);
    assert!(multi.queries.iter().all(|query| !query.contains_query_forks()));

    let top = multi.top_query().expect("top query");
    assert_eq!(top.id, "qq");
    assert!(top.group_by.is_empty());

    let translated =
        translate_query_spec(&spec, &registry(), &CompilerSettings::default()).expect("translated");
    let sql = translated.to_sql().expect("sql");
    assert_eq!(sql.matches("GROUP BY").count(), 3, "{sql}");
    assert!(sql.contains("AVG("), "{sql}");
}

#[test]
fn lookups_are_joined_on_the_shifted_date() {
    let spec = QuerySpec::new()
        .select(n::field("order_date"))
        .select(sum_sales())
        .select(n::func(
            "ago",
            [sum_sales(), n::field("order_date"), n::lit_str("year")],
        ))
        .group_by(n::field("order_date"));
    let multi = compile(&spec).expect("compiled");
    assert_eq!(multi.len(), 3);

    let top = multi.top_query().expect("top query");
    assert_eq!(top.join_on.len(), 1);
    let join = top.join_on[0].join.clone().expect("join spec");
    assert_eq!(join.join_type, JoinType::Left);
    assert_eq!(join.left_id, top.joined_from.froms[0].id());
    assert!(
        top.join_on[0].formula.to_string().contains("_dneq"),
        "{}",
        top.join_on[0].formula
    );

    let translated =
        translate_query_spec(&spec, &registry(), &CompilerSettings::default()).expect("translated");
    let sql = translated.to_sql().expect("sql");
    assert!(sql.contains(" LEFT JOIN ("), "{sql}");
    assert!(sql.contains("IS NULL"), "{sql}");
}

#[test]
fn running_totals_use_the_default_ordering() {
    let spec = QuerySpec::new()
        .select(n::field("city"))
        .select(n::wfunc("rsum", [sum_sales()]))
        .group_by(n::field("city"))
        .with_default_ordering([n::asc(n::field("city"))]);
    let multi = compile(&spec).expect("compiled");
    // The window is computed next to the grouped rows; the top query only reads them.
    assert_eq!(multi.len(), 2);
    assert!(multi.top_query().expect("top query").group_by.is_empty());

    let translated =
        translate_query_spec(&spec, &registry(), &CompilerSettings::default()).expect("translated");
    let sql = translated.to_sql().expect("sql");
    assert!(sql.contains("OVER (ORDER BY orders.\"city\" ASC"), "{sql}");
}

#[test]
fn unknown_fields_are_reported_by_code() {
    let spec = QuerySpec::new().select(n::func("sum", [n::field("profit")]));
    let err = compile(&spec).expect_err("unknown field");
    assert_eq!(error_codes(&err), vec![codes::UNKNOWN_FIELD.to_string()]);
}

#[test]
fn include_lod_query_is_stable_under_reprocessing() {
    let spec = QuerySpec::new()
        .select(n::field("category"))
        .select(n::func(
            "avg",
            [n::func_lod("sum", [n::field("sales")], n::include([n::field("city")]))],
        ))
        .group_by(n::field("category"));
    assert_recompiling_is_stable(&spec);
}

#[test]
fn lookup_query_is_stable_under_reprocessing() {
    let spec = QuerySpec::new()
        .select(n::field("order_date"))
        .select(n::func(
            "ago",
            [sum_sales(), n::field("order_date"), n::lit_str("year")],
        ))
        .group_by(n::field("order_date"));
    assert_recompiling_is_stable(&spec);
}

#[test]
fn before_filter_by_aggregate_is_stable_under_reprocessing() {
    let spec = QuerySpec::new()
        .select(n::field("category"))
        .select(n::func_bfb("sum", [n::field("sales")], ["city"]))
        .group_by(n::field("category"))
        .filter(
            QueryItem::new(n::binary("==", n::field("city"), n::lit_str("Moscow")))
                .with_field_id("city"),
        );
    assert_recompiling_is_stable(&spec);
}
