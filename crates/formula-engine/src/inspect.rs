//! Read-only queries over formula trees.

use std::collections::BTreeSet;

use formula_core::{LodSpecifier, NodeKind, NodeRef};

use crate::registry;

/// Aggregate function call (not a window call).
pub fn is_aggregate_function(node: &NodeRef) -> bool {
    node.func_call()
        .is_some_and(|call| registry::is_aggregate_function(&call.name))
}

pub fn is_lookup_function(node: &NodeRef) -> bool {
    node.func_call()
        .is_some_and(|call| registry::is_lookup_function(&call.name))
}

/// `true` for nodes that produce one value per group: aggregate calls, window calls
/// and query forks, or any expression with one of those among its autonomous
/// descendants.
pub fn is_aggregate_expression(node: &NodeRef) -> bool {
    match &node.kind {
        NodeKind::WindowFuncCall(_) | NodeKind::QueryFork(_) => true,
        NodeKind::FuncCall(call) if registry::is_aggregate_function(&call.name) => true,
        _ => node
            .autonomous_children()
            .iter()
            .any(is_aggregate_expression),
    }
}

fn any_node(node: &NodeRef, predicate: &mut dyn FnMut(&NodeRef) -> bool) -> bool {
    if predicate(node) {
        return true;
    }
    node.children().iter().any(|child| any_node(child, predicate))
}

pub fn contains_node(node: &NodeRef, target: &NodeRef) -> bool {
    any_node(node, &mut |candidate| candidate == target)
}

pub fn contains_lookup_functions(node: &NodeRef) -> bool {
    any_node(node, &mut is_lookup_function)
}

pub fn is_window_expression(node: &NodeRef) -> bool {
    any_node(node, &mut |candidate| candidate.window_call().is_some())
}

pub fn contains_query_forks(node: &NodeRef) -> bool {
    any_node(node, &mut |candidate| candidate.query_fork().is_some())
}

/// Aggregations with their own level of detail or before-filter-by set, and
/// (optionally) aggregations nested in other aggregations.
pub fn contains_extended_aggregations(node: &NodeRef, include_double_agg: bool) -> bool {
    fn visit(node: &NodeRef, inside_aggregation: bool, include_double_agg: bool) -> bool {
        let is_agg = is_aggregate_function(node);
        if is_agg {
            let Some(call) = node.func_call() else {
                return false;
            };
            if !call.lod.is_inherited()
                || !call.before_filter_by.is_empty()
                || (include_double_agg && inside_aggregation)
            {
                return true;
            }
        }
        node.autonomous_children()
            .iter()
            .any(|child| visit(child, inside_aggregation || is_agg, include_double_agg))
    }
    visit(node, false, include_double_agg)
}

/// No field references and nothing that is evaluated per group.
pub fn is_constant_expression(node: &NodeRef) -> bool {
    !any_node(node, &mut |candidate| {
        matches!(
            candidate.kind,
            NodeKind::Field { .. }
                | NodeKind::WindowFuncCall(_)
                | NodeKind::QueryFork(_)
                | NodeKind::Error { .. }
        ) || is_aggregate_function(candidate)
    })
}

/// Field nodes in order of first appearance.
pub fn used_fields(node: &NodeRef) -> Vec<NodeRef> {
    let mut result: Vec<NodeRef> = Vec::new();
    node.walk(&mut |candidate| {
        if candidate.field_name().is_some() && !result.contains(candidate) {
            result.push(candidate.clone());
        }
    });
    result
}

pub fn used_field_names(node: &NodeRef) -> BTreeSet<String> {
    used_fields(node)
        .iter()
        .filter_map(|field| field.field_name().map(str::to_string))
        .collect()
}

/// Whether every field used by `node` is one of `dimensions` (or inside one).
pub fn is_bound_only_to(node: &NodeRef, dimensions: &[NodeRef]) -> bool {
    if dimensions.contains(node) {
        return true;
    }
    match &node.kind {
        NodeKind::Field { .. } => false,
        _ => node
            .children()
            .iter()
            .all(|child| is_bound_only_to(child, dimensions)),
    }
}

/// Fork created around a window call (possibly wrapped in a tagged parenthesis).
pub fn qfork_is_window(node: &NodeRef) -> bool {
    let Some(fork) = node.query_fork() else {
        return false;
    };
    let mut expr = &fork.result_expr;
    while let NodeKind::Parenthesized(inner) = &expr.kind {
        expr = inner;
    }
    expr.window_call().is_some()
}

fn push_unique(target: &mut Vec<NodeRef>, node: &NodeRef) {
    if !target.contains(node) {
        target.push(node.clone());
    }
}

/// Dimensions an expression with `lod` is evaluated at, given the dimensions of
/// its context.
pub fn resolve_dimensions(parent: &[NodeRef], lod: &LodSpecifier) -> Vec<NodeRef> {
    match lod {
        LodSpecifier::Inherited | LodSpecifier::DefaultAggregation => parent.to_vec(),
        LodSpecifier::Fixed(dims) => {
            let mut result = Vec::with_capacity(dims.len());
            for dim in dims {
                push_unique(&mut result, dim);
            }
            result
        }
        LodSpecifier::Include(dims) => {
            let mut result = parent.to_vec();
            for dim in dims {
                push_unique(&mut result, dim);
            }
            result
        }
        LodSpecifier::Exclude(dims) => parent
            .iter()
            .filter(|dim| !dims.contains(dim))
            .cloned()
            .collect(),
    }
}

/// Dimensions of the context `parent_stack` (outermost first) puts a node in.
///
/// Aggregate calls and query forks among the ancestors each narrow or widen the
/// inherited set according to their level of detail.
pub fn context_dimensions(global: &[NodeRef], parent_stack: &[NodeRef]) -> Vec<NodeRef> {
    let mut dims = global.to_vec();
    for ancestor in parent_stack {
        if let Some(fork) = ancestor.query_fork() {
            dims = resolve_dimensions(&dims, &fork.lod);
        } else if is_aggregate_function(ancestor) {
            if let Some(call) = ancestor.func_call() {
                dims = resolve_dimensions(&dims, &call.lod);
            }
        }
    }
    dims
}

/// Union of the dimensions of all top-level aggregations (those not nested in other
/// aggregations) in `node`.
pub fn toplevel_dimensions(node: &NodeRef, global: &[NodeRef]) -> Vec<NodeRef> {
    fn visit(node: &NodeRef, global: &[NodeRef], result: &mut Vec<NodeRef>) {
        if let Some(call) = node.func_call().filter(|_| is_aggregate_function(node)) {
            for dim in resolve_dimensions(global, &call.lod) {
                push_unique(result, &dim);
            }
            return;
        }
        if let Some(fork) = node.query_fork() {
            for dim in resolve_dimensions(global, &fork.lod) {
                push_unique(result, &dim);
            }
            return;
        }
        for child in node.autonomous_children() {
            visit(&child, global, result);
        }
    }
    let mut result = Vec::new();
    visit(node, global, &mut result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::shortcuts as n;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregate_expression_detection() {
        assert!(is_aggregate_expression(&n::binary(
            "*",
            n::func("sum", [n::field("sales")]),
            n::lit_int(2)
        )));
        assert!(!is_aggregate_expression(&n::func("upper", [n::field("city")])));
        assert!(is_aggregate_expression(&n::wfunc("rank", [n::field("x")])));
    }

    #[test]
    fn extended_aggregations() {
        let lod = n::func_lod("sum", [n::field("sales")], n::include([n::field("city")]));
        assert!(contains_extended_aggregations(&lod, false));

        let double = n::func("avg", [n::func("sum", [n::field("sales")])]);
        assert!(!contains_extended_aggregations(&double, false));
        assert!(contains_extended_aggregations(&double, true));
    }

    #[test]
    fn constant_expressions() {
        assert!(is_constant_expression(&n::binary("+", n::lit_int(1), n::lit_int(2))));
        assert!(!is_constant_expression(&n::field("a")));
        assert!(!is_constant_expression(&n::func("count", [])));
    }

    #[test]
    fn dimension_resolution() {
        let global = vec![n::field("city"), n::field("category")];
        assert_eq!(
            resolve_dimensions(&global, &n::exclude([n::field("city")])),
            vec![n::field("category")]
        );
        assert_eq!(
            resolve_dimensions(&global, &n::include([n::field("date"), n::field("city")])),
            vec![n::field("city"), n::field("category"), n::field("date")]
        );

        let outer = n::func_lod("avg", [n::field("x")], n::fixed([n::field("date")]));
        assert_eq!(
            context_dimensions(&global, &[outer]),
            vec![n::field("date")]
        );
    }

    #[test]
    fn toplevel_dimensions_skip_nested_aggregations() {
        let node = n::func(
            "avg",
            [n::func_lod("sum", [n::field("x")], n::include([n::field("city")]))],
        );
        assert_eq!(toplevel_dimensions(&node, &[]), Vec::<NodeRef>::new());

        let fixed = n::func_lod("sum", [n::field("x")], n::fixed([n::field("category")]));
        assert_eq!(
            toplevel_dimensions(&fixed, &[n::field("city")]),
            vec![n::field("category")]
        );
    }

    #[test]
    fn used_fields_are_unique() {
        let node = n::binary("+", n::field("a"), n::func("sum", [n::field("a")]));
        assert_eq!(used_fields(&node), vec![n::field("a")]);
    }
}
