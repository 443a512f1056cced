//! Level-of-detail aggregations become query forks.

use formula_core::shortcuts as n;
use formula_core::{
    codes, FormulaError, FormulaItem, FuncCall, JoinCondition, JoinType, LodSpecifier, NodeKind,
    NodeRef, QueryFork,
};

use crate::inspect;
use crate::mutation::FormulaMutation;

pub const INVALID_TOPLEVEL_DIMENSIONS_MESSAGE: &str =
    "Invalid top-level LOD dimension found in expression";

fn is_subset(sub: &[NodeRef], sup: &[NodeRef]) -> bool {
    sub.iter().all(|dim| sup.contains(dim))
}

/// Whether `node` is the result expression of the fork directly above it.
fn is_fork_result(node: &NodeRef, parent_stack: &[NodeRef]) -> bool {
    parent_stack
        .last()
        .and_then(|parent| parent.query_fork())
        .is_some_and(|fork| fork.result_expr == *node)
}

/// Whether an aggregate directly inside another aggregation (not separated by a
/// fork) is being looked at.
fn inside_aggregation(parent_stack: &[NodeRef]) -> bool {
    parent_stack
        .iter()
        .rev()
        .take_while(|ancestor| ancestor.query_fork().is_none())
        .any(inspect::is_aggregate_function)
}

/// Wraps extended aggregations in a fork fixed at the dimensions the call is
/// evaluated at, joined to its context on the dimensions both share.
///
/// An aggregation is extended when it has its own level of detail or
/// before-filter-by set, or when it is nested in another aggregation. An
/// aggregation over an extended one is forked at its context dimensions so that
/// nothing is aggregated above a fork. Other plain aggregations stay in place
/// and are computed by the base sub-query.
pub struct ExtAggregationToQueryForkMutation {
    global_dimensions: Vec<NodeRef>,
}

impl ExtAggregationToQueryForkMutation {
    pub fn new(global_dimensions: Vec<NodeRef>) -> Self {
        ExtAggregationToQueryForkMutation { global_dimensions }
    }
}

impl FormulaMutation for ExtAggregationToQueryForkMutation {
    fn match_node(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> bool {
        let Some(call) = node.func_call().filter(|_| inspect::is_aggregate_function(node)) else {
            return false;
        };
        if is_fork_result(node, parent_stack) {
            return false;
        }
        !call.lod.is_inherited()
            || !call.before_filter_by.is_empty()
            || inside_aggregation(parent_stack)
            || call.args.iter().any(|arg| {
                inspect::contains_query_forks(arg) || inspect::contains_extended_aggregations(arg, true)
            })
    }

    fn make_replacement(&self, old: &NodeRef, parent_stack: &[NodeRef]) -> NodeRef {
        let Some(call) = old.func_call() else {
            return old.clone();
        };
        let parent_dimensions = inspect::context_dimensions(&self.global_dimensions, parent_stack);
        let fork_dimensions = inspect::resolve_dimensions(&parent_dimensions, &call.lod);

        if !is_subset(&parent_dimensions, &fork_dimensions)
            && !is_subset(&fork_dimensions, &parent_dimensions)
        {
            return n::error(
                format!("Incompatible dimensions in LOD expression {old}"),
                codes::LOD_INCOMPATIBLE_DIMENSIONS,
            );
        }

        let joining = fork_dimensions
            .iter()
            .filter(|dim| parent_dimensions.contains(dim))
            .map(|dim| JoinCondition::self_eq(dim.clone()))
            .collect();
        let result_expr = FormulaItem::with_meta(
            NodeKind::FuncCall(FuncCall {
                lod: LodSpecifier::Inherited,
                ..call.clone()
            }),
            old.meta.clone(),
        );
        FormulaItem::new(NodeKind::QueryFork(QueryFork {
            join_type: JoinType::Left,
            result_expr,
            joining,
            lod: LodSpecifier::Fixed(fork_dimensions),
            before_filter_by: call.before_filter_by.clone(),
            bfb_filter_mutations: Vec::new(),
        }))
    }
}

/// Top-level aggregations may only be evaluated at (a subset of) the query's
/// dimensions.
pub fn check_toplevel_dimensions(
    formula: &NodeRef,
    global_dimensions: &[NodeRef],
) -> Result<(), FormulaError> {
    let toplevel = inspect::toplevel_dimensions(formula, global_dimensions);
    if is_subset(&toplevel, global_dimensions) {
        Ok(())
    } else {
        Err(FormulaError::LodInvalidTopLevelDimensions(
            INVALID_TOPLEVEL_DIMENSIONS_MESSAGE.to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_mutations;
    use formula_core::BeforeFilterBy;
    use pretty_assertions::assert_eq;

    fn fork(result_expr: NodeRef, joining: Vec<NodeRef>, lod: Vec<NodeRef>) -> NodeRef {
        n::fork(
            JoinType::Left,
            result_expr,
            joining.into_iter().map(JoinCondition::self_eq).collect(),
            LodSpecifier::Fixed(lod),
        )
    }

    #[test]
    fn include_inside_plain_aggregation_is_forked() {
        let city = n::field("city");
        let category = n::field("category");
        let tree = n::func(
            "avg",
            [n::func_lod("sum", [n::field("sales")], n::include([city.clone()]))],
        );
        let mutation = ExtAggregationToQueryForkMutation::new(vec![category.clone()]);

        let inner = fork(
            n::func("sum", [n::field("sales")]),
            vec![category.clone()],
            vec![category.clone(), city],
        );
        let outer = fork(
            n::func("avg", [inner]),
            vec![category.clone()],
            vec![category],
        );
        assert_eq!(apply_mutations(&tree, &[&mutation]), outer);
    }

    #[test]
    fn double_aggregation_forks_the_inner_call() {
        let category = n::field("category");
        let tree = n::func("max", [n::func("sum", [n::field("sales")])]);
        let mutation = ExtAggregationToQueryForkMutation::new(vec![category.clone()]);
        let inner = fork(
            n::func("sum", [n::field("sales")]),
            vec![category.clone()],
            vec![category.clone()],
        );
        let expected = fork(n::func("max", [inner]), vec![category.clone()], vec![category]);
        assert_eq!(apply_mutations(&tree, &[&mutation]), expected);
    }

    #[test]
    fn plain_aggregations_stay_in_place() {
        let tree = n::binary("+", n::func("sum", [n::field("x")]), n::lit_int(1));
        let mutation = ExtAggregationToQueryForkMutation::new(vec![n::field("d")]);
        assert_eq!(apply_mutations(&tree, &[&mutation]), tree);
    }

    #[test]
    fn forking_is_stable() {
        let tree = n::func_bfb("sum", [n::field("x")], ["d"]);
        let mutation = ExtAggregationToQueryForkMutation::new(vec![n::field("d")]);
        let once = apply_mutations(&tree, &[&mutation]);
        assert_eq!(apply_mutations(&once, &[&mutation]), once);
        assert_eq!(
            once.query_fork().map(|fork| fork.before_filter_by.clone()),
            Some(BeforeFilterBy::new(["d"]))
        );
    }

    #[test]
    fn fixed_lod_outside_query_dimensions_is_rejected() {
        let tree = n::func_lod("sum", [n::field("sales")], n::fixed([n::field("category")]));
        assert_eq!(
            check_toplevel_dimensions(&tree, &[n::field("city")])
                .map_err(|err| err.to_string()),
            Err(INVALID_TOPLEVEL_DIMENSIONS_MESSAGE.to_string())
        );
        let exclude = n::func_lod("sum", [n::field("sales")], n::exclude([n::field("city")]));
        assert!(check_toplevel_dimensions(&exclude, &[n::field("city")]).is_ok());
    }
}
