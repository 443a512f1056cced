//! Window function normalization and forking.

use formula_core::{
    FormulaItem, JoinCondition, JoinType, LodSpecifier, NodeKind, NodeRef, QueryFork,
    WindowFuncCall, WindowGrouping,
};

use crate::inspect;
use crate::mutation::FormulaMutation;
use crate::registry;

fn rebuild(old: &NodeRef, call: WindowFuncCall) -> NodeRef {
    FormulaItem::with_meta(NodeKind::WindowFuncCall(call), old.meta.clone())
}

fn unwrap_ordered(node: &NodeRef) -> &NodeRef {
    match &node.kind {
        NodeKind::Ordered { expr, .. } => expr,
        _ => node,
    }
}

/// Appends the query's default ordering to window calls that depend on row order.
pub struct DefaultWindowOrderingMutation {
    default_ordering: Vec<NodeRef>,
}

impl DefaultWindowOrderingMutation {
    pub fn new(default_ordering: Vec<NodeRef>) -> Self {
        DefaultWindowOrderingMutation { default_ordering }
    }

    fn missing<'a>(&'a self, call: &'a WindowFuncCall) -> impl Iterator<Item = &'a NodeRef> + 'a {
        self.default_ordering.iter().filter(move |item| {
            !call
                .ordering
                .iter()
                .any(|existing| unwrap_ordered(existing) == unwrap_ordered(item))
        })
    }
}

impl FormulaMutation for DefaultWindowOrderingMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        node.window_call().is_some_and(|call| {
            registry::uses_default_ordering(&call.name) && self.missing(call).next().is_some()
        })
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let Some(call) = old.window_call() else {
            return old.clone();
        };
        let mut ordering = call.ordering.clone();
        ordering.extend(self.missing(call).cloned());
        rebuild(
            old,
            WindowFuncCall {
                ordering,
                ..call.clone()
            },
        )
    }
}

/// `AMONG` dimensions are the complement of `WITHIN` ones in the query's dimensions.
pub struct AmongToWithinGroupingMutation {
    global_dimensions: Vec<NodeRef>,
}

impl AmongToWithinGroupingMutation {
    pub fn new(global_dimensions: Vec<NodeRef>) -> Self {
        AmongToWithinGroupingMutation { global_dimensions }
    }
}

impl FormulaMutation for AmongToWithinGroupingMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        node.window_call()
            .is_some_and(|call| matches!(call.grouping, WindowGrouping::Among(_)))
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let Some(call) = old.window_call() else {
            return old.clone();
        };
        let among = call.grouping.dims();
        let within = self
            .global_dimensions
            .iter()
            .filter(|dim| !among.contains(dim))
            .cloned()
            .collect();
        rebuild(
            old,
            WindowFuncCall {
                grouping: WindowGrouping::Within(within),
                ..call.clone()
            },
        )
    }
}

/// Drops `WITHIN` dimensions that are not dimensions of the query.
pub struct IgnoreExtraWithinGroupingMutation {
    global_dimensions: Vec<NodeRef>,
}

impl IgnoreExtraWithinGroupingMutation {
    pub fn new(global_dimensions: Vec<NodeRef>) -> Self {
        IgnoreExtraWithinGroupingMutation { global_dimensions }
    }
}

impl FormulaMutation for IgnoreExtraWithinGroupingMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        node.window_call().is_some_and(|call| {
            matches!(&call.grouping, WindowGrouping::Within(dims)
                if dims.iter().any(|dim| !self.global_dimensions.contains(dim)))
        })
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let Some(call) = old.window_call() else {
            return old.clone();
        };
        let within = call
            .grouping
            .dims()
            .iter()
            .filter(|dim| self.global_dimensions.contains(dim))
            .cloned()
            .collect();
        rebuild(
            old,
            WindowFuncCall {
                grouping: WindowGrouping::Within(within),
                ..call.clone()
            },
        )
    }
}

/// Wraps each outermost window call in a fork at the query's dimensions, so it is
/// computed over the fully aggregated rows of a sub-query.
pub struct WindowFunctionToQueryForkMutation {
    global_dimensions: Vec<NodeRef>,
}

impl WindowFunctionToQueryForkMutation {
    pub fn new(global_dimensions: Vec<NodeRef>) -> Self {
        WindowFunctionToQueryForkMutation { global_dimensions }
    }
}

impl FormulaMutation for WindowFunctionToQueryForkMutation {
    fn match_node(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> bool {
        if node.window_call().is_none() {
            return false;
        }
        let inside_window = parent_stack
            .iter()
            .any(|ancestor| ancestor.window_call().is_some());
        let already_forked = parent_stack.iter().any(inspect::qfork_is_window);
        !inside_window && !already_forked
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let Some(call) = old.window_call() else {
            return old.clone();
        };
        FormulaItem::new(NodeKind::QueryFork(QueryFork {
            join_type: JoinType::Left,
            result_expr: old.clone(),
            joining: self
                .global_dimensions
                .iter()
                .map(|dim| JoinCondition::self_eq(dim.clone()))
                .collect(),
            lod: LodSpecifier::Fixed(self.global_dimensions.clone()),
            before_filter_by: call.before_filter_by.clone(),
            bfb_filter_mutations: Vec::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect;
    use crate::mutation::apply_mutations;
    use formula_core::shortcuts as n;
    use formula_core::BeforeFilterBy;
    use pretty_assertions::assert_eq;

    #[test]
    fn running_sum_gets_default_ordering() {
        let mutation = DefaultWindowOrderingMutation::new(vec![n::asc(n::field("date"))]);
        let tree = n::wfunc("rsum", [n::func("sum", [n::field("sales")])]);
        let result = apply_mutations(&tree, &[&mutation]);
        assert_eq!(
            result.window_call().map(|call| call.ordering.clone()),
            Some(vec![n::asc(n::field("date"))])
        );

        // Already ordered by the same expression.
        let ordered = n::wfunc_full(
            "rsum",
            [n::field("x")],
            WindowGrouping::Total,
            vec![n::desc(n::field("date"))],
            BeforeFilterBy::default(),
        );
        assert_eq!(apply_mutations(&ordered, &[&mutation]), ordered);

        // Order-independent functions are left alone.
        let total = n::wfunc("sum", [n::field("x")]);
        assert_eq!(apply_mutations(&total, &[&mutation]), total);
    }

    #[test]
    fn among_becomes_within() {
        let dims = vec![n::field("a"), n::field("b"), n::field("c")];
        let tree = n::wfunc_full(
            "sum",
            [n::func("sum", [n::field("x")])],
            n::among([n::field("b")]),
            Vec::new(),
            BeforeFilterBy::default(),
        );
        let result = apply_mutations(&tree, &[&AmongToWithinGroupingMutation::new(dims)]);
        assert_eq!(
            result.window_call().map(|call| call.grouping.clone()),
            Some(n::within([n::field("a"), n::field("c")]))
        );
    }

    #[test]
    fn extra_within_dimensions_are_dropped() {
        let tree = n::wfunc_full(
            "rank",
            [n::func("sum", [n::field("x")])],
            n::within([n::field("a"), n::field("z")]),
            Vec::new(),
            BeforeFilterBy::default(),
        );
        let mutation = IgnoreExtraWithinGroupingMutation::new(vec![n::field("a")]);
        let result = apply_mutations(&tree, &[&mutation]);
        assert_eq!(
            result.window_call().map(|call| call.grouping.clone()),
            Some(n::within([n::field("a")]))
        );
    }

    #[test]
    fn only_outermost_window_is_forked() {
        let inner = n::wfunc("rsum", [n::func("sum", [n::field("x")])]);
        let tree = n::binary("+", n::wfunc("max", [inner]), n::lit_int(1));
        let mutation = WindowFunctionToQueryForkMutation::new(vec![n::field("d")]);
        let result = apply_mutations(&tree, &[&mutation]);

        let NodeKind::Binary { left, .. } = &result.kind else {
            panic!("expected binary, got {result}");
        };
        assert!(inspect::qfork_is_window(left));
        assert_eq!(apply_mutations(&result, &[&mutation]), result);
    }
}
