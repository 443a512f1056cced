//! `BEFORE FILTER BY` normalization.

use std::collections::BTreeSet;

use formula_core::{BeforeFilterBy, FormulaItem, NodeKind, NodeRef, QueryFork, WindowFuncCall};

use crate::mutation::FormulaMutation;

fn own_bfb(node: &NodeRef) -> Option<&BeforeFilterBy> {
    match &node.kind {
        NodeKind::WindowFuncCall(call) => Some(&call.before_filter_by),
        NodeKind::QueryFork(fork) => Some(&fork.before_filter_by),
        _ => None,
    }
}

/// Makes every window call and fork carry the full set of filters it is
/// evaluated before: the set inherited from enclosing calls plus its own, limited
/// to filters the query actually has.
pub struct NormalizeBeforeFilterByMutation {
    available_filter_ids: BTreeSet<String>,
}

impl NormalizeBeforeFilterByMutation {
    pub fn new(available_filter_ids: impl IntoIterator<Item = String>) -> Self {
        NormalizeBeforeFilterByMutation {
            available_filter_ids: available_filter_ids.into_iter().collect(),
        }
    }

    fn accumulate(&self, acc: &mut BTreeSet<String>, bfb: &BeforeFilterBy) {
        acc.extend(
            bfb.names()
                .filter(|name| self.available_filter_ids.contains(*name))
                .map(str::to_string),
        );
    }

    fn normalized(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> Option<BeforeFilterBy> {
        let own = own_bfb(node)?;
        let mut acc = BTreeSet::new();
        for ancestor in parent_stack {
            if let Some(bfb) = own_bfb(ancestor) {
                self.accumulate(&mut acc, bfb);
            }
        }
        self.accumulate(&mut acc, own);
        Some(BeforeFilterBy(acc))
    }
}

impl FormulaMutation for NormalizeBeforeFilterByMutation {
    fn match_node(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> bool {
        self.normalized(node, parent_stack)
            .is_some_and(|bfb| Some(&bfb) != own_bfb(node))
    }

    fn make_replacement(&self, old: &NodeRef, parent_stack: &[NodeRef]) -> NodeRef {
        let Some(before_filter_by) = self.normalized(old, parent_stack) else {
            return old.clone();
        };
        let kind = match &old.kind {
            NodeKind::WindowFuncCall(call) => NodeKind::WindowFuncCall(WindowFuncCall {
                before_filter_by,
                ..call.clone()
            }),
            NodeKind::QueryFork(fork) => NodeKind::QueryFork(QueryFork {
                before_filter_by,
                ..fork.clone()
            }),
            _ => return old.clone(),
        };
        FormulaItem::with_meta(kind, old.meta.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_mutations;
    use formula_core::shortcuts as n;
    use pretty_assertions::assert_eq;

    fn bfb_of(node: &NodeRef) -> Option<BeforeFilterBy> {
        own_bfb(node).cloned()
    }

    #[test]
    fn inherits_outer_set_and_drops_unknown_filters() {
        let inner = n::wfunc_bfb("rsum", [n::func("sum", [n::field("x")])], ["A", "B", "C", "D"]);
        let tree = n::wfunc_bfb("max", [inner], ["A"]);
        let mutation = NormalizeBeforeFilterByMutation::new(["A".to_string(), "C".to_string()]);
        let result = apply_mutations(&tree, &[&mutation]);

        assert_eq!(bfb_of(&result), Some(BeforeFilterBy::new(["A"])));
        let inner = result.window_call().map(|call| call.args[0].clone());
        assert_eq!(
            inner.as_ref().and_then(bfb_of),
            Some(BeforeFilterBy::new(["A", "C"]))
        );
        assert_eq!(apply_mutations(&result, &[&mutation]), result);
    }

    #[test]
    fn outer_filters_reach_inner_calls() {
        let inner = n::wfunc("rsum", [n::func("sum", [n::field("x")])]);
        let tree = n::wfunc_bfb("max", [inner], ["A"]);
        let mutation = NormalizeBeforeFilterByMutation::new(["A".to_string()]);
        let result = apply_mutations(&tree, &[&mutation]);
        let inner = result.window_call().map(|call| call.args[0].clone());
        assert_eq!(
            inner.as_ref().and_then(bfb_of),
            Some(BeforeFilterBy::new(["A"]))
        );
    }
}
