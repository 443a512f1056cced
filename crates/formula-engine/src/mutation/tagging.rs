//! Level tags for window calls.
//!
//! Each window call is wrapped in a parenthesis carrying a [`LevelTag`]: the
//! call's before-filter-by set, how many calls with the same set it encloses
//! (as a non-positive nesting offset) and how many forks enclose it.
//!
//! `TOTAL` calls sit one level shallower than `WITHIN`/`AMONG` calls in the
//! same position.

use formula_core::shortcuts as n;
use formula_core::{BeforeFilterBy, LevelTag, NodeKind, NodeRef, WindowGrouping};

use crate::mutation::FormulaMutation;

fn nearest_window_calls(node: &NodeRef, found: &mut Vec<NodeRef>) {
    for child in node.children() {
        match &child.kind {
            NodeKind::WindowFuncCall(_) => found.push(child.clone()),
            NodeKind::QueryFork(_) => {}
            _ => nearest_window_calls(&child, found),
        }
    }
}

/// Length of the longest chain of nested window calls below `node` sharing `bfb`.
fn same_bfb_depth(node: &NodeRef, bfb: &BeforeFilterBy) -> i32 {
    let mut descendants = Vec::new();
    nearest_window_calls(node, &mut descendants);
    descendants
        .iter()
        .filter(|call| call.window_call().is_some_and(|c| c.before_filter_by == *bfb))
        .map(|call| 1 + same_bfb_depth(call, bfb))
        .max()
        .unwrap_or(0)
}

fn grouping_offset(grouping: &WindowGrouping) -> i32 {
    match grouping {
        WindowGrouping::Total => -1,
        WindowGrouping::Within(_) | WindowGrouping::Among(_) => 0,
    }
}

pub struct LevelTagMutation;

impl FormulaMutation for LevelTagMutation {
    fn match_node(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> bool {
        if node.window_call().is_none() {
            return false;
        }
        let already_tagged = parent_stack.last().is_some_and(|parent| {
            matches!(parent.kind, NodeKind::Parenthesized(_)) && parent.level_tag().is_some()
        });
        !already_tagged
    }

    fn make_replacement(&self, old: &NodeRef, parent_stack: &[NodeRef]) -> NodeRef {
        let Some(call) = old.window_call() else {
            return old.clone();
        };
        let qfork_nesting = parent_stack
            .iter()
            .filter(|ancestor| ancestor.query_fork().is_some())
            .count();
        let tag = LevelTag::new(
            call.before_filter_by.names(),
            grouping_offset(&call.grouping) - same_bfb_depth(old, &call.before_filter_by),
        )
        .with_qfork_nesting(i32::try_from(qfork_nesting).unwrap_or(i32::MAX));
        n::tagged(tag, n::p(old.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::apply_mutations;
    use pretty_assertions::assert_eq;

    fn collect_tags(node: &NodeRef) -> Vec<i32> {
        let mut tags = Vec::new();
        node.walk(&mut |item| {
            if let Some(tag) = item.level_tag() {
                tags.push(tag.func_nesting);
            }
        });
        tags
    }

    #[test]
    fn nesting_counts_calls_sharing_the_filter_set() {
        let chain: [&[&str]; 7] = [&[], &["A"], &["A"], &["A"], &["A", "B"], &["A", "B"], &["A", "B", "C", "D"]];
        let mut tree = n::func("sum", [n::field("x")]);
        for bfb in chain.iter().rev() {
            tree = n::wfunc_bfb("max", [tree], bfb.iter().copied());
        }
        let result = apply_mutations(&tree, &[&LevelTagMutation]);
        assert_eq!(collect_tags(&result), vec![-1, -3, -2, -1, -2, -1, -1]);
        assert_eq!(apply_mutations(&result, &[&LevelTagMutation]), result);
    }

    #[test]
    fn forks_count_as_levels() {
        let call = n::wfunc("rank", [n::func("sum", [n::field("x")])]);
        let tree = n::fork(
            formula_core::JoinType::Left,
            call,
            Vec::new(),
            formula_core::LodSpecifier::Fixed(Vec::new()),
        );
        let result = apply_mutations(&tree, &[&LevelTagMutation]);
        let tagged = result.query_fork().map(|fork| fork.result_expr.clone());
        assert_eq!(
            tagged.as_ref().and_then(|node| node.level_tag().cloned()),
            Some(LevelTag::new(Vec::<String>::new(), -1).with_qfork_nesting(1))
        );
    }

    #[test]
    fn total_calls_are_one_level_shallower_than_within() {
        let inner = || n::func("sum", [n::field("x")]);
        let total = n::wfunc("rsum", [inner()]);
        let within = n::wfunc_full(
            "rsum",
            [inner()],
            n::within([n::field("city")]),
            Vec::new(),
            BeforeFilterBy::default(),
        );
        let among = n::wfunc_full(
            "rsum",
            [inner()],
            n::among([n::field("city")]),
            Vec::new(),
            BeforeFilterBy::default(),
        );
        let tree = n::binary("+", total, n::binary("-", within, among));
        let result = apply_mutations(&tree, &[&LevelTagMutation]);
        assert_eq!(collect_tags(&result), vec![-1, 0, 0]);

        let nested = n::wfunc_full(
            "rank",
            [n::wfunc("rsum", [inner()])],
            n::within([n::field("city")]),
            Vec::new(),
            BeforeFilterBy::default(),
        );
        let result = apply_mutations(&nested, &[&LevelTagMutation]);
        assert_eq!(collect_tags(&result), vec![-1, -1]);
    }
}
