//! Tree rewrites applied to formulas before translation.
//!
//! A mutation is a matcher plus a replacement builder. Mutations run bottom-up
//! through [`formula_core::replace_nodes`] and see the original ancestors of each
//! candidate, outermost first.

pub mod bfb;
pub mod lod;
pub mod lookup;
pub mod optimization;
pub mod tagging;
pub mod window;

use formula_core::{replace_nodes, FormulaError, NodeKind, NodeRef};

/// Upper bound on rounds for passes that run until the tree stops changing.
pub const MAX_FIXPOINT_ITERATIONS: usize = 16;

pub trait FormulaMutation {
    fn match_node(&self, node: &NodeRef, parent_stack: &[NodeRef]) -> bool;

    fn make_replacement(&self, old: &NodeRef, parent_stack: &[NodeRef]) -> NodeRef;
}

/// Apply each mutation in turn, every one over the whole tree.
pub fn apply_mutations(tree: &NodeRef, mutations: &[&dyn FormulaMutation]) -> NodeRef {
    let mut tree = tree.clone();
    for mutation in mutations {
        tree = replace_nodes(
            &tree,
            &mut |node, stack| mutation.match_node(node, stack),
            &mut |node, stack| mutation.make_replacement(node, stack),
        );
    }
    tree
}

/// Repeat [`apply_mutations`] until the tree is stable.
pub fn apply_mutations_to_fixpoint(tree: &NodeRef, mutations: &[&dyn FormulaMutation]) -> NodeRef {
    let mut tree = tree.clone();
    for _ in 0..MAX_FIXPOINT_ITERATIONS {
        let next = apply_mutations(&tree, mutations);
        if next == tree {
            return next;
        }
        tree = next;
    }
    log::warn!("mutations did not converge after {MAX_FIXPOINT_ITERATIONS} rounds: {tree}");
    tree
}

/// Errors recorded as `Error` nodes anywhere in `tree`.
pub fn collect_errors(tree: &NodeRef) -> Vec<FormulaError> {
    let mut errors = Vec::new();
    tree.walk(&mut |node| {
        if let NodeKind::Error { message, code } = &node.kind {
            errors.push(FormulaError::from_error_node(code, message));
        }
    });
    errors
}
