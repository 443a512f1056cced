//! Query fork splitting.
//!
//! Each round looks at the outermost query forks of one query and cuts the
//! query along them. Every group of compatible forks becomes a sub-query that
//! selects the forks' result expressions at the fork's dimensions. A base
//! sub-query holds whatever the forks do not cover. The original query is
//! "cropped": every fork is replaced with a reference to the sub-query column
//! it was moved to, and the sub-queries are joined to the base on the fork's
//! joining conditions.
//!
//! Sub-queries may still contain deeper forks; [`split_query_forks`] repeats
//! the process until no query has any left.

use std::collections::{BTreeMap, BTreeSet};

use formula_core::shortcuts as n;
use formula_core::{
    codes, enumerate_autonomous_children, get_at, replace_at, replace_nodes, BfbFilterMutation,
    FormulaItem, FuncCall, JoinCondition, JoinType, LodSpecifier, NodeIndex, NodeKind, NodeRef,
    QueryFork,
};
use formula_engine::inspect;
use formula_engine::mutation::collect_errors;

use crate::error::QueryError;
use crate::name_gen::PrefixedIdGen;
use crate::primitives::{
    CompiledFormulaInfo, CompiledMultiQuery, CompiledQuery, FromObject, JoinSpec, JoinedFrom,
    QueryPart,
};

/// Upper bound on split rounds for one multi-query.
pub const MAX_SPLIT_ITERATIONS: usize = 64;

const EXPR_ID_PREFIX: &str = "_cp";
const QUERY_ID_PREFIX: &str = "q";
const JOIN_EQUALITY_FUNCTION: &str = "_dneq";
const INCOMPATIBLE_DIMENSIONS_MESSAGE: &str = "LOD dimensions are incompatible";

/// Parts whose formulas can be cut. Group-by items are dimensions and join
/// conditions only reference them.
const SPLIT_PARTS: [QueryPart; 3] = [QueryPart::Select, QueryPart::OrderBy, QueryPart::Filters];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubqueryType {
    Default,
    /// Only window forks were taken in this round.
    WindowFunc,
    /// Base sub-query made up from the leftovers of the split query.
    GeneratedBase,
}

/// One cut in one formula: the node at `outer` is replaced with a reference
/// to `alias`, which the sub-query computes from the node at `inner`.
#[derive(Debug, Clone)]
struct FormulaSplitMask {
    part: QueryPart,
    formula_idx: usize,
    outer: NodeIndex,
    inner: NodeIndex,
    alias: String,
}

/// Extra expression a sub-query selects: a dimension, or an expression a join
/// condition needs.
#[derive(Debug, Clone)]
struct AddFormula {
    alias: String,
    expr: NodeRef,
    from_ids: BTreeSet<String>,
    is_group_by: bool,
}

#[derive(Debug, Clone)]
struct QuerySplitMask {
    subquery_type: SubqueryType,
    subquery_id: String,
    formula_masks: Vec<FormulaSplitMask>,
    add_formulas: Vec<AddFormula>,
    filter_indices: BTreeSet<usize>,
    add_filters: Vec<CompiledFormulaInfo>,
    join_type: Option<JoinType>,
    joining: Vec<JoinCondition>,
    is_base: bool,
}

impl QuerySplitMask {
    fn group_by_exprs(&self) -> Vec<NodeRef> {
        self.add_formulas
            .iter()
            .filter(|add| add.is_group_by)
            .map(|add| add.expr.clone())
            .collect()
    }

    fn group_by_count(&self) -> usize {
        self.add_formulas.iter().filter(|add| add.is_group_by).count()
    }

    /// Every join condition compares a column with its counterpart.
    fn has_direct_equality_join(&self) -> bool {
        self.joining
            .iter()
            .all(|condition| matches!(condition, JoinCondition::SelfEquality { .. }))
    }

    fn add_formula_alias(&self, expr: &NodeRef) -> Option<&str> {
        self.add_formulas
            .iter()
            .find(|add| add.expr == *expr)
            .map(|add| add.alias.as_str())
    }
}

/// Forks with equal signatures end up in the same sub-query.
#[derive(Debug)]
struct ForkSignature {
    dims: Vec<NodeRef>,
    child_lods: Vec<LodSpecifier>,
    join_type: JoinType,
    bfb: BTreeSet<String>,
    joining: Vec<JoinCondition>,
}

impl ForkSignature {
    fn matches(&self, other: &ForkSignature) -> bool {
        same_set(&self.dims, &other.dims)
            && same_set(&self.child_lods, &other.child_lods)
            && self.join_type == other.join_type
            && self.bfb == other.bfb
            && self.joining == other.joining
    }
}

#[derive(Debug)]
struct ForkGroup {
    signature: ForkSignature,
    subquery_type: SubqueryType,
    add_formulas: Vec<AddFormula>,
    bfb_filter_mutations: Vec<BfbFilterMutation>,
    /// Result expressions already given a column, with that column.
    aliases: Vec<(NodeRef, String)>,
    formula_masks: Vec<FormulaSplitMask>,
}

/// A fork found in a formula, with the path to it.
struct FoundFork {
    part: QueryPart,
    formula_idx: usize,
    outer: NodeIndex,
    fork: QueryFork,
    is_window: bool,
    bfb: BTreeSet<String>,
}

fn same_set<T: PartialEq>(left: &[T], right: &[T]) -> bool {
    left.iter().all(|item| right.contains(item)) && right.iter().all(|item| left.contains(item))
}

fn is_prefix(prefix: &[usize], index: &[usize]) -> bool {
    index.len() >= prefix.len() && index[..prefix.len()] == *prefix
}

/// Outermost forks below `node`; nested forks are left for later rounds.
fn find_forks(node: &NodeRef, prefix: &[usize], found: &mut Vec<(NodeIndex, NodeRef)>) {
    if node.query_fork().is_some() {
        found.push((prefix.to_vec(), node.clone()));
        return;
    }
    for (index, child) in enumerate_autonomous_children(node, prefix) {
        find_forks(&child, &index, found);
    }
}

fn child_lods(result_expr: &NodeRef) -> Vec<LodSpecifier> {
    let mut found = Vec::new();
    find_forks(result_expr, &[], &mut found);
    let mut lods: Vec<LodSpecifier> = Vec::new();
    for (_, node) in found {
        if let Some(fork) = node.query_fork() {
            if !lods.contains(&fork.lod) {
                lods.push(fork.lod.clone());
            }
        }
    }
    lods
}

/// Replace every occurrence of `target` in `node` with a reference to `alias`.
fn replace_with_field(node: &NodeRef, target: &NodeRef, alias: &str) -> NodeRef {
    replace_nodes(
        node,
        &mut |candidate, _| candidate == target,
        &mut |old, _| FormulaItem::with_meta(NodeKind::Field { name: alias.to_string() }, old.meta.clone()),
    )
}

fn rename_fields(node: &NodeRef, names: &BTreeMap<String, String>) -> NodeRef {
    replace_nodes(
        node,
        &mut |candidate, _| {
            candidate
                .field_name()
                .is_some_and(|name| names.contains_key(name))
        },
        &mut |old, _| {
            let name = old
                .field_name()
                .and_then(|name| names.get(name))
                .cloned()
                .unwrap_or_default();
            FormulaItem::with_meta(NodeKind::Field { name }, old.meta.clone())
        },
    )
}

/// Sub-queries compute plain aggregations: the level of detail and filter
/// settings of a split-off call are already expressed by the sub-query itself.
fn mutate_split_node(node: NodeRef) -> NodeRef {
    if !inspect::is_aggregate_function(&node) {
        return node;
    }
    match node.func_call() {
        Some(call) => FormulaItem::with_meta(
            NodeKind::FuncCall(FuncCall {
                name: call.name.clone(),
                args: call.args.clone(),
                lod: LodSpecifier::Inherited,
                ignore_dimensions: Vec::new(),
                before_filter_by: Default::default(),
            }),
            node.meta.clone(),
        ),
        None => node,
    }
}

/// Aggregate function calls outside window calls. A window over sub-query
/// columns does not need the query to be grouped.
fn contains_aggregate_call(node: &NodeRef) -> bool {
    if inspect::is_aggregate_function(node) {
        return true;
    }
    if let Some(call) = node.window_call() {
        return call.args.iter().any(contains_aggregate_call);
    }
    node.autonomous_children().iter().any(contains_aggregate_call)
}

/// Cuts queries along their query forks.
///
/// Column aliases and sub-query ids are unique across all the rounds one
/// splitter runs.
#[derive(Debug, Clone)]
pub struct QueryForkSplitter {
    expr_ids: PrefixedIdGen,
    query_ids: PrefixedIdGen,
}

impl Default for QueryForkSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryForkSplitter {
    pub fn new() -> Self {
        QueryForkSplitter {
            expr_ids: PrefixedIdGen::new(EXPR_ID_PREFIX),
            query_ids: PrefixedIdGen::new(QUERY_ID_PREFIX),
        }
    }

    /// Split the outermost forks of `query` off.
    ///
    /// Returns the new sub-queries followed by the cropped query (which keeps
    /// the id of `query`), or `None` when `query` has no forks.
    pub fn split(&mut self, query: &CompiledQuery) -> Result<Option<Vec<CompiledQuery>>, QueryError> {
        let groups = self.collect_fork_groups(query);
        if groups.is_empty() {
            return Ok(None);
        }
        let masks = self.split_masks(query, groups);
        let compatible = dimensions_compatible(query, &masks);

        let masks = self.patch_with_base(query, masks);
        let masks = unify_window_masks(masks);
        let masks = self.patch_base_dimensions(masks);
        log::debug!(
            "splitting query {} into {} sub-queries (compatible: {compatible})",
            query.id,
            masks.len()
        );

        let mut queries = masks
            .iter()
            .map(|mask| generate_subquery(query, mask))
            .collect::<Result<Vec<_>, _>>()?;
        queries.push(crop_query(query, &masks, compatible)?);
        Ok(Some(queries))
    }

    fn collect_fork_groups(&mut self, query: &CompiledQuery) -> Vec<ForkGroup> {
        let filter_ids = query.filter_ids();
        let mut found = Vec::new();
        for part in SPLIT_PARTS {
            for (formula_idx, info) in query.formulas(part).iter().enumerate() {
                let mut forks = Vec::new();
                find_forks(&info.formula, &[], &mut forks);
                for (outer, node) in forks {
                    let Some(fork) = node.query_fork() else {
                        continue;
                    };
                    let bfb = fork
                        .before_filter_by
                        .names()
                        .filter(|name| filter_ids.contains(*name))
                        .map(str::to_string)
                        .collect();
                    found.push(FoundFork {
                        part,
                        formula_idx,
                        outer,
                        fork: fork.clone(),
                        is_window: inspect::qfork_is_window(&node),
                        bfb,
                    });
                }
            }
        }
        let (subquery_type, found) = prioritize_window_forks(found);

        let from_ids: BTreeSet<String> = query.joined_from.iter_ids().map(str::to_string).collect();
        let mut groups: Vec<ForkGroup> = Vec::new();
        for found_fork in found {
            let fork = &found_fork.fork;
            let mut dims: Vec<NodeRef> = match &fork.lod {
                LodSpecifier::Fixed(dims) => dims.clone(),
                LodSpecifier::Inherited | LodSpecifier::DefaultAggregation => query.dimensions(),
                other => inspect::resolve_dimensions(&query.dimensions(), other),
            };
            let mut joining = fork.joining.clone();
            if dims.is_empty() {
                // Total grouping still needs something to join on.
                let dummy = n::lit_int(1);
                dims.push(dummy.clone());
                joining = vec![JoinCondition::self_eq(dummy)];
            }

            let signature = ForkSignature {
                dims: dims.clone(),
                child_lods: child_lods(&fork.result_expr),
                join_type: fork.join_type,
                bfb: found_fork.bfb.clone(),
                joining: joining.clone(),
            };
            let group_idx = match groups
                .iter()
                .position(|group| group.signature.matches(&signature))
            {
                Some(idx) => idx,
                None => {
                    let mut add_formulas: Vec<AddFormula> = dims
                        .iter()
                        .map(|dim| AddFormula {
                            alias: self.expr_ids.get_id(),
                            expr: dim.clone(),
                            from_ids: from_ids.clone(),
                            is_group_by: !inspect::is_constant_expression(dim),
                        })
                        .collect();
                    for condition in &joining {
                        for expr in condition.expressions() {
                            if inspect::is_aggregate_expression(expr) {
                                add_formulas.push(AddFormula {
                                    alias: self.expr_ids.get_id(),
                                    expr: expr.clone(),
                                    from_ids: from_ids.clone(),
                                    is_group_by: false,
                                });
                            }
                        }
                    }
                    groups.push(ForkGroup {
                        signature,
                        subquery_type,
                        add_formulas,
                        bfb_filter_mutations: fork.bfb_filter_mutations.clone(),
                        aliases: Vec::new(),
                        formula_masks: Vec::new(),
                    });
                    groups.len() - 1
                }
            };

            let group = &mut groups[group_idx];
            let existing = group
                .aliases
                .iter()
                .find(|(expr, _)| *expr == fork.result_expr)
                .map(|(_, alias)| alias.clone());
            let alias = match existing {
                Some(alias) => alias,
                None => {
                    let alias = self.expr_ids.get_id();
                    group.aliases.push((fork.result_expr.clone(), alias.clone()));
                    alias
                }
            };
            let mut inner = found_fork.outer.clone();
            inner.push(QueryFork::RESULT_EXPR_INDEX);
            group.formula_masks.push(FormulaSplitMask {
                part: found_fork.part,
                formula_idx: found_fork.formula_idx,
                outer: found_fork.outer,
                inner,
                alias,
            });
        }
        groups
    }

    fn split_masks(&mut self, query: &CompiledQuery, groups: Vec<ForkGroup>) -> Vec<QuerySplitMask> {
        // A filter cut at this level can only be applied above it.
        let split_filters: BTreeSet<usize> = groups
            .iter()
            .flat_map(|group| &group.formula_masks)
            .filter(|mask| mask.part == QueryPart::Filters)
            .map(|mask| mask.formula_idx)
            .collect();

        groups
            .into_iter()
            .map(|group| {
                let mut add_formulas: Vec<&AddFormula> = group.add_formulas.iter().collect();
                add_formulas.sort_by_key(|add| std::cmp::Reverse(add.expr.complexity()));
                let joining = group
                    .signature
                    .joining
                    .iter()
                    .map(|condition| {
                        let normalize = |expr: &NodeRef| {
                            add_formulas
                                .iter()
                                .fold(expr.clone(), |expr, add| replace_with_field(&expr, &add.expr, &add.alias))
                        };
                        match condition {
                            JoinCondition::SelfEquality { expr } => JoinCondition::self_eq(normalize(expr)),
                            JoinCondition::Binary { expr, fork_expr } => {
                                JoinCondition::binary(normalize(expr), normalize(fork_expr))
                            }
                        }
                    })
                    .collect();

                let mut filter_indices = BTreeSet::new();
                let mut add_filters = Vec::new();
                for (idx, filter) in query.filters.iter().enumerate() {
                    let in_bfb = filter
                        .original_field_id
                        .as_ref()
                        .is_some_and(|id| group.signature.bfb.contains(id));
                    if in_bfb {
                        // Applied after the fork unless the fork shifts it.
                        if group
                            .bfb_filter_mutations
                            .iter()
                            .any(|mutation| inspect::contains_node(&filter.formula, &mutation.original))
                        {
                            let shifted = group.bfb_filter_mutations.iter().fold(
                                filter.formula.clone(),
                                |formula, mutation| {
                                    replace_nodes(
                                        &formula,
                                        &mut |node, _| *node == mutation.original,
                                        &mut |_, _| mutation.replacement.clone(),
                                    )
                                },
                            );
                            add_filters.push(filter.with_formula(shifted));
                        }
                        continue;
                    }
                    if split_filters.contains(&idx) {
                        continue;
                    }
                    filter_indices.insert(idx);
                }

                QuerySplitMask {
                    subquery_type: group.subquery_type,
                    subquery_id: self.query_ids.get_id(),
                    formula_masks: group.formula_masks,
                    add_formulas: group.add_formulas,
                    filter_indices,
                    add_filters,
                    join_type: Some(group.signature.join_type),
                    joining,
                    is_base: false,
                }
            })
            .collect()
    }

    /// Columns for the parts of split formulas that no fork covers.
    fn counterparts(&mut self, query: &CompiledQuery, masks: &[QuerySplitMask]) -> Vec<FormulaSplitMask> {
        let gb_aliases: Vec<&str> = query.group_by.iter().filter_map(|info| info.alias.as_deref()).collect();
        let mut result = Vec::new();
        for part in SPLIT_PARTS {
            for (formula_idx, info) in query.formulas(part).iter().enumerate() {
                if info.alias.as_deref().is_some_and(|alias| gb_aliases.contains(&alias)) {
                    continue;
                }
                if inspect::is_constant_expression(&info.formula) {
                    continue;
                }
                let mut cut: Vec<NodeIndex> = masks
                    .iter()
                    .flat_map(|mask| &mask.formula_masks)
                    .filter(|mask| mask.part == part && mask.formula_idx == formula_idx)
                    .map(|mask| mask.outer.clone())
                    .collect();
                if part == QueryPart::Filters && cut.is_empty() {
                    continue;
                }
                cut.sort();
                cut.dedup();

                let mut indices = Vec::new();
                collect_counterparts(&info.formula, &[], &cut, &mut indices);
                for index in indices {
                    result.push(FormulaSplitMask {
                        part,
                        formula_idx,
                        outer: index.clone(),
                        inner: index,
                        alias: self.expr_ids.get_id(),
                    });
                }
            }
        }
        result
    }

    fn patch_with_base(&mut self, query: &CompiledQuery, mut masks: Vec<QuerySplitMask>) -> Vec<QuerySplitMask> {
        let counterparts = self.counterparts(query, &masks);
        let split_filters: BTreeSet<usize> = masks
            .iter()
            .flat_map(|mask| &mask.formula_masks)
            .filter(|mask| mask.part == QueryPart::Filters)
            .map(|mask| mask.formula_idx)
            .collect();
        let base_filters: BTreeSet<usize> = (0..query.filters.len())
            .filter(|idx| !split_filters.contains(idx))
            .collect();

        if counterparts.is_empty() {
            if let Some(candidate) = find_base_candidate(query, &masks, &base_filters) {
                masks[candidate].is_base = true;
                let base = masks.remove(candidate);
                masks.insert(0, base);
                return masks;
            }
        }

        let add_formulas = query
            .group_by
            .iter()
            .map(|info| AddFormula {
                alias: self.expr_ids.get_id(),
                expr: info.formula.clone(),
                from_ids: info.avatar_ids.clone(),
                is_group_by: !inspect::is_constant_expression(&info.formula),
            })
            .collect();
        let base = QuerySplitMask {
            subquery_type: SubqueryType::GeneratedBase,
            subquery_id: self.query_ids.get_id(),
            formula_masks: counterparts,
            add_formulas,
            filter_indices: base_filters,
            add_filters: Vec::new(),
            join_type: None,
            joining: Vec::new(),
            is_base: true,
        };
        masks.insert(0, base);
        masks
    }

    /// The base selects every expression the other sub-queries are joined on.
    fn patch_base_dimensions(&mut self, mut masks: Vec<QuerySplitMask>) -> Vec<QuerySplitMask> {
        let Some((base, others)) = masks.split_first_mut() else {
            return masks;
        };
        for other in others.iter() {
            for add in &other.add_formulas {
                if base.add_formula_alias(&add.expr).is_some() {
                    continue;
                }
                base.add_formulas.push(AddFormula {
                    alias: self.expr_ids.get_id(),
                    ..add.clone()
                });
            }
        }
        masks
    }
}

/// Window forks are taken alone when the smallest window bfb set is a subset
/// of every other bfb set. The window sub-query then needs no joins.
fn prioritize_window_forks(found: Vec<FoundFork>) -> (SubqueryType, Vec<FoundFork>) {
    let smallest = found
        .iter()
        .filter(|fork| fork.is_window)
        .map(|fork| &fork.bfb)
        .min_by_key(|bfb| bfb.len())
        .cloned();
    let Some(smallest) = smallest else {
        return (SubqueryType::Default, found);
    };
    if !found.iter().all(|fork| smallest.is_subset(&fork.bfb)) {
        return (SubqueryType::Default, found);
    }
    let found = found
        .into_iter()
        .filter(|fork| fork.is_window && fork.bfb == smallest)
        .collect();
    (SubqueryType::WindowFunc, found)
}

/// Indices below `prefix` not covered by `cut`, skipping constants.
fn collect_counterparts(node: &NodeRef, prefix: &[usize], cut: &[NodeIndex], result: &mut Vec<NodeIndex>) {
    if cut.iter().any(|index| index.as_slice() == prefix) {
        return;
    }
    if !cut.iter().any(|index| is_prefix(prefix, index)) {
        if !inspect::is_constant_expression(node) {
            result.push(prefix.to_vec());
        }
        return;
    }
    for (index, child) in enumerate_autonomous_children(node, prefix) {
        collect_counterparts(&child, &index, cut, result);
    }
}

/// An existing sub-query that can serve as the base: the one with the most
/// dimensions, when it has exactly the query's dimensions and filters.
fn find_base_candidate(
    query: &CompiledQuery,
    masks: &[QuerySplitMask],
    base_filters: &BTreeSet<usize>,
) -> Option<usize> {
    let base_dims: Vec<NodeRef> = query
        .dimensions()
        .into_iter()
        .filter(|dim| !inspect::is_constant_expression(dim))
        .collect();
    let base_count = {
        let mut unique: Vec<&NodeRef> = Vec::new();
        for dim in &base_dims {
            if !unique.contains(&dim) {
                unique.push(dim);
            }
        }
        unique.len()
    };
    let max_dimensions = masks.iter().map(QuerySplitMask::group_by_count).max()?;

    let mut candidate = None;
    let mut has_all_dimensions = false;
    let mut has_all_filters = true;
    let mut has_direct_join = true;
    for (idx, mask) in masks.iter().enumerate() {
        if mask.group_by_count() != max_dimensions {
            continue;
        }
        let dims = mask.group_by_exprs();
        if !base_dims.iter().all(|dim| dims.contains(dim)) {
            continue;
        }
        candidate = Some(idx);
        has_all_dimensions = mask.group_by_count() == base_count;
        has_all_filters = mask.filter_indices == *base_filters;
        has_direct_join = mask.has_direct_equality_join();
    }

    if has_all_dimensions && has_all_filters && has_direct_join {
        return candidate;
    }
    // Without dimensions of its own the base would only carry filters that
    // cannot change anything.
    if base_count == 0 {
        return candidate;
    }
    None
}

/// Window forks taken alone are merged into the base: one sub-query computes
/// the windows over the grouped rows and the cropped query only filters them.
fn unify_window_masks(masks: Vec<QuerySplitMask>) -> Vec<QuerySplitMask> {
    if !masks
        .iter()
        .any(|mask| mask.subquery_type == SubqueryType::WindowFunc)
    {
        return masks;
    }
    let [mut base, other]: [QuerySplitMask; 2] = match masks.try_into() {
        Ok(pair) => pair,
        Err(masks) => return masks,
    };
    for add in other.add_formulas {
        if base.add_formula_alias(&add.expr).is_none() {
            base.add_formulas.push(add);
        }
    }
    base.formula_masks.extend(other.formula_masks);
    // The fork's filters exclude its bfb filters, which must stay above the window.
    base.filter_indices = other.filter_indices;
    base.add_filters = other.add_filters;
    vec![base]
}

/// The union of the dimension sets must be one of them. The query's own
/// dimensions take part too: the cropped query is evaluated at them.
fn dimensions_compatible(query: &CompiledQuery, masks: &[QuerySplitMask]) -> bool {
    let mut sets: Vec<Vec<NodeRef>> = masks.iter().map(QuerySplitMask::group_by_exprs).collect();
    sets.push(
        query
            .dimensions()
            .into_iter()
            .filter(|dim| !inspect::is_constant_expression(dim))
            .collect(),
    );
    let mut union: Vec<NodeRef> = Vec::new();
    for dim in sets.iter().flatten() {
        if !union.contains(dim) {
            union.push(dim.clone());
        }
    }
    sets.iter().any(|set| same_set(set, &union))
}

fn generate_subquery(query: &CompiledQuery, mask: &QuerySplitMask) -> Result<CompiledQuery, QueryError> {
    let split_error = |message: String| QueryError::Split {
        query_id: query.id.clone(),
        message,
    };

    let mut subquery = CompiledQuery::new(mask.subquery_id.clone());
    for formula_mask in &mask.formula_masks {
        let original = query
            .formulas(formula_mask.part)
            .get(formula_mask.formula_idx)
            .ok_or_else(|| split_error(format!("no formula at {:?}", formula_mask.formula_idx)))?;
        let node = get_at(&original.formula, &formula_mask.inner)
            .ok_or_else(|| split_error(format!("no node at {:?}", formula_mask.inner)))?;
        let node = mutate_split_node(node);

        let existing = subquery
            .select
            .iter()
            .find(|info| info.alias.as_deref() == Some(formula_mask.alias.as_str()))
            .map(|info| info.formula.clone());
        match existing {
            Some(existing) if existing != node => {
                return Err(split_error(format!(
                    "different formulas selected as {}",
                    formula_mask.alias
                )));
            }
            Some(_) => {}
            None => {
                let mut info = CompiledFormulaInfo::new(node)
                    .with_alias(formula_mask.alias.clone())
                    .with_avatar_ids(original.avatar_ids.clone());
                info.original_field_id = original.original_field_id.clone();
                subquery.select.push(info);
            }
        }
    }

    for add in &mask.add_formulas {
        let info = CompiledFormulaInfo::new(add.expr.clone())
            .with_alias(add.alias.clone())
            .with_avatar_ids(add.from_ids.clone());
        if add.is_group_by {
            subquery.group_by.push(info.clone());
        }
        subquery.select.push(info);
    }

    subquery.filters = query
        .filters
        .iter()
        .enumerate()
        .filter(|(idx, _)| mask.filter_indices.contains(idx))
        .map(|(_, info)| info.clone())
        .chain(mask.add_filters.iter().cloned())
        .collect();
    subquery.join_on = query.join_on.clone();
    subquery.joined_from = query.joined_from.clone();
    subquery.meta = query.meta.clone();
    Ok(subquery)
}

/// Join condition of `right` against the base sub-query `left`.
fn make_join_on(left: &QuerySplitMask, right: &QuerySplitMask) -> Option<CompiledFormulaInfo> {
    let right_to_left: BTreeMap<String, String> = right
        .add_formulas
        .iter()
        .filter_map(|add| {
            left.add_formula_alias(&add.expr)
                .map(|alias| (add.alias.clone(), alias.to_string()))
        })
        .collect();

    let condition = right
        .joining
        .iter()
        .map(|condition| {
            let (left_expr, right_expr) = match condition {
                JoinCondition::SelfEquality { expr } => (expr, expr),
                JoinCondition::Binary { expr, fork_expr } => (expr, fork_expr),
            };
            n::binary(
                JOIN_EQUALITY_FUNCTION,
                rename_fields(left_expr, &right_to_left),
                right_expr.clone(),
            )
        })
        .reduce(|acc, part| n::binary("and", acc, part))?;

    let join_type = right.join_type?;
    let mut info = CompiledFormulaInfo::new(condition)
        .with_avatar_ids([left.subquery_id.clone(), right.subquery_id.clone()]);
    info.join = Some(JoinSpec {
        left_id: left.subquery_id.clone(),
        right_id: right.subquery_id.clone(),
        join_type,
    });
    Some(info)
}

struct Cropper<'a> {
    masks: Vec<&'a FormulaSplitMask>,
    gb_aliases: Vec<String>,
    base_dims: Vec<(NodeRef, String)>,
    column_sources: BTreeMap<String, String>,
    substitute: Option<NodeRef>,
}

impl Cropper<'_> {
    fn crop_part(
        &self,
        query: &CompiledQuery,
        part: QueryPart,
        exclude: &BTreeSet<usize>,
    ) -> Result<Vec<CompiledFormulaInfo>, QueryError> {
        let mut result = Vec::new();
        for (idx, info) in query.formulas(part).iter().enumerate() {
            if exclude.contains(&idx) {
                continue;
            }
            let is_constant = inspect::is_constant_expression(&info.formula);
            let formula = if is_constant {
                info.formula.clone()
            } else if info
                .alias
                .as_ref()
                .is_some_and(|alias| self.gb_aliases.contains(alias))
            {
                let alias = self.base_dim_alias(&info.formula).ok_or_else(|| QueryError::Split {
                    query_id: query.id.clone(),
                    message: format!("dimension {} is missing from the base sub-query", info.formula),
                })?;
                FormulaItem::with_meta(NodeKind::Field { name: alias.to_string() }, info.formula.meta.clone())
            } else if let Some(error) = &self.substitute {
                error.clone()
            } else {
                let mut formula = info.formula.clone();
                for mask in self
                    .masks
                    .iter()
                    .filter(|mask| mask.part == part && mask.formula_idx == idx)
                {
                    formula = replace_at(&formula, &mask.outer, n::field(mask.alias.clone()))
                        .ok_or_else(|| QueryError::Split {
                            query_id: query.id.clone(),
                            message: format!("no node at {:?}", mask.outer),
                        })?;
                }
                if part == QueryPart::Filters {
                    // Filters may depend on dimensions without being one.
                    formula = replace_nodes(
                        &formula,
                        &mut |node, _| self.base_dim_alias(node).is_some(),
                        &mut |node, _| {
                            let name = self.base_dim_alias(node).unwrap_or_default().to_string();
                            FormulaItem::with_meta(NodeKind::Field { name }, node.meta.clone())
                        },
                    );
                }
                formula
            };

            if formula != info.formula {
                let avatar_ids: BTreeSet<String> = inspect::used_field_names(&formula)
                    .iter()
                    .filter_map(|name| self.column_sources.get(name).cloned())
                    .collect();
                let mut info = info.with_formula(formula);
                info.avatar_ids = avatar_ids;
                result.push(info);
            } else if is_constant {
                result.push(info.clone());
            }
            // Anything else still reads from the original FROM objects. Only
            // filters whose fields are all before-filter-by end up here.
        }
        Ok(result)
    }

    fn base_dim_alias(&self, node: &NodeRef) -> Option<&str> {
        self.base_dims
            .iter()
            .find(|(expr, _)| expr == node)
            .map(|(_, alias)| alias.as_str())
    }
}

fn crop_query(
    query: &CompiledQuery,
    masks: &[QuerySplitMask],
    compatible: bool,
) -> Result<CompiledQuery, QueryError> {
    let Some((base, others)) = masks.split_first().filter(|(base, _)| base.is_base) else {
        return Err(QueryError::Split {
            query_id: query.id.clone(),
            message: "no base sub-query to crop against".to_string(),
        });
    };

    let mut column_sources = BTreeMap::new();
    for mask in masks {
        for formula_mask in &mask.formula_masks {
            column_sources.insert(formula_mask.alias.clone(), mask.subquery_id.clone());
        }
        for add in &mask.add_formulas {
            column_sources.insert(add.alias.clone(), mask.subquery_id.clone());
        }
    }
    let cropper = Cropper {
        masks: masks.iter().flat_map(|mask| &mask.formula_masks).collect(),
        gb_aliases: query.group_by.iter().filter_map(|info| info.alias.clone()).collect(),
        base_dims: base
            .add_formulas
            .iter()
            .filter(|add| add.is_group_by)
            .map(|add| (add.expr.clone(), add.alias.clone()))
            .collect(),
        column_sources,
        substitute: (!compatible).then(|| n::error(INCOMPATIBLE_DIMENSIONS_MESSAGE, codes::LOD_INCOMPATIBLE_DIMENSIONS)),
    };

    let mut cropped = CompiledQuery::new(query.id.clone());
    cropped.meta = query.meta.clone();
    let none = BTreeSet::new();
    cropped.select = cropper.crop_part(query, QueryPart::Select, &none)?;
    cropped.group_by = cropper.crop_part(query, QueryPart::GroupBy, &none)?;
    cropped.order_by = cropper.crop_part(query, QueryPart::OrderBy, &none)?;
    // Filters applied by the base are not repeated.
    cropped.filters = cropper.crop_part(query, QueryPart::Filters, &base.filter_indices)?;

    let mut froms = Vec::with_capacity(masks.len());
    for mask in masks {
        let mut columns: Vec<String> = Vec::new();
        let aliases = mask
            .formula_masks
            .iter()
            .map(|formula_mask| &formula_mask.alias)
            .chain(mask.add_formulas.iter().map(|add| &add.alias));
        for alias in aliases {
            if !columns.contains(alias) {
                columns.push(alias.clone());
            }
        }
        froms.push(FromObject::Subquery {
            id: mask.subquery_id.clone(),
            alias: mask.subquery_id.clone(),
            query_id: mask.subquery_id.clone(),
            columns,
        });
    }
    if compatible {
        cropped.join_on = others.iter().filter_map(|other| make_join_on(base, other)).collect();
    }
    cropped.joined_from = JoinedFrom { froms };

    drop_needless_grouping(cropped)
}

/// When every non-dimension item is a plain sub-query column the cropped
/// query selects rows as they are.
fn drop_needless_grouping(mut query: CompiledQuery) -> Result<CompiledQuery, QueryError> {
    let gb_aliases: Vec<&str> = query.group_by.iter().filter_map(|info| info.alias.as_deref()).collect();
    let mut aggregated = None;
    for info in &query.select {
        if info.alias.as_deref().is_some_and(|alias| gb_aliases.contains(&alias)) {
            continue;
        }
        if inspect::is_constant_expression(&info.formula) {
            continue;
        }
        let is_aggregated = contains_aggregate_call(&info.formula);
        match aggregated {
            None => aggregated = Some(is_aggregated),
            Some(previous) if previous != is_aggregated => {
                return Err(QueryError::Split {
                    query_id: query.id.clone(),
                    message: format!("inconsistent aggregation of select item {}", info.formula),
                });
            }
            Some(_) => {}
        }
    }
    if aggregated == Some(false) {
        query.group_by.clear();
    }
    Ok(query)
}

/// Split `query` until no query fork is left.
///
/// The result lists the sub-queries before the queries that select from them;
/// the last query is the cropped original and keeps its id.
pub fn split_query_forks(query: CompiledQuery) -> Result<CompiledMultiQuery, QueryError> {
    let mut splitter = QueryForkSplitter::new();
    let mut queries = vec![query];
    let mut rounds = 0;
    while let Some(position) = queries.iter().position(CompiledQuery::contains_query_forks) {
        rounds += 1;
        if rounds > MAX_SPLIT_ITERATIONS {
            return Err(QueryError::SplitLimitExceeded(MAX_SPLIT_ITERATIONS));
        }
        let Some(replacement) = splitter.split(&queries[position])? else {
            break;
        };
        let tail = queries.split_off(position + 1);
        queries.pop();
        queries.extend(replacement);
        queries.extend(tail);
    }

    let errors: Vec<_> = queries
        .iter()
        .flat_map(|query| query.all_formulas())
        .flat_map(|(_, info)| collect_errors(&info.formula))
        .collect();
    if !errors.is_empty() {
        return Err(QueryError::FormulaHandling(errors));
    }
    log::debug!("split into {} queries", queries.len());
    Ok(CompiledMultiQuery { queries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::{BeforeFilterBy, LevelTag};
    use pretty_assertions::assert_eq;

    fn info(formula: NodeRef, alias: &str) -> CompiledFormulaInfo {
        CompiledFormulaInfo::new(formula)
            .with_alias(alias)
            .with_avatar_ids(["t"])
    }

    fn base_query() -> CompiledQuery {
        let mut query = CompiledQuery::new("qq");
        query.joined_from = JoinedFrom {
            froms: vec![FromObject::Table {
                id: "t".to_string(),
                alias: "t".to_string(),
                source: "orders".to_string(),
            }],
        };
        query
    }

    fn fixed_fork(result_expr: NodeRef, dims: Vec<NodeRef>, joining: Vec<NodeRef>) -> NodeRef {
        n::fork(
            JoinType::Left,
            result_expr,
            joining.into_iter().map(JoinCondition::self_eq).collect(),
            LodSpecifier::Fixed(dims),
        )
    }

    fn select_aliases(query: &CompiledQuery) -> Vec<String> {
        query.select.iter().filter_map(|info| info.alias.clone()).collect()
    }

    #[test]
    fn queries_without_forks_are_kept() {
        let mut query = base_query();
        query.select.push(info(n::func("sum", [n::field("sales")]), "res_1"));
        let multi = split_query_forks(query.clone()).expect("split");
        assert_eq!(multi.queries, vec![query]);
    }

    #[test]
    fn fork_at_query_dimensions_becomes_the_base() {
        let city = n::field("city");
        let sum = n::func("sum", [n::field("sales")]);
        let mut query = base_query();
        query.select.push(info(city.clone(), "res_1"));
        query.select.push(info(
            n::func("avg", [fixed_fork(sum.clone(), vec![city.clone()], vec![city.clone()])]),
            "res_2",
        ));
        query.group_by.push(info(city.clone(), "res_1"));
        // The outer average is forked at the query dimensions as well.
        let select = query.select[1].formula.clone();
        query.select[1].formula = fixed_fork(select, vec![city.clone()], vec![city.clone()]);

        let multi = split_query_forks(query).expect("split");
        let ids: Vec<&str> = multi.queries.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q2", "q1", "qq"]);

        let top = multi.top_query().expect("top query");
        assert_eq!(top.select[0].formula, n::field("_cp1"));
        assert_eq!(top.select[1].formula, n::field("_cp2"));
        assert!(top.group_by.is_empty());
        assert!(top.join_on.is_empty());
        assert_eq!(multi.edges(), vec![("q1", "q2"), ("qq", "q1")]);

        let middle = multi.query("q1").expect("middle query");
        assert_eq!(middle.select[0].formula, n::func("avg", [n::field("_cp4")]));
        assert_eq!(middle.group_by[0].formula, n::field("_cp3"));

        let inner = multi.query("q2").expect("inner query");
        assert_eq!(inner.select[0].formula, sum);
        assert_eq!(inner.group_by[0].formula, city);
    }

    #[test]
    fn forks_at_other_dimensions_are_joined_to_a_generated_base() {
        let city = n::field("city");
        let category = n::field("category");
        let by_city = fixed_fork(
            n::func("sum", [n::field("sales")]),
            vec![city.clone()],
            vec![city.clone()],
        );
        let total = fixed_fork(n::func("sum", [n::field("sales")]), vec![], vec![]);
        let mut query = base_query();
        query.select.push(info(city.clone(), "res_1"));
        query.select.push(info(category.clone(), "res_2"));
        query.select.push(info(n::binary("/", by_city, total), "res_3"));
        query.select.push(info(n::func("count", [n::field("sales")]), "res_4"));
        query.group_by.push(info(city.clone(), "res_1"));
        query.group_by.push(info(category.clone(), "res_2"));

        let multi = split_query_forks(query).expect("split");
        let ids: Vec<&str> = multi.queries.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["q3", "q1", "q2", "qq"]);

        let base = &multi.queries[0];
        assert_eq!(base.dimensions(), vec![city.clone(), category]);
        assert_eq!(base.select[0].formula, n::func("count", [n::field("sales")]));
        // The base also selects the dummy dimension of the total.
        assert_eq!(select_aliases(base), vec!["_cp5", "_cp6", "_cp7", "_cp8"]);

        let top = multi.top_query().expect("top query");
        assert_eq!(
            top.select[2].formula,
            n::binary("/", n::field("_cp2"), n::field("_cp4"))
        );
        assert!(top.group_by.is_empty());
        let joins: Vec<(NodeRef, JoinSpec)> = top
            .join_on
            .iter()
            .map(|info| (info.formula.clone(), info.join.clone().expect("join spec")))
            .collect();
        assert_eq!(
            joins,
            vec![
                (
                    n::binary(JOIN_EQUALITY_FUNCTION, n::field("_cp6"), n::field("_cp1")),
                    JoinSpec {
                        left_id: "q3".to_string(),
                        right_id: "q1".to_string(),
                        join_type: JoinType::Left,
                    },
                ),
                (
                    n::binary(JOIN_EQUALITY_FUNCTION, n::field("_cp8"), n::field("_cp3")),
                    JoinSpec {
                        left_id: "q3".to_string(),
                        right_id: "q2".to_string(),
                        join_type: JoinType::Left,
                    },
                ),
            ]
        );
    }

    #[test]
    fn incompatible_dimensions_are_reported() {
        let a = n::field("a");
        let b = n::field("b");
        let c = n::field("c");
        let sum = n::func("sum", [n::field("x")]);
        let mut query = base_query();
        query.select.push(info(a.clone(), "res_1"));
        query.select.push(info(
            fixed_fork(sum.clone(), vec![a.clone(), b.clone()], vec![a.clone()]),
            "res_2",
        ));
        query.select.push(info(
            fixed_fork(sum, vec![a.clone(), c.clone()], vec![a.clone()]),
            "res_3",
        ));
        query.group_by.push(info(a, "res_1"));

        let err = split_query_forks(query).expect_err("incompatible");
        let found: Vec<String> = err
            .formula_errors()
            .iter()
            .map(|err| err.code().to_string())
            .collect();
        assert_eq!(found, vec![codes::LOD_INCOMPATIBLE_DIMENSIONS.to_string(); 2]);
    }

    #[test]
    fn window_forks_are_computed_in_the_base() {
        let city = n::field("city");
        let window = FormulaItem::with_meta(
            NodeKind::Parenthesized(n::wfunc("rank", [n::func("sum", [n::field("sales")])])),
            formula_core::NodeMeta {
                level_tag: Some(LevelTag::new(Vec::<String>::new(), -1).with_qfork_nesting(1)),
                position: None,
            },
        );
        let fork = n::fork(
            JoinType::Left,
            window.clone(),
            vec![JoinCondition::self_eq(city.clone())],
            LodSpecifier::Fixed(vec![city.clone()]),
        );
        let mut query = base_query();
        query.select.push(info(city.clone(), "res_1"));
        query.select.push(info(fork, "res_2"));
        query.group_by.push(info(city.clone(), "res_1"));

        let multi = split_query_forks(query).expect("split");
        assert_eq!(multi.len(), 2);
        let sub = &multi.queries[0];
        assert_eq!(sub.select[0].formula, window);
        assert_eq!(sub.group_by[0].formula, city);
        assert_eq!(select_aliases(sub), vec!["_cp2".to_string(), "_cp1".to_string()]);

        let top = multi.top_query().expect("top query");
        assert!(top.group_by.is_empty());
        assert!(top.join_on.is_empty());
    }

    #[test]
    fn bfb_filters_stay_above_the_fork() {
        let city = n::field("city");
        let mut query = base_query();
        query.select.push(info(city.clone(), "res_1"));
        let fork = FormulaItem::new(NodeKind::QueryFork(QueryFork {
            join_type: JoinType::Left,
            result_expr: n::func("sum", [n::field("sales")]),
            joining: vec![JoinCondition::self_eq(city.clone())],
            lod: LodSpecifier::Fixed(vec![city.clone()]),
            before_filter_by: BeforeFilterBy::new(["city"]),
            bfb_filter_mutations: Vec::new(),
        }));
        query.select.push(info(fork, "res_2"));
        query.group_by.push(info(city.clone(), "res_1"));
        query.filters.push(
            CompiledFormulaInfo::new(n::binary("==", city.clone(), n::lit_str("Moscow")))
                .with_field_id("city"),
        );
        query
            .filters
            .push(CompiledFormulaInfo::new(n::binary(">", n::field("sales"), n::lit_int(0))));

        let multi = split_query_forks(query).expect("split");
        let fork_query = multi
            .queries
            .iter()
            .find(|q| q.select.iter().any(|info| info.formula == n::func("sum", [n::field("sales")])))
            .expect("fork sub-query");
        assert_eq!(fork_query.filters.len(), 1);
        assert_eq!(
            fork_query.filters[0].formula,
            n::binary(">", n::field("sales"), n::lit_int(0))
        );

        let top = multi.top_query().expect("top query");
        assert_eq!(top.filters.len(), 0);
        let base = multi.query(top.joined_from.root().map(FromObject::id).expect("root")).expect("base");
        assert_eq!(base.filters.len(), 2);
    }
}
