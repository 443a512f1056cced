//! Lookup functions (`AGO`, `AT_DATE`) become query forks joined on shifted dates.

use formula_core::shortcuts as n;
use formula_core::{
    codes, BeforeFilterBy, BfbFilterMutation, FormulaItem, FuncCall, JoinCondition, JoinType,
    LiteralValue, LodSpecifier, NodeKind, NodeRef, QueryFork,
};

use crate::inspect;
use crate::mutation::FormulaMutation;

const MONTH_BASED_UNITS: &[&str] = &["month", "quarter", "year"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupKind {
    Ago,
    AtDate,
}

impl LookupKind {
    fn of(call: &FuncCall) -> Option<LookupKind> {
        match call.name.to_ascii_lowercase().as_str() {
            "ago" => Some(LookupKind::Ago),
            "at_date" => Some(LookupKind::AtDate),
            _ => None,
        }
    }

    fn supports_arg_count(self, count: usize) -> bool {
        match self {
            LookupKind::Ago => (2..=4).contains(&count),
            LookupKind::AtDate => count == 3,
        }
    }

    fn lookup_conditions(self, args: &[NodeRef]) -> Vec<JoinCondition> {
        let dimension = &args[1];
        match self {
            LookupKind::Ago => {
                let shifted = shifted_dimension(dimension, &args[2..]);
                let mut conditions = vec![JoinCondition::binary(dimension.clone(), shifted)];
                // Month lengths differ, so month-based shifts must also keep the day.
                if MONTH_BASED_UNITS.contains(&unit_name(&args[2..]).as_str()) {
                    let day = n::func("day", [dimension.clone()]);
                    conditions.push(JoinCondition::binary(day.clone(), day));
                }
                conditions
            }
            LookupKind::AtDate => vec![JoinCondition::binary(args[2].clone(), dimension.clone())],
        }
    }

    fn bfb_filter_mutations(self, args: &[NodeRef]) -> Vec<BfbFilterMutation> {
        match self {
            LookupKind::Ago => vec![BfbFilterMutation {
                original: args[1].clone(),
                replacement: shifted_dimension(&args[1], &args[2..]),
            }],
            LookupKind::AtDate => Vec::new(),
        }
    }
}

fn shifted_dimension(dimension: &NodeRef, shift_args: &[NodeRef]) -> NodeRef {
    n::func(
        "dateadd",
        std::iter::once(dimension.clone()).chain(shift_args.iter().cloned()),
    )
}

fn unit_name(shift_args: &[NodeRef]) -> String {
    shift_args
        .iter()
        .find_map(|arg| match arg.literal() {
            Some(LiteralValue::String(unit)) => Some(unit.to_ascii_lowercase()),
            _ => None,
        })
        .unwrap_or_else(|| "day".to_string())
}

fn arg_count_error(call: &FuncCall) -> NodeRef {
    n::error(
        format!(
            "Invalid number of arguments for function {}: {}. Either 2, 3 or 4 are needed.",
            call.name.to_ascii_uppercase(),
            call.args.len()
        ),
        codes::LOOKUP_ARG_NUMBER,
    )
}

fn lookup_call(node: &NodeRef) -> Option<(&FuncCall, LookupKind)> {
    let call = node.func_call()?;
    Some((call, LookupKind::of(call)?))
}

/// Replaces every lookup call with a left-joined fork over the query's dimensions.
pub struct LookupFunctionToQueryForkMutation {
    global_dimensions: Vec<NodeRef>,
    allow_empty_dimensions: bool,
}

impl LookupFunctionToQueryForkMutation {
    pub fn new(global_dimensions: Vec<NodeRef>, allow_empty_dimensions: bool) -> Self {
        LookupFunctionToQueryForkMutation {
            global_dimensions,
            allow_empty_dimensions,
        }
    }

    fn convert(&self, call: &FuncCall, kind: LookupKind, parent_stack: &[NodeRef]) -> NodeRef {
        let name = call.name.to_ascii_uppercase();
        if !kind.supports_arg_count(call.args.len()) {
            return arg_count_error(call);
        }

        let result_expr = call.args[0].clone();
        if !inspect::is_aggregate_expression(&result_expr) {
            return n::error(
                format!("Result expression of function {name} is not aggregated."),
                codes::LOOKUP_WO_AGGREGATION,
            );
        }

        let lookup_dimension = &call.args[1];
        let lookup_conditions = kind.lookup_conditions(&call.args);
        if inspect::is_aggregate_expression(lookup_dimension) {
            return n::error(
                format!("The lookup dimension of function {name} is an aggregation."),
                codes::LOOKUP_AGGREGATED_DIMENSION,
            );
        }
        if call.ignore_dimensions.contains(lookup_dimension) {
            return n::error(
                format!("Cannot ignore lookup dimension of function {name}"),
                codes::LOOKUP_IGNORED_DIMENSION,
            );
        }
        let uses_fields = lookup_conditions.iter().any(|condition| {
            condition
                .expressions()
                .into_iter()
                .any(|expr| !inspect::used_fields(expr).is_empty())
        });
        if !uses_fields {
            return n::error(
                format!("Cannot use a constant expression as lookup dimension of function {name}"),
                codes::LOOKUP_CONSTANT_DIMENSION,
            );
        }

        let dimensions = inspect::context_dimensions(&self.global_dimensions, parent_stack);
        let mut joining = Vec::with_capacity(dimensions.len() + 1);
        let mut found_lookup_dimension = false;
        for dimension in &dimensions {
            if call.ignore_dimensions.contains(dimension) {
                continue;
            }
            if dimension == lookup_dimension {
                found_lookup_dimension = true;
                joining.extend(lookup_conditions.iter().cloned());
            } else {
                joining.push(JoinCondition::self_eq(dimension.clone()));
            }
        }

        if (!self.allow_empty_dimensions || !dimensions.is_empty()) && !found_lookup_dimension {
            return n::error(
                format!(
                    "Invalid dimension for function {name}. \
                     It must be explicitly used in the data request as a dimension."
                ),
                codes::LOOKUP_UNSELECTED_DIMENSION,
            );
        }

        FormulaItem::new(NodeKind::QueryFork(QueryFork {
            join_type: JoinType::Left,
            result_expr,
            joining,
            lod: LodSpecifier::Inherited,
            before_filter_by: call.before_filter_by.clone(),
            bfb_filter_mutations: kind.bfb_filter_mutations(&call.args),
        }))
    }
}

impl FormulaMutation for LookupFunctionToQueryForkMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        lookup_call(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, parent_stack: &[NodeRef]) -> NodeRef {
        match lookup_call(old) {
            Some((call, kind)) => self.convert(call, kind, parent_stack),
            None => old.clone(),
        }
    }
}

/// Adds a field lookup dimension to the call's `BEFORE FILTER BY` set.
pub struct LookupDefaultBfbMutation;

impl FormulaMutation for LookupDefaultBfbMutation {
    fn match_node(&self, node: &NodeRef, _: &[NodeRef]) -> bool {
        lookup_call(node).is_some()
    }

    fn make_replacement(&self, old: &NodeRef, _: &[NodeRef]) -> NodeRef {
        let Some((call, kind)) = lookup_call(old) else {
            return old.clone();
        };
        if !kind.supports_arg_count(call.args.len()) {
            return arg_count_error(call);
        }
        let Some(dimension_name) = call.args[1].field_name() else {
            return old.clone();
        };
        if call.before_filter_by.contains(dimension_name) {
            return old.clone();
        }
        let mut names = call.before_filter_by.0.clone();
        names.insert(dimension_name.to_string());
        FormulaItem::with_meta(
            NodeKind::FuncCall(FuncCall {
                before_filter_by: BeforeFilterBy(names),
                ..call.clone()
            }),
            old.meta.clone(),
        )
    }
}
