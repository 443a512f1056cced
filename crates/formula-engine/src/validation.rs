//! Aggregation consistency checks.

use formula_core::{NodeKind, NodeRef, ValidationError};

use crate::inspect;

/// How an expression relates to the query's grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggState {
    Constant,
    /// Built only from group-by dimensions.
    Dimension,
    Aggregated,
    /// Uses row-level fields that are not dimensions.
    Unaggregated,
}

impl AggState {
    fn combine(states: &[AggState]) -> Result<AggState, ()> {
        let any = |state: AggState| states.contains(&state);
        if any(AggState::Aggregated) && any(AggState::Unaggregated) {
            return Err(());
        }
        Ok(if any(AggState::Aggregated) {
            AggState::Aggregated
        } else if any(AggState::Unaggregated) {
            AggState::Unaggregated
        } else if any(AggState::Dimension) {
            AggState::Dimension
        } else {
            AggState::Constant
        })
    }
}

/// Checks that a formula does not mix aggregated and row-level values.
#[derive(Debug, Clone)]
pub struct AggregationChecker<'a> {
    dimensions: &'a [NodeRef],
    allow_nested_aggregation: bool,
}

impl<'a> AggregationChecker<'a> {
    pub fn new(dimensions: &'a [NodeRef]) -> Self {
        AggregationChecker {
            dimensions,
            allow_nested_aggregation: true,
        }
    }

    pub fn allow_nested_aggregation(mut self, allow: bool) -> Self {
        self.allow_nested_aggregation = allow;
        self
    }

    pub fn check(&self, node: &NodeRef) -> Result<AggState, ValidationError> {
        self.state(node, false)
    }

    fn state(&self, node: &NodeRef, inside_aggregation: bool) -> Result<AggState, ValidationError> {
        if self.dimensions.contains(node) {
            return Ok(AggState::Dimension);
        }
        match &node.kind {
            NodeKind::Literal(_) => Ok(AggState::Constant),
            NodeKind::Field { .. } => Ok(AggState::Unaggregated),
            NodeKind::QueryFork(_) => Ok(AggState::Aggregated),
            NodeKind::FuncCall(call) if inspect::is_aggregate_function(node) => {
                if inside_aggregation && !self.allow_nested_aggregation {
                    return Err(ValidationError::DoubleAggregation(node.to_string()));
                }
                for arg in &call.args {
                    self.state(arg, true)?;
                }
                Ok(AggState::Aggregated)
            }
            NodeKind::WindowFuncCall(call) => {
                for arg in &call.args {
                    self.state(arg, inside_aggregation)?;
                }
                Ok(AggState::Aggregated)
            }
            _ => {
                let states = node
                    .autonomous_children()
                    .iter()
                    .map(|child| self.state(child, inside_aggregation))
                    .collect::<Result<Vec<_>, _>>()?;
                // Inside an aggregation everything collapses to one value per group.
                if inside_aggregation {
                    return Ok(AggState::combine(&states).unwrap_or(AggState::Aggregated));
                }
                AggState::combine(&states)
                    .map_err(|()| ValidationError::InconsistentAggregation(node.to_string()))
            }
        }
    }
}

/// Whether `node` mixes aggregated and row-level values at the given grouping.
pub fn contains_inconsistent_aggregations(node: &NodeRef, dimensions: &[NodeRef]) -> bool {
    matches!(
        AggregationChecker::new(dimensions).check(node),
        Err(ValidationError::InconsistentAggregation(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::shortcuts as n;
    use pretty_assertions::assert_eq;

    #[test]
    fn dimensions_mix_with_aggregations() {
        let dims = [n::field("city")];
        let checker = AggregationChecker::new(&dims);
        let node = n::binary(
            "+",
            n::func("upper", [n::field("city")]),
            n::func("str", [n::func("sum", [n::field("sales")])]),
        );
        assert_eq!(checker.check(&node), Ok(AggState::Aggregated));
        assert_eq!(checker.check(&n::field("city")), Ok(AggState::Dimension));
        assert_eq!(checker.check(&n::lit_int(1)), Ok(AggState::Constant));
    }

    #[test]
    fn row_level_field_next_to_aggregation_is_rejected() {
        let node = n::binary("*", n::field("price"), n::func("sum", [n::field("qty")]));
        assert!(contains_inconsistent_aggregations(&node, &[]));
        assert!(!contains_inconsistent_aggregations(&node, &[n::field("price")]));
    }

    #[test]
    fn nested_aggregation_can_be_forbidden() {
        let node = n::func("avg", [n::func("sum", [n::field("x")])]);
        assert!(AggregationChecker::new(&[]).check(&node).is_ok());
        assert_eq!(
            AggregationChecker::new(&[])
                .allow_nested_aggregation(false)
                .check(&node)
                .map_err(|err| err.code()),
            Err(formula_core::codes::DOUBLE_AGGREGATION)
        );
    }
}
