use formula_core::FormulaError;

fn format_errors(errors: &[FormulaError]) -> String {
    errors
        .iter()
        .map(|err| format!("{} ({})", err, err.code()))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// One or more formulas of the query could not be compiled.
    #[error("failed to compile formulas: {}", format_errors(.0))]
    FormulaHandling(Vec<FormulaError>),

    #[error("unknown avatar `{0}`")]
    UnknownAvatar(String),

    #[error("avatar `{0}` is registered twice")]
    DuplicateAvatar(String),

    #[error("field `{0}` is registered twice")]
    DuplicateField(String),

    #[error("no join condition connects `{0}` to the query")]
    MissingJoin(String),

    #[error("query `{0}` is referenced before it is defined")]
    UnknownQuery(String),

    #[error("query splitting did not finish after {0} rounds")]
    SplitLimitExceeded(usize),

    /// Internal inconsistency while cutting a query into sub-queries.
    #[error("failed to split query `{query_id}`: {message}")]
    Split { query_id: String, message: String },

    #[error("failed to translate query `{query_id}`: {source}")]
    Translation {
        query_id: String,
        #[source]
        source: FormulaError,
    },
}

impl QueryError {
    /// The formula errors carried by this error, if any.
    pub fn formula_errors(&self) -> Vec<&FormulaError> {
        match self {
            QueryError::FormulaHandling(errors) => errors.iter().collect(),
            QueryError::Translation { source, .. } => vec![source],
            _ => Vec::new(),
        }
    }
}

impl From<FormulaError> for QueryError {
    fn from(err: FormulaError) -> Self {
        QueryError::FormulaHandling(vec![err])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::codes;
    use pretty_assertions::assert_eq;

    #[test]
    fn formula_handling_lists_every_error() {
        let err = QueryError::FormulaHandling(vec![
            FormulaError::UnknownField("a".to_string()),
            FormulaError::UnknownField("b".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            format!(
                "failed to compile formulas: unknown field: a ({0}); unknown field: b ({0})",
                codes::UNKNOWN_FIELD
            )
        );
        assert_eq!(err.formula_errors().len(), 2);
    }
}
