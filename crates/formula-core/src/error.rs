use thiserror::Error;

use crate::datatype::DataType;
use crate::dialect::DialectCombo;

/// Stable error codes carried by `Error` nodes and reported to callers.
pub mod codes {
    pub const TRANSLATION_NOT_FOUND: &str = "FORMULA.TRANSLATION.NOT_FOUND";
    pub const DIALECT_NOT_SUPPORTED: &str = "FORMULA.TRANSLATION.DIALECT_NOT_SUPPORTED";
    pub const UNKNOWN_FUNCTION: &str = "FORMULA.TRANSLATION.UNKNOWN_FUNCTION";
    pub const UNKNOWN_FIELD: &str = "FORMULA.UNKNOWN_FIELD";
    pub const INCONSISTENT_AGGREGATION: &str = "FORMULA.VALIDATION.AGG.INCONSISTENT";
    pub const DOUBLE_AGGREGATION: &str = "FORMULA.VALIDATION.AGG.DOUBLE";
    pub const UNKNOWN_TIME_UNIT: &str = "FORMULA.VALIDATION.UNKNOWN_TIME_UNIT";
    pub const ARG_COUNT: &str = "FORMULA.VALIDATION.ARG_COUNT";
    pub const LOD_INVALID_TOPLEVEL_DIMENSIONS: &str = "FORMULA.VALIDATION.LOD.INVALID_TOPLEVEL";
    pub const LOD_INCOMPATIBLE_DIMENSIONS: &str = "FORMULA.VALIDATION.LOD.INCOMPATIBLE_DIMENSIONS";
    pub const LOOKUP_ARG_NUMBER: &str = "FORMULA.VALIDATION.LOOKUP_FUNC.ARG_NUMBER";
    pub const LOOKUP_WO_AGGREGATION: &str = "FORMULA.VALIDATION.LOOKUP_FUNC.WO_AGGREGATION";
    pub const LOOKUP_AGGREGATED_DIMENSION: &str =
        "FORMULA.VALIDATION.LOOKUP_FUNC.AGGREGATED_DIMENSION";
    pub const LOOKUP_IGNORED_DIMENSION: &str = "FORMULA.VALIDATION.LOOKUP_FUNC.IGNORED_DIMENSION";
    pub const LOOKUP_CONSTANT_DIMENSION: &str = "FORMULA.VALIDATION.LOOKUP_FUNC.CONSTANT_DIMENSION";
    pub const LOOKUP_UNSELECTED_DIMENSION: &str =
        "FORMULA.VALIDATION.LOOKUP_FUNC.UNSELECTED_DIMENSION";
    pub const UNSUPPORTED_NODE: &str = "FORMULA.TRANSLATION.UNSUPPORTED_NODE";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("inconsistent aggregation: {0}")]
    InconsistentAggregation(String),
    #[error("double aggregation is not allowed here: {0}")]
    DoubleAggregation(String),
    #[error("unknown time unit: {0}")]
    UnknownTimeUnit(String),
    #[error("invalid number of arguments for function {name}: {got}")]
    ArgCount { name: String, got: usize },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InconsistentAggregation(_) => codes::INCONSISTENT_AGGREGATION,
            ValidationError::DoubleAggregation(_) => codes::DOUBLE_AGGREGATION,
            ValidationError::UnknownTimeUnit(_) => codes::UNKNOWN_TIME_UNIT,
            ValidationError::ArgCount { .. } => codes::ARG_COUNT,
        }
    }
}

fn format_arg_types(arg_types: &[DataType]) -> String {
    arg_types
        .iter()
        .map(|t| t.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("unknown dialect: {0}")]
    UnknownDialect(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("no translation found for {name}({})", format_arg_types(.arg_types))]
    TranslationNotFound {
        name: String,
        arg_types: Vec<DataType>,
    },

    #[error("function {name} is not supported for dialect {dialect}")]
    DialectNotSupported { name: String, dialect: DialectCombo },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    LodInvalidTopLevelDimensions(String),

    #[error("{0}")]
    LodIncompatibleDimensions(String),

    #[error("unknown field: {0}")]
    UnknownField(String),

    /// An `Error` node that survived mutation and reached a point where it must be reported.
    #[error("{message}")]
    ErrorNode { code: String, message: String },

    #[error("unsupported node for translation: {0}")]
    UnsupportedNode(String),
}

impl FormulaError {
    pub fn code(&self) -> &str {
        match self {
            FormulaError::UnknownDialect(_) => codes::DIALECT_NOT_SUPPORTED,
            FormulaError::UnknownFunction(_) => codes::UNKNOWN_FUNCTION,
            FormulaError::TranslationNotFound { .. } => codes::TRANSLATION_NOT_FOUND,
            FormulaError::DialectNotSupported { .. } => codes::DIALECT_NOT_SUPPORTED,
            FormulaError::Validation(err) => err.code(),
            FormulaError::LodInvalidTopLevelDimensions(_) => codes::LOD_INVALID_TOPLEVEL_DIMENSIONS,
            FormulaError::LodIncompatibleDimensions(_) => codes::LOD_INCOMPATIBLE_DIMENSIONS,
            FormulaError::UnknownField(_) => codes::UNKNOWN_FIELD,
            FormulaError::ErrorNode { code, .. } => code,
            FormulaError::UnsupportedNode(_) => codes::UNSUPPORTED_NODE,
        }
    }

    /// Rebuild the specific error variant for an `Error` node code where one exists.
    pub fn from_error_node(code: &str, message: &str) -> Self {
        match code {
            codes::LOD_INCOMPATIBLE_DIMENSIONS => {
                FormulaError::LodIncompatibleDimensions(message.to_string())
            }
            _ => FormulaError::ErrorNode {
                code: code.to_string(),
                message: message.to_string(),
            },
        }
    }
}
