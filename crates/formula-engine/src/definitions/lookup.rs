//! Lookup functions. They are never translated directly: the lookup mutation turns
//! every call into a query fork before translation, so the variants only report
//! a call that slipped through.

use formula_core::{DialectCombo as D, FormulaError};

use crate::definitions::{ANY_TYPE, CONST_STRINGS, DATELIKE, INTEGERS};
use crate::registry::{
    ArgTypeMatcher as M, Arity, Category, FunctionSpec, ReturnType, TranslationVariant as V,
};
use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

fn not_forked(_: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
    Err(FormulaError::UnsupportedNode(
        "lookup function must be converted to a query fork before translation".to_string(),
    ))
}

const LOOKUP: FunctionSpec = FunctionSpec {
    category: Category::Lookup,
    return_type: ReturnType::FromArgs(0),
    variants: &[V::new(D::ANY, not_forked)],
    ..FunctionSpec::DEFAULT
};

inventory::submit! {
    FunctionSpec {
        name: "ago",
        arg_names: &["measure", "date_dimension", "unit", "number"],
        arity: Arity::Range(2, 4),
        argument_types: &[
            M::Sequence(&[ANY_TYPE, DATELIKE]),
            M::Sequence(&[ANY_TYPE, DATELIKE, CONST_STRINGS]),
            M::Sequence(&[ANY_TYPE, DATELIKE, INTEGERS]),
            M::Sequence(&[ANY_TYPE, DATELIKE, CONST_STRINGS, INTEGERS]),
        ],
        ..LOOKUP
    }
}

inventory::submit! {
    FunctionSpec {
        name: "at_date",
        arg_names: &["measure", "date_dimension", "date_expr"],
        arity: Arity::Exact(3),
        argument_types: &[M::Sequence(&[ANY_TYPE, DATELIKE, DATELIKE])],
        ..LOOKUP
    }
}
