//! Function definition registry.
//!
//! Every function, operator and internal helper is described by a [`FunctionSpec`]
//! registered with `inventory::submit!`. Several specs may share a name; each one
//! covers its own argument-type alternatives and carries its own per-dialect
//! translation variants.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::OnceLock;

use formula_core::{DataType, DialectCombo, FormulaError, ValidationError};
use serde::Serialize;

use crate::sql::SqlExpr;
use crate::translation::TranslationCtx;

/// Availability flags of a definition.
///
/// `WINDOW` is never stored in [`FunctionSpec::scopes`]; [`FunctionSpec::all_scopes`]
/// derives it from [`FunctionSpec::is_window`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Scope(pub u32);

impl Scope {
    pub const EMPTY: Scope = Scope(0);
    pub const STABLE: Scope = Scope(1 << 0);
    pub const EXPLICIT_USAGE: Scope = Scope(1 << 1);
    pub const SUGGESTED: Scope = Scope(1 << 2);
    pub const DOCUMENTED: Scope = Scope(1 << 3);
    pub const DEPRECATED: Scope = Scope(1 << 4);
    pub const WINDOW: Scope = Scope(1 << 5);

    pub const DEFAULT: Scope = Scope(
        Self::STABLE.0 | Self::EXPLICIT_USAGE.0 | Self::SUGGESTED.0 | Self::DOCUMENTED.0,
    );
    /// Usable in formulas but neither suggested nor documented (internal join helpers).
    pub const INTERNAL: Scope = Scope(Self::STABLE.0 | Self::EXPLICIT_USAGE.0);

    pub const fn contains(self, other: Scope) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Scope {
    type Output = Scope;

    fn bitor(self, rhs: Scope) -> Scope {
        Scope(self.0 | rhs.0)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(&str, Scope); 6] = [
            ("STABLE", Scope::STABLE),
            ("EXPLICIT_USAGE", Scope::EXPLICIT_USAGE),
            ("SUGGESTED", Scope::SUGGESTED),
            ("DOCUMENTED", Scope::DOCUMENTED),
            ("DEPRECATED", Scope::DEPRECATED),
            ("WINDOW", Scope::WINDOW),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(_, scope)| self.0 & scope.0 != 0)
            .map(|(name, _)| *name)
            .collect();
        write!(f, "Scope({})", names.join(" | "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Operator,
    Logical,
    Aggregation,
    Window,
    Mathematical,
    String,
    Datetime,
    Array,
    Lookup,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Arity {
    Exact(usize),
    Range(usize, usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::Range(min, max) => (min..=max).contains(&count),
            Arity::AtLeast(min) => count >= min,
        }
    }
}

/// One alternative of accepted argument types.
#[derive(Debug, Clone, Copy)]
pub enum ArgTypeMatcher {
    /// One set of accepted types per argument position.
    Sequence(&'static [&'static [DataType]]),
    /// Every argument must be one of the given types.
    ForAll(&'static [DataType]),
    /// Like `ForAll`, and at least one argument must have exactly one of the
    /// `required` types (`ARRAY(NULL, NULL)` has no element type to go by).
    ForAllRequiring {
        allowed: &'static [DataType],
        required: &'static [DataType],
    },
    Any,
}

impl ArgTypeMatcher {
    pub fn matches(&self, arg_types: &[DataType]) -> bool {
        let accepts =
            |actual: DataType, allowed: &[DataType]| allowed.iter().any(|t| actual.casts_to(*t));
        match self {
            ArgTypeMatcher::Sequence(positions) => {
                positions.len() == arg_types.len()
                    && arg_types
                        .iter()
                        .zip(positions.iter())
                        .all(|(actual, allowed)| accepts(*actual, allowed))
            }
            ArgTypeMatcher::ForAll(allowed) => {
                arg_types.iter().all(|actual| accepts(*actual, allowed))
            }
            ArgTypeMatcher::ForAllRequiring { allowed, required } => {
                arg_types.iter().all(|actual| accepts(*actual, allowed))
                    && arg_types.iter().any(|actual| required.contains(actual))
            }
            ArgTypeMatcher::Any => true,
        }
    }
}

#[derive(Clone, Copy)]
pub enum ReturnType {
    Fixed(DataType),
    /// Type of the argument at the given position.
    FromArgs(usize),
    /// Type and type params (timezone) of the argument at the given position.
    ParamsFromArgs(usize),
    Derived(fn(&[DataType]) -> DataType),
}

impl ReturnType {
    /// Position of the argument whose type params the result carries.
    pub fn params_source(self) -> Option<usize> {
        match self {
            ReturnType::ParamsFromArgs(idx) => Some(idx),
            _ => None,
        }
    }
}

impl fmt::Debug for ReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnType::Fixed(t) => write!(f, "Fixed({t})"),
            ReturnType::FromArgs(idx) => write!(f, "FromArgs({idx})"),
            ReturnType::ParamsFromArgs(idx) => write!(f, "ParamsFromArgs({idx})"),
            ReturnType::Derived(_) => f.write_str("Derived"),
        }
    }
}

pub type TranslateFn = fn(&[TranslationCtx]) -> Result<SqlExpr, FormulaError>;

/// A translation valid for a set of dialects.
#[derive(Clone, Copy)]
pub struct TranslationVariant {
    pub dialects: DialectCombo,
    pub translate: TranslateFn,
}

impl TranslationVariant {
    pub const fn new(dialects: DialectCombo, translate: TranslateFn) -> Self {
        TranslationVariant {
            dialects,
            translate,
        }
    }
}

impl fmt::Debug for TranslationVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TranslationVariant({})", self.dialects)
    }
}

#[derive(Debug)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub arg_names: &'static [&'static str],
    pub arity: Arity,
    pub category: Category,
    /// Window definitions are looked up only for window calls.
    pub is_window: bool,
    pub scopes: Scope,
    pub argument_types: &'static [ArgTypeMatcher],
    pub return_type: ReturnType,
    pub variants: &'static [TranslationVariant],
    /// Window calls without explicit ordering get the query's default ordering.
    pub uses_default_ordering: bool,
    /// Order among definitions sharing a name; lower is tried first.
    pub priority: u16,
}

impl FunctionSpec {
    pub const DEFAULT: FunctionSpec = FunctionSpec {
        name: "",
        arg_names: &[],
        arity: Arity::AtLeast(0),
        category: Category::Mathematical,
        is_window: false,
        scopes: Scope::DEFAULT,
        argument_types: &[ArgTypeMatcher::Any],
        return_type: ReturnType::Fixed(DataType::Null),
        variants: &[],
        uses_default_ordering: false,
        priority: 0,
    };

    pub fn is_aggregate(&self) -> bool {
        self.category == Category::Aggregation && !self.is_window
    }

    pub fn is_lookup(&self) -> bool {
        self.category == Category::Lookup
    }

    /// Declared scopes plus `WINDOW` for window definitions.
    pub fn all_scopes(&self) -> Scope {
        if self.is_window {
            self.scopes | Scope::WINDOW
        } else {
            self.scopes
        }
    }

    pub fn matches_types(&self, arg_types: &[DataType]) -> bool {
        self.argument_types.iter().any(|m| m.matches(arg_types))
    }

    /// Union of the dialects any variant covers.
    pub fn supported_dialects(&self) -> DialectCombo {
        self.variants
            .iter()
            .fold(DialectCombo::EMPTY, |acc, v| acc | v.dialects)
    }

    /// Return type for the given (matching) argument types.
    ///
    /// Plain functions of constants produce constants; aggregations and window
    /// functions never do.
    pub fn return_type_for(&self, arg_types: &[DataType]) -> DataType {
        let base = match self.return_type {
            ReturnType::Fixed(t) => t,
            ReturnType::FromArgs(idx) | ReturnType::ParamsFromArgs(idx) => arg_types
                .get(idx)
                .copied()
                .unwrap_or(DataType::Null)
                .non_const(),
            ReturnType::Derived(derive) => derive(arg_types).non_const(),
        };
        let const_result = !self.is_window
            && self.category != Category::Aggregation
            && !arg_types.is_empty()
            && arg_types.iter().all(|t| t.is_const());
        if const_result {
            base.const_version()
        } else {
            base
        }
    }

    /// Pick the variant for `dialect`.
    ///
    /// Among variants explicitly naming the dialect the one with the fewest dialects
    /// wins; otherwise a `DUMMY`-covering variant is the fallback.
    pub fn select_variant(&self, dialect: DialectCombo) -> Option<&'static TranslationVariant> {
        let variants: &'static [TranslationVariant] = self.variants;
        let specific = variants
            .iter()
            .filter(|v| !v.dialects.contains(DialectCombo::DUMMY) && v.dialects.matches(dialect))
            .min_by_key(|v| v.dialects.len());
        specific.or_else(|| {
            variants
                .iter()
                .find(|v| v.dialects.contains(DialectCombo::DUMMY))
        })
    }
}

inventory::collect!(FunctionSpec);

/// Iterate all [`FunctionSpec`] registrations collected via [`inventory`].
pub fn iter_function_specs() -> impl Iterator<Item = &'static FunctionSpec> {
    inventory::iter::<FunctionSpec>.into_iter()
}

type RegistryKey = (String, bool);

fn registry() -> &'static HashMap<RegistryKey, Vec<&'static FunctionSpec>> {
    static REGISTRY: OnceLock<HashMap<RegistryKey, Vec<&'static FunctionSpec>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<RegistryKey, Vec<&'static FunctionSpec>> = HashMap::new();
        for spec in inventory::iter::<FunctionSpec> {
            map.entry((spec.name.to_ascii_lowercase(), spec.is_window))
                .or_default()
                .push(spec);
        }
        for specs in map.values_mut() {
            specs.sort_by_key(|spec| spec.priority);
        }
        log::debug!("function registry initialized with {} names", map.len());
        map
    })
}

/// All definitions registered under `name` (case-insensitive), in dispatch order.
pub fn lookup_definitions(name: &str, is_window: bool) -> &'static [&'static FunctionSpec] {
    registry()
        .get(&(name.to_ascii_lowercase(), is_window))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

pub fn is_aggregate_function(name: &str) -> bool {
    lookup_definitions(name, false)
        .iter()
        .any(|spec| spec.is_aggregate())
}

pub fn is_lookup_function(name: &str) -> bool {
    lookup_definitions(name, false)
        .iter()
        .any(|spec| spec.is_lookup())
}

pub fn uses_default_ordering(name: &str) -> bool {
    lookup_definitions(name, true)
        .iter()
        .any(|spec| spec.uses_default_ordering)
}

/// Outcome of dispatching one call.
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub spec: &'static FunctionSpec,
    pub variant: &'static TranslationVariant,
    pub return_type: DataType,
}

/// Find the definition and translation variant for a call.
///
/// Definitions are filtered by scope and arity, then the first one whose
/// argument-type alternatives accept `arg_types` is used.
pub fn resolve(
    name: &str,
    arg_types: &[DataType],
    is_window: bool,
    dialect: DialectCombo,
    required_scopes: Scope,
) -> Result<Resolution, FormulaError> {
    let definitions: Vec<&'static FunctionSpec> = lookup_definitions(name, is_window)
        .iter()
        .copied()
        .filter(|spec| spec.all_scopes().contains(required_scopes))
        .collect();
    if definitions.is_empty() {
        return Err(FormulaError::UnknownFunction(name.to_string()));
    }

    let by_arity: Vec<&'static FunctionSpec> = definitions
        .into_iter()
        .filter(|spec| spec.arity.accepts(arg_types.len()))
        .collect();
    if by_arity.is_empty() {
        return Err(ValidationError::ArgCount {
            name: name.to_string(),
            got: arg_types.len(),
        }
        .into());
    }

    let spec = by_arity
        .into_iter()
        .find(|spec| spec.matches_types(arg_types))
        .ok_or_else(|| FormulaError::TranslationNotFound {
            name: name.to_string(),
            arg_types: arg_types.to_vec(),
        })?;

    let variant =
        spec.select_variant(dialect)
            .ok_or_else(|| FormulaError::DialectNotSupported {
                name: name.to_string(),
                dialect,
            })?;

    log::trace!("resolved {name} for {dialect} via {variant:?}");
    Ok(Resolution {
        spec,
        variant,
        return_type: spec.return_type_for(arg_types),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use formula_core::codes;
    use pretty_assertions::assert_eq;

    fn translate_stub(_: &[TranslationCtx]) -> Result<SqlExpr, FormulaError> {
        Ok(SqlExpr::raw("stub"))
    }

    static VARIANTS: [TranslationVariant; 3] = [
        TranslationVariant::new(DialectCombo::DUMMY, translate_stub),
        TranslationVariant::new(DialectCombo::POSTGRESQL, translate_stub),
        TranslationVariant::new(DialectCombo::POSTGRESQL_9_4, translate_stub),
    ];

    static SPEC: FunctionSpec = FunctionSpec {
        name: "sample",
        variants: &VARIANTS,
        ..FunctionSpec::DEFAULT
    };

    #[test]
    fn most_specific_variant_wins() {
        let variant = SPEC
            .select_variant(DialectCombo::POSTGRESQL_9_4)
            .expect("variant");
        assert_eq!(variant.dialects, DialectCombo::POSTGRESQL_9_4);

        let variant = SPEC
            .select_variant(DialectCombo::POSTGRESQL_9_3)
            .expect("variant");
        assert_eq!(variant.dialects, DialectCombo::POSTGRESQL);
    }

    #[test]
    fn falls_back_to_dummy() {
        let variant = SPEC.select_variant(DialectCombo::MSSQL).expect("variant");
        assert_eq!(variant.dialects, DialectCombo::DUMMY);
    }

    #[test]
    fn arity_bounds() {
        assert!(Arity::Range(2, 4).accepts(3));
        assert!(!Arity::Range(2, 4).accepts(5));
        assert!(Arity::AtLeast(1).accepts(7));
        assert!(!Arity::Exact(1).accepts(0));
    }

    #[test]
    fn sequence_matcher_honours_casts() {
        let matcher = ArgTypeMatcher::Sequence(&[&[DataType::Float], &[DataType::ConstString]]);
        assert!(matcher.matches(&[DataType::Integer, DataType::ConstString]));
        assert!(!matcher.matches(&[DataType::Integer, DataType::String]));
        assert!(!matcher.matches(&[DataType::Integer]));
    }

    static CLICKHOUSE_VARIANTS: [TranslationVariant; 1] =
        [TranslationVariant::new(DialectCombo::CLICKHOUSE, translate_stub)];

    inventory::submit! {
        FunctionSpec {
            name: "_clickhouse_only",
            arity: Arity::Exact(1),
            return_type: ReturnType::FromArgs(0),
            variants: &CLICKHOUSE_VARIANTS,
            scopes: Scope::INTERNAL,
            ..FunctionSpec::DEFAULT
        }
    }

    #[test]
    fn definition_without_a_variant_for_the_dialect() {
        let err = resolve(
            "_clickhouse_only",
            &[DataType::Integer],
            false,
            DialectCombo::POSTGRESQL_9_4,
            Scope::EXPLICIT_USAGE,
        )
        .expect_err("no postgresql variant");
        assert_eq!(err.code(), codes::DIALECT_NOT_SUPPORTED);

        let resolution = resolve(
            "_clickhouse_only",
            &[DataType::Integer],
            false,
            DialectCombo::CLICKHOUSE_21_8,
            Scope::EXPLICIT_USAGE,
        )
        .expect("clickhouse variant");
        assert_eq!(resolution.variant.dialects, DialectCombo::CLICKHOUSE);
        assert_eq!(resolution.return_type, DataType::Integer);
    }

    #[test]
    fn window_scope_comes_from_the_definition_kind() {
        let rsum = lookup_definitions("rsum", true);
        assert!(!rsum.is_empty());
        assert!(rsum.iter().all(|spec| spec.all_scopes().contains(Scope::WINDOW)));
        assert!(rsum.iter().all(|spec| !spec.scopes.contains(Scope::WINDOW)));

        let sum = lookup_definitions("sum", false);
        assert!(!sum.is_empty());
        assert!(sum.iter().all(|spec| !spec.all_scopes().contains(Scope::WINDOW)));

        assert!(resolve("rsum", &[DataType::Integer], true, DialectCombo::DUMMY, Scope::WINDOW).is_ok());
        assert!(resolve("sum", &[DataType::Integer], false, DialectCombo::DUMMY, Scope::WINDOW).is_err());
    }

    #[test]
    fn for_all_requiring_matcher() {
        let matcher = ArgTypeMatcher::ForAllRequiring {
            allowed: &[DataType::ConstInteger, DataType::Null],
            required: &[DataType::ConstInteger],
        };
        assert!(matcher.matches(&[DataType::ConstInteger, DataType::ConstNull]));
        assert!(!matcher.matches(&[DataType::ConstNull, DataType::ConstNull]));
        assert!(!matcher.matches(&[DataType::ConstInteger, DataType::Integer]));
    }
}
