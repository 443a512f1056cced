//! Compilation settings.

use formula_core::DialectCombo;
use serde::{Deserialize, Serialize};

/// Switches for one compilation request.
///
/// Deserializes from a partial object; missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    pub dialect: DialectCombo,
    /// Skip constant folding and the other simplifications (validation mode).
    pub disable_optimizations: bool,
    /// Allow lookup forks in queries without dimensions.
    pub allow_empty_dimensions: bool,
    /// Allow top-level LOD aggregations with dimensions the query does not group by.
    pub allow_arbitrary_toplevel_lod_dimensions: bool,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        CompilerSettings {
            dialect: DialectCombo::DUMMY,
            disable_optimizations: false,
            allow_empty_dimensions: false,
            allow_arbitrary_toplevel_lod_dimensions: false,
        }
    }
}

impl CompilerSettings {
    pub fn new(dialect: DialectCombo) -> Self {
        CompilerSettings {
            dialect,
            ..CompilerSettings::default()
        }
    }

    pub fn with_disabled_optimizations(mut self, disable: bool) -> Self {
        self.disable_optimizations = disable;
        self
    }

    pub fn with_empty_dimensions(mut self, allow: bool) -> Self {
        self.allow_empty_dimensions = allow;
        self
    }

    pub fn with_arbitrary_toplevel_lod_dimensions(mut self, allow: bool) -> Self {
        self.allow_arbitrary_toplevel_lod_dimensions = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_json_uses_defaults() {
        let settings: CompilerSettings =
            serde_json::from_str(r#"{"dialect": "POSTGRESQL_9_4", "allow_empty_dimensions": true}"#)
                .expect("valid settings");
        assert_eq!(
            settings,
            CompilerSettings::new(DialectCombo::POSTGRESQL_9_4).with_empty_dimensions(true)
        );
    }
}
