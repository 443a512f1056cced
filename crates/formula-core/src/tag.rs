use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Level marker attached to window-function nodes by the tagging pass.
///
/// `bfb_names` is the effective before-filter-by set at the node, `func_nesting` is the
/// node's depth relative to the innermost call sharing the same `bfb_names` (innermost
/// is `0`, each enclosing call is one less), and `qfork_nesting` counts enclosing query
/// forks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelTag {
    pub bfb_names: BTreeSet<String>,
    pub func_nesting: i32,
    #[serde(default)]
    pub qfork_nesting: i32,
}

impl LevelTag {
    pub fn new<I, S>(bfb_names: I, func_nesting: i32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bfb_names: bfb_names.into_iter().map(Into::into).collect(),
            func_nesting,
            qfork_nesting: 0,
        }
    }

    pub fn with_qfork_nesting(mut self, qfork_nesting: i32) -> Self {
        self.qfork_nesting = qfork_nesting;
        self
    }
}
