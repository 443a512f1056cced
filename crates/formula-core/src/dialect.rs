use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FormulaError;

/// A set of target SQL dialects, used as the dispatch key for translation variants.
///
/// Each concrete dialect (and dialect version) occupies one bit. `DUMMY` is the generic
/// baseline every function is expected to cover; `COMPENG` is the in-process
/// post-processing engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DialectCombo(u64);

impl DialectCombo {
    pub const EMPTY: DialectCombo = DialectCombo(0);

    pub const DUMMY: DialectCombo = DialectCombo(1 << 0);
    pub const COMPENG: DialectCombo = DialectCombo(1 << 1);
    pub const SQLITE: DialectCombo = DialectCombo(1 << 2);
    pub const POSTGRESQL_9_3: DialectCombo = DialectCombo(1 << 3);
    pub const POSTGRESQL_9_4: DialectCombo = DialectCombo(1 << 4);
    pub const CLICKHOUSE_21_8: DialectCombo = DialectCombo(1 << 5);
    pub const CLICKHOUSE_22_10: DialectCombo = DialectCombo(1 << 6);
    pub const MYSQL_5_6: DialectCombo = DialectCombo(1 << 7);
    pub const MYSQL_8_0_12: DialectCombo = DialectCombo(1 << 8);
    pub const MSSQL: DialectCombo = DialectCombo(1 << 9);
    pub const ORACLE: DialectCombo = DialectCombo(1 << 10);
    pub const TRINO: DialectCombo = DialectCombo(1 << 11);
    pub const SNOWFLAKE: DialectCombo = DialectCombo(1 << 12);
    pub const YDB: DialectCombo = DialectCombo(1 << 13);
    pub const BIGQUERY: DialectCombo = DialectCombo(1 << 14);

    pub const POSTGRESQL: DialectCombo = Self::POSTGRESQL_9_3.union(Self::POSTGRESQL_9_4);
    pub const CLICKHOUSE: DialectCombo = Self::CLICKHOUSE_21_8.union(Self::CLICKHOUSE_22_10);
    pub const MYSQL: DialectCombo = Self::MYSQL_5_6.union(Self::MYSQL_8_0_12);

    /// Every known dialect, including the pseudo-dialects.
    pub const ANY: DialectCombo = DialectCombo((1 << 15) - 1);

    const NAMES: &'static [(&'static str, DialectCombo)] = &[
        ("DUMMY", Self::DUMMY),
        ("COMPENG", Self::COMPENG),
        ("SQLITE", Self::SQLITE),
        ("POSTGRESQL_9_3", Self::POSTGRESQL_9_3),
        ("POSTGRESQL_9_4", Self::POSTGRESQL_9_4),
        ("CLICKHOUSE_21_8", Self::CLICKHOUSE_21_8),
        ("CLICKHOUSE_22_10", Self::CLICKHOUSE_22_10),
        ("MYSQL_5_6", Self::MYSQL_5_6),
        ("MYSQL_8_0_12", Self::MYSQL_8_0_12),
        ("MSSQL", Self::MSSQL),
        ("ORACLE", Self::ORACLE),
        ("TRINO", Self::TRINO),
        ("SNOWFLAKE", Self::SNOWFLAKE),
        ("YDB", Self::YDB),
        ("BIGQUERY", Self::BIGQUERY),
    ];

    const GROUP_NAMES: &'static [(&'static str, DialectCombo)] = &[
        ("ANY", Self::ANY),
        ("EMPTY", Self::EMPTY),
        ("POSTGRESQL", Self::POSTGRESQL),
        ("CLICKHOUSE", Self::CLICKHOUSE),
        ("MYSQL", Self::MYSQL),
    ];

    pub const fn union(self, other: DialectCombo) -> DialectCombo {
        DialectCombo(self.0 | other.0)
    }

    pub const fn intersection(self, other: DialectCombo) -> DialectCombo {
        DialectCombo(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` when every dialect of `other` is also in `self`.
    pub const fn contains(self, other: DialectCombo) -> bool {
        self.0 & other.0 == other.0
    }

    /// Matching rule for translation variants: `ANY` matches everything, otherwise all
    /// of `dialect` must be covered.
    pub fn matches(self, dialect: DialectCombo) -> bool {
        self == Self::ANY || self.contains(dialect)
    }

    /// Number of concrete dialects in the combo. Used to prefer the most specific variant.
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Split into single-dialect combos.
    pub fn iter_single(self) -> impl Iterator<Item = DialectCombo> {
        Self::NAMES
            .iter()
            .map(|(_, d)| *d)
            .filter(move |d| self.contains(*d))
    }

    pub fn all_names() -> impl Iterator<Item = &'static str> {
        Self::NAMES
            .iter()
            .chain(Self::GROUP_NAMES.iter())
            .map(|(name, _)| *name)
    }
}

impl BitOr for DialectCombo {
    type Output = DialectCombo;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl BitAnd for DialectCombo {
    type Output = DialectCombo;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.intersection(rhs)
    }
}

impl fmt::Display for DialectCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((name, _)) = Self::GROUP_NAMES.iter().find(|(_, d)| d == self) {
            return f.write_str(name);
        }
        let mut first = true;
        for (name, d) in Self::NAMES {
            if self.contains(*d) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DialectCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DialectCombo({self})")
    }
}

impl FromStr for DialectCombo {
    type Err = FormulaError;

    /// Accepts single names (`POSTGRESQL_9_4`), group names (`POSTGRESQL`) and `|`-joined
    /// lists of either, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut result = DialectCombo::EMPTY;
        for part in s.split('|') {
            let part = part.trim().to_ascii_uppercase();
            let found = Self::NAMES
                .iter()
                .chain(Self::GROUP_NAMES.iter())
                .find(|(name, _)| *name == part)
                .map(|(_, d)| *d)
                .ok_or_else(|| FormulaError::UnknownDialect(part.clone()))?;
            result = result | found;
        }
        Ok(result)
    }
}

impl Serialize for DialectCombo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DialectCombo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn union_and_contains() {
        let combo = DialectCombo::POSTGRESQL | DialectCombo::SQLITE;
        assert!(combo.contains(DialectCombo::POSTGRESQL_9_4));
        assert!(combo.contains(DialectCombo::SQLITE));
        assert!(!combo.contains(DialectCombo::CLICKHOUSE_21_8));
        assert!(DialectCombo::ANY.matches(DialectCombo::YDB));
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(DialectCombo::POSTGRESQL.to_string(), "POSTGRESQL");
        assert_eq!(
            (DialectCombo::SQLITE | DialectCombo::MSSQL).to_string(),
            "SQLITE|MSSQL"
        );
        assert_eq!(
            "clickhouse|sqlite".parse::<DialectCombo>().ok(),
            Some(DialectCombo::CLICKHOUSE | DialectCombo::SQLITE)
        );
        assert!("NOPE".parse::<DialectCombo>().is_err());
    }

    #[test]
    fn specificity_is_popcount() {
        assert_eq!(DialectCombo::POSTGRESQL.len(), 2);
        assert_eq!(DialectCombo::POSTGRESQL_9_3.len(), 1);
        assert_eq!(DialectCombo::ANY.iter_single().count(), 15);
    }
}
