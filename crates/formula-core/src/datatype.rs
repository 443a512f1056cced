use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of formula data types.
///
/// Every scalar/array type has a `Const*` twin meaning "value known at compile time".
/// A const type is accepted wherever its non-const counterpart is expected, never the
/// other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Integer,
    Float,
    String,
    Date,
    Datetime,
    Genericdatetime,
    Datetimetz,
    Boolean,
    Geopoint,
    Geopolygon,
    Uuid,
    Markup,
    TreeStr,
    ArrayInt,
    ArrayFloat,
    ArrayStr,
    Null,

    ConstInteger,
    ConstFloat,
    ConstString,
    ConstDate,
    ConstDatetime,
    ConstGenericdatetime,
    ConstDatetimetz,
    ConstBoolean,
    ConstGeopoint,
    ConstGeopolygon,
    ConstUuid,
    ConstMarkup,
    ConstTreeStr,
    ConstArrayInt,
    ConstArrayFloat,
    ConstArrayStr,
    ConstNull,
}

impl DataType {
    pub const ALL_NON_CONST: [DataType; 17] = [
        DataType::Integer,
        DataType::Float,
        DataType::String,
        DataType::Date,
        DataType::Datetime,
        DataType::Genericdatetime,
        DataType::Datetimetz,
        DataType::Boolean,
        DataType::Geopoint,
        DataType::Geopolygon,
        DataType::Uuid,
        DataType::Markup,
        DataType::TreeStr,
        DataType::ArrayInt,
        DataType::ArrayFloat,
        DataType::ArrayStr,
        DataType::Null,
    ];

    pub fn is_const(self) -> bool {
        self != self.non_const()
    }

    pub fn non_const(self) -> DataType {
        use DataType::*;
        match self {
            ConstInteger => Integer,
            ConstFloat => Float,
            ConstString => String,
            ConstDate => Date,
            ConstDatetime => Datetime,
            ConstGenericdatetime => Genericdatetime,
            ConstDatetimetz => Datetimetz,
            ConstBoolean => Boolean,
            ConstGeopoint => Geopoint,
            ConstGeopolygon => Geopolygon,
            ConstUuid => Uuid,
            ConstMarkup => Markup,
            ConstTreeStr => TreeStr,
            ConstArrayInt => ArrayInt,
            ConstArrayFloat => ArrayFloat,
            ConstArrayStr => ArrayStr,
            ConstNull => Null,
            other => other,
        }
    }

    pub fn const_version(self) -> DataType {
        use DataType::*;
        match self {
            Integer => ConstInteger,
            Float => ConstFloat,
            String => ConstString,
            Date => ConstDate,
            Datetime => ConstDatetime,
            Genericdatetime => ConstGenericdatetime,
            Datetimetz => ConstDatetimetz,
            Boolean => ConstBoolean,
            Geopoint => ConstGeopoint,
            Geopolygon => ConstGeopolygon,
            Uuid => ConstUuid,
            Markup => ConstMarkup,
            TreeStr => ConstTreeStr,
            ArrayInt => ConstArrayInt,
            ArrayFloat => ConstArrayFloat,
            ArrayStr => ConstArrayStr,
            Null => ConstNull,
            other => other,
        }
    }

    pub fn is_array(self) -> bool {
        matches!(
            self.non_const(),
            DataType::ArrayInt | DataType::ArrayFloat | DataType::ArrayStr
        )
    }

    pub fn is_null(self) -> bool {
        self.non_const() == DataType::Null
    }

    /// Whether a value of `self` may be passed where `target` is expected.
    ///
    /// `NULL` is accepted anywhere. Const types are accepted where their non-const
    /// counterpart is expected. A handful of implicit widenings are also allowed
    /// (`BOOLEAN -> INTEGER -> FLOAT`, date-like types to `GENERICDATETIME`).
    pub fn casts_to(self, target: DataType) -> bool {
        if self == target || self.is_null() {
            return true;
        }
        if target.is_const() {
            // Only constants satisfy a const slot.
            return self.is_const() && self.non_const().widens_to(target.non_const());
        }
        self.non_const().widens_to(target)
    }

    fn widens_to(self, target: DataType) -> bool {
        use DataType::*;
        if self == target {
            return true;
        }
        matches!(
            (self, target),
            (Boolean, Integer)
                | (Boolean, Float)
                | (Integer, Float)
                | (Date, Genericdatetime)
                | (Datetime, Genericdatetime)
                | (Datetimetz, Genericdatetime)
                | (Geopoint, String)
                | (Geopolygon, String)
                | (Markup, String)
        )
    }

    pub fn name(self) -> &'static str {
        use DataType::*;
        match self {
            Integer => "INTEGER",
            Float => "FLOAT",
            String => "STRING",
            Date => "DATE",
            Datetime => "DATETIME",
            Genericdatetime => "GENERICDATETIME",
            Datetimetz => "DATETIMETZ",
            Boolean => "BOOLEAN",
            Geopoint => "GEOPOINT",
            Geopolygon => "GEOPOLYGON",
            Uuid => "UUID",
            Markup => "MARKUP",
            TreeStr => "TREE_STR",
            ArrayInt => "ARRAY_INT",
            ArrayFloat => "ARRAY_FLOAT",
            ArrayStr => "ARRAY_STR",
            Null => "NULL",
            ConstInteger => "CONST_INTEGER",
            ConstFloat => "CONST_FLOAT",
            ConstString => "CONST_STRING",
            ConstDate => "CONST_DATE",
            ConstDatetime => "CONST_DATETIME",
            ConstGenericdatetime => "CONST_GENERICDATETIME",
            ConstDatetimetz => "CONST_DATETIMETZ",
            ConstBoolean => "CONST_BOOLEAN",
            ConstGeopoint => "CONST_GEOPOINT",
            ConstGeopolygon => "CONST_GEOPOLYGON",
            ConstUuid => "CONST_UUID",
            ConstMarkup => "CONST_MARKUP",
            ConstTreeStr => "CONST_TREE_STR",
            ConstArrayInt => "CONST_ARRAY_INT",
            ConstArrayFloat => "CONST_ARRAY_FLOAT",
            ConstArrayStr => "CONST_ARRAY_STR",
            ConstNull => "CONST_NULL",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type parameters that travel alongside a [`DataType`] (currently only the timezone
/// of `DATETIMETZ` values).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTypeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl DataTypeParams {
    pub fn with_timezone(timezone: impl Into<String>) -> Self {
        Self {
            timezone: Some(timezone.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_types_cast_to_non_const_only() {
        assert!(DataType::ConstInteger.casts_to(DataType::Integer));
        assert!(!DataType::Integer.casts_to(DataType::ConstInteger));
        assert!(DataType::ConstInteger.casts_to(DataType::ConstFloat));
    }

    #[test]
    fn null_casts_to_anything() {
        for ty in DataType::ALL_NON_CONST {
            assert!(DataType::Null.casts_to(ty));
            assert!(DataType::ConstNull.casts_to(ty.const_version()));
        }
    }

    #[test]
    fn arrays_do_not_widen() {
        assert!(!DataType::ArrayInt.casts_to(DataType::ArrayFloat));
        assert!(!DataType::String.casts_to(DataType::Integer));
        assert!(DataType::ArrayInt.is_array());
        assert!(DataType::ConstArrayStr.is_array());
    }
}
