use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Values that can be stored in a database row or bound as statement arguments.
///
/// The same enum is used for every dialect, so options and call sites never
/// branch on driver types:
/// ```rust
/// use sql_handle::prelude::*;
///
/// let args = vec![
///     RowValues::Int(1),
///     RowValues::from("alice"),
///     RowValues::Bool(true),
/// ];
/// # let _ = args;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for the "zero value" of the column type: NULL, `0`, `0.0`,
    /// `false`, or an empty string/blob.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            RowValues::Null => true,
            RowValues::Int(i) => *i == 0,
            RowValues::Float(f) => *f == 0.0,
            RowValues::Text(s) => s.is_empty(),
            RowValues::Bool(b) => !*b,
            RowValues::Blob(b) => b.is_empty(),
            RowValues::Timestamp(_) | RowValues::JSON(_) => false,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    /// Booleans, plus the `0`/`1` integers SQLite uses for them.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValues::Bool(value) => Some(*value),
            RowValues::Int(1) => Some(true),
            RowValues::Int(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Convert a JSON scalar or document into a bindable value.
    ///
    /// Scalars map onto their natural variant; arrays and objects are kept as
    /// [`RowValues::JSON`].
    #[must_use]
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RowValues::Null,
            JsonValue::Bool(b) => RowValues::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => RowValues::Int(i),
                None => RowValues::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => RowValues::Text(s),
            other @ (JsonValue::Array(_) | JsonValue::Object(_)) => RowValues::JSON(other),
        }
    }

    /// Convert a result value into JSON so it can be deserialised into
    /// caller-defined shapes.
    #[must_use]
    pub fn into_json(self) -> JsonValue {
        match self {
            RowValues::Int(i) => JsonValue::from(i),
            RowValues::Float(f) => JsonValue::from(f),
            RowValues::Text(s) => JsonValue::String(s),
            RowValues::Bool(b) => JsonValue::Bool(b),
            RowValues::Timestamp(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            RowValues::Null => JsonValue::Null,
            RowValues::JSON(value) => value,
            RowValues::Blob(bytes) => JsonValue::from(bytes),
        }
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

impl From<i32> for RowValues {
    fn from(value: i32) -> Self {
        RowValues::Int(i64::from(value))
    }
}

impl From<f64> for RowValues {
    fn from(value: f64) -> Self {
        RowValues::Float(value)
    }
}

impl From<bool> for RowValues {
    fn from(value: bool) -> Self {
        RowValues::Bool(value)
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_owned())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<NaiveDateTime> for RowValues {
    fn from(value: NaiveDateTime) -> Self {
        RowValues::Timestamp(value)
    }
}

impl From<Vec<u8>> for RowValues {
    fn from(value: Vec<u8>) -> Self {
        RowValues::Blob(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// The SQL dialect a handle talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `SQLite` database
    #[cfg(feature = "sqlite")]
    Sqlite,
    /// `PostgreSQL` database
    #[cfg(feature = "postgres")]
    Postgres,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values() {
        assert!(RowValues::Null.is_zero());
        assert!(RowValues::Int(0).is_zero());
        assert!(RowValues::Text(String::new()).is_zero());
        assert!(RowValues::Bool(false).is_zero());
        assert!(!RowValues::Int(-1).is_zero());
        assert!(!RowValues::from("x").is_zero());
    }

    #[test]
    fn sqlite_integers_read_as_bools() {
        assert_eq!(RowValues::Int(1).as_bool(), Some(true));
        assert_eq!(RowValues::Int(0).as_bool(), Some(false));
        assert_eq!(RowValues::Int(7).as_bool(), None);
        assert_eq!(RowValues::Bool(true).as_bool(), Some(true));
    }

    #[test]
    fn json_scalars_pick_natural_variant() {
        assert_eq!(RowValues::from_json(serde_json::json!(3)), RowValues::Int(3));
        assert_eq!(RowValues::from_json(serde_json::json!(1.5)), RowValues::Float(1.5));
        assert_eq!(RowValues::from_json(serde_json::json!("a")), RowValues::from("a"));
        assert!(matches!(
            RowValues::from_json(serde_json::json!([1, 2])),
            RowValues::JSON(_)
        ));
    }
}
