//! Mapping between caller-defined record types and rows.
//!
//! Records are plain serde types. Field names are column names, so a
//! `#[derive(Serialize, Deserialize)]` struct plus a [`Record`] impl is all a
//! table needs:
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use sql_handle::Record;
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct User {
//!     id: i64,
//!     nickname: String,
//!     age: i64,
//! }
//!
//! impl Record for User {
//!     const TABLE: &'static str = "test_users";
//! }
//! ```

mod de;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use self::de::{RowDeserializer, ValueDeserializer};

use crate::error::SqlHandleError;
use crate::results::CustomDbRow;
use crate::types::RowValues;

/// A type persisted as one row of [`Record::TABLE`].
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    /// Table the record lives in.
    const TABLE: &'static str;
    /// Identity column; zero values are left for the engine to assign.
    const PRIMARY_KEY: &'static str = "id";
}

/// Serialised columns of a record, in serialisation order.
pub(crate) fn columns<T: Serialize + ?Sized>(
    record: &T,
) -> Result<Vec<(String, RowValues)>, SqlHandleError> {
    match serde_json::to_value(record)? {
        JsonValue::Object(map) => Ok(map
            .into_iter()
            .map(|(column, value)| (column, RowValues::from_json(value)))
            .collect()),
        other => Err(SqlHandleError::ExecutionError(format!(
            "record must serialise to an object, got {other}"
        ))),
    }
}

/// Primary-key value of `record`, or `None` when it is the zero value.
pub(crate) fn primary_key<T: Record>(record: &T) -> Result<Option<RowValues>, SqlHandleError> {
    Ok(columns(record)?
        .into_iter()
        .find(|(column, _)| column == T::PRIMARY_KEY)
        .map(|(_, value)| value)
        .filter(|value| !value.is_zero()))
}

/// Overwrite one field of `record` with `value`.
pub(crate) fn set_field<T: Record>(
    record: &mut T,
    column: &str,
    value: RowValues,
) -> Result<(), SqlHandleError> {
    let mut object = match serde_json::to_value(&*record)? {
        JsonValue::Object(map) => map,
        other => {
            return Err(SqlHandleError::ExecutionError(format!(
                "record must serialise to an object, got {other}"
            )));
        }
    };
    object.insert(column.to_owned(), value.into_json());
    *record = serde_json::from_value(JsonValue::Object(object))?;
    Ok(())
}

/// Decode a row into any deserialisable shape.
///
/// The row is presented as a map keyed by column name. Single-column rows
/// also decode into scalars, which is what `SELECT EXISTS(..)` or
/// `SELECT COUNT(*)` scans need.
pub(crate) fn decode_row<T: DeserializeOwned>(row: &CustomDbRow) -> Result<T, SqlHandleError> {
    Ok(T::deserialize(RowDeserializer::new(row))?)
}

/// Decode the first column of a row.
pub(crate) fn decode_first_column<V: DeserializeOwned>(
    row: &CustomDbRow,
) -> Result<V, SqlHandleError> {
    let null = RowValues::Null;
    let value = row.get_by_index(0).unwrap_or(&null);
    Ok(V::deserialize(ValueDeserializer::new(value))?)
}
