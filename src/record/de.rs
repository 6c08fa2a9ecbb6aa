//! `serde` deserializers reading straight from a [`CustomDbRow`].
//!
//! A row deserializes as a map from column name to value, or as a sequence
//! of values for tuples. Single-column rows also stand in for their only
//! value. Values bend to what the target asks for: engines without a boolean
//! type report `0`/`1`, and collections or nested structs stored as JSON text
//! are parsed on demand.

use serde::de::value::{BorrowedStrDeserializer, SeqDeserializer, StrDeserializer};
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;
use serde_json::Value as JsonValue;

use crate::results::CustomDbRow;
use crate::types::RowValues;

type Error = serde_json::Error;

pub(crate) struct RowDeserializer<'de> {
    row: &'de CustomDbRow,
}

impl<'de> RowDeserializer<'de> {
    pub(crate) fn new(row: &'de CustomDbRow) -> Self {
        Self { row }
    }

    /// The only value of a single-column row.
    fn single(&self) -> Result<ValueDeserializer<'de>, Error> {
        match self.row.rows.as_slice() {
            [value] => Ok(ValueDeserializer::new(value)),
            values => Err(de::Error::invalid_length(
                values.len(),
                &"a single column",
            )),
        }
    }
}

macro_rules! forward_to_single {
    ($($method:ident)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
                self.single()?.$method(visitor)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for RowDeserializer<'de> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_map(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_map(Columns {
            names: self.row.column_names.iter(),
            values: self.row.rows.iter(),
            pending: None,
        })
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_map(visitor)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.row.rows.as_slice() {
            [value] => ValueDeserializer::new(value).deserialize_seq(visitor),
            values => visitor.visit_seq(Values {
                values: values.iter(),
            }),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, Error> {
        if len == 1 {
            return self.single()?.deserialize_tuple(len, visitor);
        }
        visitor.visit_seq(Values {
            values: self.row.rows.iter(),
        })
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_tuple(len, visitor)
    }

    // a row that exists is never `None`
    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_some(self)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.single()?.deserialize_enum(name, variants, visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    forward_to_single! {
        deserialize_bool deserialize_i8 deserialize_i16 deserialize_i32 deserialize_i64
        deserialize_i128 deserialize_u8 deserialize_u16 deserialize_u32 deserialize_u64
        deserialize_u128 deserialize_f32 deserialize_f64 deserialize_char deserialize_str
        deserialize_string deserialize_bytes deserialize_byte_buf deserialize_unit
        deserialize_identifier
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.single()?.deserialize_unit_struct(name, visitor)
    }
}

struct Columns<'de> {
    names: std::slice::Iter<'de, String>,
    values: std::slice::Iter<'de, RowValues>,
    pending: Option<&'de RowValues>,
}

impl<'de> MapAccess<'de> for Columns<'de> {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>, Error> {
        let (Some(name), Some(value)) = (self.names.next(), self.values.next()) else {
            return Ok(None);
        };
        self.pending = Some(value);
        seed.deserialize(BorrowedStrDeserializer::new(name)).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, Error> {
        match self.pending.take() {
            Some(value) => seed.deserialize(ValueDeserializer::new(value)),
            None => Err(de::Error::custom("column value requested before its name")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.values.len())
    }
}

struct Values<'de> {
    values: std::slice::Iter<'de, RowValues>,
}

impl<'de> SeqAccess<'de> for Values<'de> {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Error> {
        self.values
            .next()
            .map(|value| seed.deserialize(ValueDeserializer::new(value)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.values.len())
    }
}

/// Deserializer for one column value.
pub(crate) struct ValueDeserializer<'de> {
    value: &'de RowValues,
}

impl<'de> ValueDeserializer<'de> {
    pub(crate) fn new(value: &'de RowValues) -> Self {
        Self { value }
    }
}

/// JSON stored as text, for targets that need structure.
fn parse_text(text: &str) -> Result<JsonValue, Error> {
    serde_json::from_str(text)
}

impl<'de> Deserializer<'de> for ValueDeserializer<'de> {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Int(i) => visitor.visit_i64(*i),
            RowValues::Float(f) => visitor.visit_f64(*f),
            RowValues::Text(s) => visitor.visit_borrowed_str(s),
            RowValues::Bool(b) => visitor.visit_bool(*b),
            RowValues::Timestamp(_) => match self.value.clone().into_json() {
                JsonValue::String(s) => visitor.visit_string(s),
                other => other.deserialize_any(visitor),
            },
            RowValues::Null => visitor.visit_unit(),
            RowValues::JSON(json) => json.deserialize_any(visitor),
            RowValues::Blob(bytes) => visitor.visit_borrowed_bytes(bytes),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Text(s) if s == "true" || s == "false" => visitor.visit_bool(s == "true"),
            RowValues::JSON(json) => json.deserialize_bool(visitor),
            value => match value.as_bool() {
                Some(flag) => visitor.visit_bool(flag),
                None => self.deserialize_any(visitor),
            },
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Null | RowValues::JSON(JsonValue::Null) => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Text(s) => parse_text(s)?.deserialize_seq(visitor),
            RowValues::JSON(json) => json.deserialize_seq(visitor),
            RowValues::Blob(bytes) => {
                visitor.visit_seq(SeqDeserializer::<_, Error>::new(bytes.iter().copied()))
            }
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value, Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Error> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Text(s) => parse_text(s)?.deserialize_map(visitor),
            RowValues::JSON(json) => json.deserialize_map(visitor),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Text(s) => parse_text(s)?.deserialize_struct(name, fields, visitor),
            RowValues::JSON(json) => json.deserialize_struct(name, fields, visitor),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Text(s) if s.starts_with('{') => {
                parse_text(s)?.deserialize_enum(name, variants, visitor)
            }
            RowValues::Text(s) => visitor.visit_enum(StrDeserializer::<Error>::new(s)),
            RowValues::JSON(json) => json.deserialize_enum(name, variants, visitor),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        match self.value {
            RowValues::Null => visitor.visit_unit(),
            _ => self.deserialize_any(visitor),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit_struct identifier
    }
}
