//! Primary key values.
//!
//! A record's key is read from the field its table declares as `key`. Only
//! integers and strings are accepted, mirroring what both backends can
//! address: the indexed engine orders rows by [`Key`], and the flat backend
//! embeds the key's textual form in the composite storage key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// A primary key value.
///
/// Integer keys sort before string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integral key.
    Int(i64),
    /// Textual key.
    Text(String),
}

impl Key {
    /// Convert a JSON value into a key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for floats, booleans, `null`,
    /// arrays, objects, and empty strings.
    pub fn from_value(value: &Value) -> StorageResult<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int).ok_or_else(|| {
                StorageError::InvalidKey(format!("numeric key {n} is not an integer"))
            }),
            Value::String(s) if s.is_empty() => {
                Err(StorageError::InvalidKey("key must not be empty".into()))
            },
            Value::String(s) => Ok(Self::Text(s.clone())),
            other => Err(StorageError::InvalidKey(format!(
                "unsupported key type: {}",
                type_name(other)
            ))),
        }
    }

    /// Read the key of `record` from `field`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidRecord`] if the record is not an object,
    /// [`StorageError::MissingKey`] if the field is absent or `null`, and
    /// [`StorageError::InvalidKey`] if it holds an unsupported type.
    pub fn extract(table: &str, field: &str, record: &Value) -> StorageResult<Self> {
        let Some(object) = record.as_object() else {
            return Err(StorageError::InvalidRecord(format!(
                "records for table '{table}' must be JSON objects, got {}",
                type_name(record)
            )));
        };
        match object.get(field) {
            None | Some(Value::Null) => Err(StorageError::MissingKey {
                table: table.to_owned(),
                field: field.to_owned(),
            }),
            Some(value) => Self::from_value(value),
        }
    }

    /// The key as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Human-readable JSON type name used in error messages.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_from_value_accepts_integers_and_strings() {
        assert_eq!(Key::from_value(&json!(7)).unwrap(), Key::Int(7));
        assert_eq!(Key::from_value(&json!("a")).unwrap(), Key::Text("a".into()));
    }

    #[test]
    fn test_from_value_rejects_other_types() {
        assert!(Key::from_value(&json!(1.5)).is_err());
        assert!(Key::from_value(&json!(true)).is_err());
        assert!(Key::from_value(&json!([1])).is_err());
        assert!(Key::from_value(&json!("")).is_err());
    }

    #[test]
    fn test_extract_reports_missing_field() {
        let err = Key::extract("users", "id", &json!({ "name": "Alice" })).unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));

        let err = Key::extract("users", "id", &json!({ "id": null })).unwrap_err();
        assert!(matches!(err, StorageError::MissingKey { .. }));
    }

    #[test]
    fn test_extract_rejects_non_objects() {
        let err = Key::extract("users", "id", &json!([1, 2])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[test]
    fn test_integers_order_before_strings() {
        let mut keys = vec![Key::from("b"), Key::from(10), Key::from("a"), Key::from(2)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::from(2), Key::from(10), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn test_display_matches_flat_key_segment() {
        assert_eq!(Key::from(42).to_string(), "42");
        assert_eq!(Key::from("user-1").to_string(), "user-1");
    }

    #[test]
    fn test_untagged_serde() {
        let keys: Vec<Key> = serde_json::from_str(r#"[1, "x"]"#).unwrap();
        assert_eq!(keys, vec![Key::Int(1), Key::Text("x".into())]);
    }
}
