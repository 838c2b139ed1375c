//! Declarative query conditions.
//!
//! A [`Condition`] is the data form of one chainable filter, so queries can be
//! assembled from configuration or request payloads:
//!
//! ```json
//! [
//!   { "field": "city", "type": "equals", "value": "Paris" },
//!   { "field": "age", "type": "between", "value": [18, 65] },
//!   { "field": "bio", "type": "search", "value": { "query": "rust", "threshold": 0.7 } }
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};

/// Threshold used by `search` conditions that give only a query string.
pub const DEFAULT_SEARCH_THRESHOLD: f64 = 0.6;

/// Operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionType {
    /// `field == value`.
    Equals,
    /// `field != value`.
    NotEqual,
    /// `lo <= field <= hi`; value is `[lo, hi]`.
    Between,
    /// String field starts with value.
    StartsWith,
    /// String field starts with value, ignoring case.
    StartsWithIgnoreCase,
    /// `field > value`.
    Above,
    /// `field >= value`.
    AboveOrEqual,
    /// `field < value`.
    Below,
    /// `field <= value`.
    BelowOrEqual,
    /// Field equals one of the values; value is an array.
    AnyOf,
    /// Fuzzy match over the whole record; value is a query string or
    /// `{ "query": …, "threshold": … }`. The field is ignored.
    Search,
}

/// One declarative filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Field the operator applies to.
    #[serde(default)]
    pub field: String,
    /// Operator.
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// Operand.
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Create a condition.
    #[must_use]
    pub fn new(field: impl Into<String>, kind: ConditionType, value: Value) -> Self {
        Self {
            field: field.into(),
            kind,
            value,
        }
    }

    fn invalid(&self, expected: &str) -> StorageError {
        StorageError::InvalidQuery(format!(
            "{:?} condition on '{}' expects {expected}, got {}",
            self.kind, self.field, self.value
        ))
    }

    /// Operand as a `[lo, hi]` pair.
    pub(crate) fn range(&self) -> StorageResult<(Value, Value)> {
        match &self.value {
            Value::Array(bounds) if bounds.len() == 2 => {
                Ok((bounds[0].clone(), bounds[1].clone()))
            },
            _ => Err(self.invalid("a two-element array")),
        }
    }

    /// Operand as a string.
    pub(crate) fn text(&self) -> StorageResult<String> {
        self.value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.invalid("a string"))
    }

    /// Operand as a list of candidates.
    pub(crate) fn candidates(&self) -> StorageResult<Vec<Value>> {
        self.value
            .as_array()
            .cloned()
            .ok_or_else(|| self.invalid("an array"))
    }

    /// Operand as a search query and threshold.
    pub(crate) fn search(&self) -> StorageResult<(String, f64)> {
        match &self.value {
            Value::String(query) => Ok((query.clone(), DEFAULT_SEARCH_THRESHOLD)),
            Value::Object(map) => {
                let query = map
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| self.invalid("a query string"))?;
                let threshold = match map.get("threshold") {
                    None => DEFAULT_SEARCH_THRESHOLD,
                    Some(t) => t.as_f64().ok_or_else(|| self.invalid("a numeric threshold"))?,
                };
                Ok((query.to_owned(), threshold))
            },
            _ => Err(self.invalid("a string or { query, threshold }")),
        }
    }
}
