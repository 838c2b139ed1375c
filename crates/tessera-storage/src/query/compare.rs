//! Ordering, grouping, and numeric coercion of JSON field values.

use std::cmp::Ordering;

use serde_json::Value;

static NULL: Value = Value::Null;

/// The value of `field` in `record`, with missing fields read as `null`.
pub(crate) fn field<'a>(record: &'a Value, field: &str) -> &'a Value {
    record.get(field).unwrap_or(&NULL)
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values.
///
/// `null` < booleans < numbers < strings < arrays < objects. Numbers compare
/// numerically, strings by code point, arrays element-wise, and objects by
/// their serialized form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            },
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(x, y)| compare_values(x, y))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Whether two values are comparable for range operators.
///
/// Ranges never match `null` or values of a different kind than the bound.
pub(crate) fn same_kind(a: &Value, b: &Value) -> bool {
    !a.is_null() && rank(a) == rank(b)
}

/// Textual form of a value used as a grouping key.
///
/// Strings are used as-is; everything else is its JSON text.
pub fn group_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric value of a field for aggregation.
///
/// `Ok(None)` for `null`; `Err` with the offending kind for any other
/// non-number.
pub(crate) fn as_number(value: &Value) -> Result<Option<f64>, &'static str> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(crate::key::type_name(other)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_cross_kind_order() {
        let mut values = vec![
            json!({ "a": 1 }),
            json!("b"),
            json!([1]),
            json!(2),
            json!(true),
            Value::Null,
        ];
        values.sort_by(compare_values);
        assert_eq!(
            values,
            vec![
                Value::Null,
                json!(true),
                json!(2),
                json!("b"),
                json!([1]),
                json!({ "a": 1 }),
            ]
        );
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(9), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!(3), &json!(3.0)), Ordering::Equal);
    }

    #[test]
    fn test_arrays_compare_elementwise() {
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
        assert_eq!(compare_values(&json!([1]), &json!([1, 0])), Ordering::Less);
    }

    #[test]
    fn test_group_key() {
        assert_eq!(group_key(&json!("Paris")), "Paris");
        assert_eq!(group_key(&json!(30)), "30");
        assert_eq!(group_key(&Value::Null), "null");
    }

    #[test]
    fn test_as_number() {
        assert_eq!(as_number(&json!(4)), Ok(Some(4.0)));
        assert_eq!(as_number(&Value::Null), Ok(None));
        assert_eq!(as_number(&json!("4")), Err("string"));
    }
}
