// src/compare.rs
//! Total order over document values.
//!
//! Every value kind is comparable to every other kind through a fixed type
//! precedence, so sorting and the ordered index never need to error on
//! heterogeneous data. Absent fields (`None`) sort before everything.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::document::as_date_ms;

/// Custom string comparator, e.g. locale-aware or case-insensitive ordering.
pub type StringComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Type precedence: absent < null < boolean < number < string < date <
/// array < object.
fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(v) if as_date_ms(v).is_some() => 5,
        Some(Value::Array(_)) => 6,
        Some(Value::Object(_)) => 7,
    }
}

/// Compare two optional values with the default string ordering.
pub fn compare_things(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    compare_things_with(a, b, None)
}

/// Compare two optional values, using `comparator` for string pairs when
/// supplied.
pub fn compare_things_with(
    a: Option<&Value>,
    b: Option<&Value>,
    comparator: Option<&StringComparator>,
) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (None, None) | (Some(Value::Null), Some(Value::Null)) => Ordering::Equal,
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => match comparator {
            Some(cmp) => cmp(x, y),
            None => x.cmp(y),
        },
        (Some(Value::Array(xs)), Some(Value::Array(ys))) => {
            for (x, y) in xs.iter().zip(ys.iter()) {
                let ord = compare_things_with(Some(x), Some(y), comparator);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Some(va @ Value::Object(x)), Some(vb @ Value::Object(y))) => {
            if let (Some(ta), Some(tb)) = (as_date_ms(va), as_date_ms(vb)) {
                return ta.cmp(&tb);
            }
            // Field-wise over sorted key names: key name first, then value.
            let mut ka: Vec<&String> = x.keys().collect();
            let mut kb: Vec<&String> = y.keys().collect();
            ka.sort();
            kb.sort();
            for (a_key, b_key) in ka.iter().zip(kb.iter()) {
                let ord = a_key.cmp(b_key);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord =
                    compare_things_with(x.get(*a_key), y.get(*b_key), comparator);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            ka.len().cmp(&kb.len())
        }
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::date_value;
    use serde_json::json;

    #[test]
    fn test_type_precedence() {
        let null = json!(null);
        let boolean = json!(false);
        let number = json!(0);
        let string = json!("");
        let date = date_value(0);
        let array = json!([]);
        let object = json!({});
        let ladder = [&null, &boolean, &number, &string, &date, &array, &object];
        assert_eq!(compare_things(None, Some(&null)), Ordering::Less);
        for pair in ladder.windows(2) {
            assert_eq!(
                compare_things(Some(pair[0]), Some(pair[1])),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_numbers_by_value() {
        assert_eq!(compare_things(Some(&json!(1.5)), Some(&json!(2))), Ordering::Less);
        assert_eq!(compare_things(Some(&json!(3)), Some(&json!(3.0))), Ordering::Equal);
    }

    #[test]
    fn test_dates_by_timestamp() {
        assert_eq!(
            compare_things(Some(&date_value(100)), Some(&date_value(200))),
            Ordering::Less
        );
    }

    #[test]
    fn test_arrays_elementwise_then_length() {
        assert_eq!(
            compare_things(Some(&json!([1, 2])), Some(&json!([1, 3]))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&json!([1, 2])), Some(&json!([1, 2, 0]))),
            Ordering::Less
        );
    }

    #[test]
    fn test_objects_fieldwise() {
        assert_eq!(
            compare_things(Some(&json!({"a": 1})), Some(&json!({"a": 2}))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&json!({"a": 1})), Some(&json!({"b": 1}))),
            Ordering::Less
        );
        assert_eq!(
            compare_things(Some(&json!({"a": 1, "b": 2})), Some(&json!({"b": 2, "a": 1}))),
            Ordering::Equal
        );
    }

    #[test]
    fn test_custom_string_comparator() {
        let rev: StringComparator = Arc::new(|a, b| b.cmp(a));
        assert_eq!(
            compare_things_with(Some(&json!("a")), Some(&json!("b")), Some(&rev)),
            Ordering::Greater
        );
    }
}
