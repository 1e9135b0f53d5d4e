// src/document.rs
//! Document primitives: deep copy, validation, dot-path navigation and the
//! one-line JSON codec used by the persistence log.
//!
//! A document is a `serde_json::Value` object. Dates have no JSON
//! representation, so they travel as single-key objects `{"$$date": millis}`
//! both in memory and on disk; the comparison and matching layers treat that
//! shape as its own value kind.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{DbError, Result};

/// Documents handed between the collection and its indexes. Every index holds
/// the same allocation, so membership checks can use pointer identity.
pub type SharedDoc = Arc<Value>;

/// Key of the date wrapper object.
pub const DATE_KEY: &str = "$$date";

/// Build a date value from a unix-epoch millisecond timestamp.
pub fn date_value(millis: i64) -> Value {
    let mut map = Map::new();
    map.insert(DATE_KEY.to_string(), Value::from(millis));
    Value::Object(map)
}

/// Current wall-clock time as a date value.
pub fn now_value() -> Value {
    date_value(chrono::Utc::now().timestamp_millis())
}

/// Millisecond timestamp of a date value, or `None` for anything else.
pub fn as_date_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(DATE_KEY)?.as_i64(),
        _ => None,
    }
}

/// Whether a value is a date wrapper.
pub fn is_date(value: &Value) -> bool {
    as_date_ms(value).is_some()
}

/// Structurally independent clone of a document value.
pub fn deep_copy(value: &Value) -> Value {
    value.clone()
}

/// Deep copy that drops `$`-prefixed keys (date wrappers excluded).
///
/// Used to turn a query into a document skeleton for upserts: the operator
/// parts of the query must not leak into the inserted document.
pub fn deep_copy_strict(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            if is_date(value) {
                return value.clone();
            }
            let mut out = Map::new();
            for (k, v) in map {
                if !k.starts_with('$') {
                    out.insert(k.clone(), deep_copy_strict(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(deep_copy_strict).collect()),
        other => other.clone(),
    }
}

fn check_key(key: &str, value: &Value) -> Result<()> {
    if key.starts_with('$') && !(key == DATE_KEY && value.is_number()) {
        return Err(DbError::Validation(format!(
            "field names cannot begin with the $ character: {:?}",
            key
        )));
    }
    if key.contains('.') {
        return Err(DbError::Validation(format!(
            "field names cannot contain a . character: {:?}",
            key
        )));
    }
    Ok(())
}

/// Validate that a document can be stored and round-tripped.
///
/// Rejects `$`-prefixed and dotted field names at any depth (the `$$date`
/// wrapper is the one sanctioned exception).
pub fn check_object(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                check_key(k, v)?;
                check_object(v)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                check_object(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve a dot-notation path against a value.
///
/// Numeric segments index into arrays; a non-numeric segment applied to an
/// array maps over its elements and yields the array of resolved sub-values,
/// which is what makes queries traverse arrays transparently.
pub fn get_dot_value(obj: &Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    get_dot_parts(obj, &parts)
}

fn get_dot_parts(obj: &Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return Some(obj.clone());
    }
    match obj {
        Value::Array(items) => {
            if let Ok(i) = parts[0].parse::<usize>() {
                items.get(i).and_then(|el| get_dot_parts(el, &parts[1..]))
            } else {
                let values: Vec<Value> = items
                    .iter()
                    .filter_map(|el| get_dot_parts(el, parts))
                    .collect();
                Some(Value::Array(values))
            }
        }
        Value::Object(map) => map
            .get(parts[0])
            .and_then(|inner| get_dot_parts(inner, &parts[1..])),
        _ => None,
    }
}

/// Set a value at a dot-notation path, creating intermediate objects.
///
/// Numeric segments address array elements; writing past the end of an array
/// is a no-op, matching read-side navigation.
pub fn set_dot_value(obj: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    set_dot_parts(obj, &parts, value);
}

fn set_dot_parts(obj: &mut Value, parts: &[&str], value: Value) {
    if parts.is_empty() {
        *obj = value;
        return;
    }

    if parts.len() == 1 {
        match obj {
            Value::Object(map) => {
                map.insert(parts[0].to_string(), value);
            }
            Value::Array(items) => {
                if let Ok(i) = parts[0].parse::<usize>() {
                    if i < items.len() {
                        items[i] = value;
                    }
                }
            }
            _ => {
                let mut map = Map::new();
                map.insert(parts[0].to_string(), value);
                *obj = Value::Object(map);
            }
        }
        return;
    }

    match obj {
        Value::Object(map) => {
            let entry = map
                .entry(parts[0].to_string())
                .or_insert(Value::Object(Map::new()));
            set_dot_parts(entry, &parts[1..], value);
        }
        Value::Array(items) => {
            if let Ok(i) = parts[0].parse::<usize>() {
                if i < items.len() {
                    set_dot_parts(&mut items[i], &parts[1..], value);
                }
            }
        }
        _ => {
            let mut nested = Value::Object(Map::new());
            set_dot_parts(&mut nested, &parts[1..], value);
            let mut map = Map::new();
            map.insert(parts[0].to_string(), nested);
            *obj = Value::Object(map);
        }
    }
}

/// Remove the value at a dot-notation path. Returns the removed value.
pub fn remove_dot_value(obj: &mut Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    remove_dot_parts(obj, &parts)
}

fn remove_dot_parts(obj: &mut Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return None;
    }
    if parts.len() == 1 {
        return match obj {
            Value::Object(map) => map.shift_remove(parts[0]),
            Value::Array(items) => {
                let i = parts[0].parse::<usize>().ok()?;
                if i < items.len() {
                    Some(items.remove(i))
                } else {
                    None
                }
            }
            _ => None,
        };
    }
    match obj {
        Value::Object(map) => remove_dot_parts(map.get_mut(parts[0])?, &parts[1..]),
        Value::Array(items) => {
            let i = parts[0].parse::<usize>().ok()?;
            remove_dot_parts(items.get_mut(i)?, &parts[1..])
        }
        _ => None,
    }
}

/// Serialize one document to a log line (no trailing newline).
pub fn serialize(doc: &Value) -> Result<String> {
    Ok(serde_json::to_string(doc)?)
}

/// Deserialize one log line back to a document.
pub fn deserialize(line: &str) -> Result<Value> {
    Ok(serde_json::from_str(line)?)
}

/// `_id` of a document, when present and a string.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}
