// src/update.rs
//! Document updates: whole-document replacement, `$`-modifiers and positional
//! array updates (`field.$.sub`).

use std::cmp::Ordering;

use serde_json::{json, Map, Number, Value};

use crate::compare::compare_things;
use crate::document::{
    check_object, deep_copy, get_dot_value, remove_dot_value, set_dot_value,
};
use crate::error::{DbError, Result};
use crate::query::match_query;

/// Update modifiers. Closed set; `$unshift` is an alias of `$prepend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    Set,
    SetIfNull,
    Unset,
    Inc,
    Min,
    Max,
    Push,
    Prepend,
    AddToSet,
    Pop,
    Pull,
}

impl Modifier {
    fn from_key(key: &str) -> Result<Self> {
        Ok(match key {
            "$set" => Self::Set,
            "$setIfNull" => Self::SetIfNull,
            "$unset" => Self::Unset,
            "$inc" => Self::Inc,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$push" => Self::Push,
            "$prepend" | "$unshift" => Self::Prepend,
            "$addToSet" => Self::AddToSet,
            "$pop" => Self::Pop,
            "$pull" => Self::Pull,
            other => return Err(DbError::InvalidUpdateOperator(other.to_string())),
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_things(Some(a), Some(b)) == Ordering::Equal
}

fn as_number<'a>(value: &'a Value, modifier: &str) -> Result<&'a Number> {
    match value {
        Value::Number(n) => Ok(n),
        _ => Err(DbError::Validation(format!(
            "{modifier} only applies to numbers"
        ))),
    }
}

fn add_numbers(a: &Number, b: &Number) -> Result<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN);
    Number::from_f64(sum)
        .ok_or_else(|| DbError::Validation("$inc produced a non-finite number".to_string()))
}

fn apply_modifier(doc: &mut Value, modifier: Modifier, field: &str, operand: &Value) -> Result<()> {
    match modifier {
        Modifier::Set => {
            set_dot_value(doc, field, operand.clone());
        }
        Modifier::SetIfNull => {
            let current = get_dot_value(doc, field);
            if matches!(current, None | Some(Value::Null)) {
                set_dot_value(doc, field, operand.clone());
            }
        }
        Modifier::Unset => {
            remove_dot_value(doc, field);
        }
        Modifier::Inc => {
            let step = as_number(operand, "$inc")?;
            let next = match get_dot_value(doc, field) {
                None | Some(Value::Null) => step.clone(),
                Some(current) => add_numbers(as_number(&current, "$inc")?, step)?,
            };
            set_dot_value(doc, field, Value::Number(next));
        }
        Modifier::Min | Modifier::Max => {
            let name = if modifier == Modifier::Min { "$min" } else { "$max" };
            let bound = as_number(operand, name)?.as_f64().unwrap_or(f64::NAN);
            match get_dot_value(doc, field) {
                None | Some(Value::Null) => set_dot_value(doc, field, operand.clone()),
                Some(current) => {
                    let current = as_number(&current, name)?.as_f64().unwrap_or(f64::NAN);
                    let replace = if modifier == Modifier::Min {
                        bound < current
                    } else {
                        bound > current
                    };
                    if replace {
                        set_dot_value(doc, field, operand.clone());
                    }
                }
            }
        }
        Modifier::Push | Modifier::Prepend => {
            let name = if modifier == Modifier::Push { "$push" } else { "$prepend" };
            match get_dot_value(doc, field) {
                None | Some(Value::Null) => {
                    set_dot_value(doc, field, json!([operand]));
                }
                Some(Value::Array(mut items)) => {
                    if modifier == Modifier::Push {
                        items.push(operand.clone());
                    } else {
                        items.insert(0, operand.clone());
                    }
                    set_dot_value(doc, field, Value::Array(items));
                }
                Some(_) => {
                    return Err(DbError::Validation(format!(
                        "cannot {name} onto non-array field `{field}`"
                    )))
                }
            }
        }
        Modifier::AddToSet => match get_dot_value(doc, field) {
            None | Some(Value::Null) => {
                set_dot_value(doc, field, json!([operand]));
            }
            Some(Value::Array(mut items)) => {
                if !items.iter().any(|item| values_equal(item, operand)) {
                    items.push(operand.clone());
                    set_dot_value(doc, field, Value::Array(items));
                }
            }
            Some(_) => {
                return Err(DbError::Validation(format!(
                    "cannot $addToSet onto non-array field `{field}`"
                )))
            }
        },
        Modifier::Pop => {
            let direction = operand
                .as_i64()
                .ok_or_else(|| DbError::Validation("$pop requires 1 or -1".to_string()))?;
            match get_dot_value(doc, field) {
                Some(Value::Array(mut items)) => {
                    if direction > 0 {
                        items.pop();
                    } else if direction < 0 && !items.is_empty() {
                        items.remove(0);
                    }
                    set_dot_value(doc, field, Value::Array(items));
                }
                _ => {
                    return Err(DbError::Validation(format!(
                        "cannot $pop an element from non-array field `{field}`"
                    )))
                }
            }
        }
        Modifier::Pull => match get_dot_value(doc, field) {
            Some(Value::Array(items)) => {
                let mut kept = Vec::with_capacity(items.len());
                for item in items {
                    let scoped = json!({ "k": item });
                    if !match_query(&scoped, &json!({ "k": operand }))? {
                        kept.push(item);
                    }
                }
                set_dot_value(doc, field, Value::Array(kept));
            }
            _ => {
                return Err(DbError::Validation(format!(
                    "cannot $pull an element from non-array field `{field}`"
                )))
            }
        },
    }
    Ok(())
}

/// Apply an update spec to a document, returning the modified copy.
///
/// A spec with no `$`-keys replaces the whole document (`_id` preserved); a
/// spec with only `$`-keys applies modifiers. Mixing the two forms or
/// changing `_id` is an error.
pub fn modify(doc: &Value, spec: &Value) -> Result<Value> {
    let map = match spec {
        Value::Object(map) => map,
        _ => return Err(DbError::Validation("update spec must be an object".to_string())),
    };
    let dollar = map.keys().filter(|k| k.starts_with('$')).count();
    if dollar > 0 && dollar != map.len() {
        return Err(DbError::Validation(
            "you cannot mix modifiers and normal fields in an update".to_string(),
        ));
    }

    let new_doc = if dollar == 0 {
        let mut new_doc = deep_copy(spec);
        if let (Some(new_id), Some(old_id)) = (spec.get("_id"), doc.get("_id")) {
            if !values_equal(new_id, old_id) {
                return Err(DbError::Validation(
                    "you cannot change a document's _id".to_string(),
                ));
            }
        }
        if let Some(old_id) = doc.get("_id") {
            if let Value::Object(map) = &mut new_doc {
                map.insert("_id".to_string(), old_id.clone());
            }
        }
        new_doc
    } else {
        let mut new_doc = deep_copy(doc);
        for (key, operand) in map {
            let modifier = Modifier::from_key(key)?;
            let fields = operand.as_object().ok_or_else(|| {
                DbError::InvalidUpdateOperator(format!("{key}'s argument must be an object"))
            })?;
            for (field, value) in fields {
                apply_modifier(&mut new_doc, modifier, field, value)?;
            }
        }
        if doc.get("_id") != new_doc.get("_id") {
            return Err(DbError::Validation(
                "you cannot change a document's _id".to_string(),
            ));
        }
        new_doc
    };

    check_object(&new_doc)?;
    Ok(new_doc)
}

/// Collect the query conditions scoped under `parent`, recursing through
/// `$and`/`$or`. Each result is a sub-query applicable to one array element.
fn array_filters(parent: &str, query: &Value) -> Result<Vec<Value>> {
    let map = match query {
        Value::Object(map) => map,
        _ => return Ok(Vec::new()),
    };
    let mut filters = Vec::new();
    for (key, value) in map {
        if key == "$and" || key == "$or" {
            if let Some(subs) = value.as_array() {
                for sub in subs {
                    filters.extend(array_filters(parent, sub)?);
                }
            }
            continue;
        }
        if key.starts_with('$') {
            return Err(DbError::PositionalUpdate(format!(
                "invalid operator {key:?} used during positional array update"
            )));
        }
        let mut parts = key.split('.');
        if parts.next() != Some(parent) {
            continue;
        }
        let condition = parts.collect::<Vec<_>>().join(".");
        let mut filter = Map::new();
        filter.insert(condition, value.clone());
        filters.push(Value::Object(filter));
    }
    Ok(filters)
}

/// Resolve positional (`field.$.sub`) entries of an update spec against a
/// candidate document.
///
/// Matching array elements (per the query's conditions scoped to the array
/// field) are updated in place; consumed entries are removed from the spec.
/// Returns the partially updated document and the remaining spec.
pub fn resolve_positional(candidate: &Value, query: &Value, spec: &Value) -> Result<(Value, Value)> {
    let mut new_doc = deep_copy(candidate);
    let mut remaining = deep_copy(spec);

    let spec_map = match spec {
        Value::Object(map) => map,
        _ => return Ok((new_doc, remaining)),
    };

    for (method, method_query) in spec_map {
        if !method.starts_with('$') {
            continue;
        }
        let entries = match method_query.as_object() {
            Some(entries) => entries,
            None => continue,
        };
        for (update_key, update_value) in entries {
            let parts: Vec<&str> = update_key.split(".$.").collect();
            if parts.len() == 1 {
                continue;
            }
            // One positional level only: 'access.$.value', not 'a.$.b.$.c'.
            if parts.len() != 2 {
                return Err(DbError::PositionalUpdate(format!(
                    "not supported array update using {update_key:?}"
                )));
            }
            let array_field = parts[0];
            let scoped_spec = json!({ method.as_str(): { parts[1]: update_value } });

            if let Some(Value::Object(entries)) = remaining.get_mut(method.as_str()) {
                entries.shift_remove(update_key.as_str());
            }

            let items = match get_dot_value(&new_doc, array_field) {
                Some(Value::Array(items)) => items,
                _ => continue,
            };

            let filters = array_filters(array_field, query)?;
            if filters.is_empty() {
                return Err(DbError::PositionalUpdate(format!(
                    "no filter provided to update array {array_field:?} using {update_key:?}"
                )));
            }

            let mut items = items;
            for filter in &filters {
                for item in items.iter_mut() {
                    if match_query(item, filter)? {
                        *item = modify(item, &scoped_spec)?;
                    }
                }
            }
            set_dot_value(&mut new_doc, array_field, Value::Array(items));
        }
    }

    Ok((new_doc, remaining))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replacement_preserves_id() {
        let doc = json!({"_id": "x1", "name": "Antonio"});
        let out = modify(&doc, &json!({"name": "Rafaela"})).unwrap();
        assert_eq!(out, json!({"name": "Rafaela", "_id": "x1"}));
    }

    #[test]
    fn test_replacement_cannot_change_id() {
        let doc = json!({"_id": "x1", "name": "Antonio"});
        assert!(modify(&doc, &json!({"_id": "x2", "name": "B"})).is_err());
        assert!(modify(&doc, &json!({"_id": "x1", "name": "B"})).is_ok());
    }

    #[test]
    fn test_mixed_forms_rejected() {
        let doc = json!({"_id": "x1"});
        assert!(modify(&doc, &json!({"$set": {"a": 1}, "b": 2})).is_err());
    }

    #[test]
    fn test_unknown_modifier() {
        let doc = json!({"_id": "x1"});
        assert!(matches!(
            modify(&doc, &json!({"$frobnicate": {"a": 1}})),
            Err(DbError::InvalidUpdateOperator(_))
        ));
    }

    #[test]
    fn test_set_and_unset() {
        let doc = json!({"_id": "x1", "a": 1, "b": {"c": 2}});
        let out = modify(&doc, &json!({"$set": {"b.c": 3, "d": 4}, "$unset": {"a": true}}))
            .unwrap();
        assert_eq!(out, json!({"_id": "x1", "b": {"c": 3}, "d": 4}));
    }

    #[test]
    fn test_set_if_null() {
        let doc = json!({"_id": "x1", "a": null, "b": 7});
        let out = modify(&doc, &json!({"$setIfNull": {"a": 1, "b": 2, "c": 3}})).unwrap();
        assert_eq!(out["a"], json!(1));
        assert_eq!(out["b"], json!(7));
        assert_eq!(out["c"], json!(3));
    }

    #[test]
    fn test_inc() {
        let doc = json!({"_id": "x1", "n": 5});
        let out = modify(&doc, &json!({"$inc": {"n": 2, "fresh": 10}})).unwrap();
        assert_eq!(out["n"], json!(7));
        assert_eq!(out["fresh"], json!(10));
        assert!(modify(&doc, &json!({"$inc": {"n": "2"}})).is_err());
        let strdoc = json!({"_id": "x1", "n": "five"});
        assert!(modify(&strdoc, &json!({"$inc": {"n": 2}})).is_err());
    }

    #[test]
    fn test_min_max() {
        let doc = json!({"_id": "x1", "n": 5});
        assert_eq!(modify(&doc, &json!({"$min": {"n": 3}})).unwrap()["n"], json!(3));
        assert_eq!(modify(&doc, &json!({"$min": {"n": 8}})).unwrap()["n"], json!(5));
        assert_eq!(modify(&doc, &json!({"$max": {"n": 8}})).unwrap()["n"], json!(8));
        assert_eq!(modify(&doc, &json!({"$max": {"m": 1}})).unwrap()["m"], json!(1));
    }

    #[test]
    fn test_push_prepend() {
        let doc = json!({"_id": "x1", "xs": [2]});
        assert_eq!(
            modify(&doc, &json!({"$push": {"xs": 3}})).unwrap()["xs"],
            json!([2, 3])
        );
        assert_eq!(
            modify(&doc, &json!({"$prepend": {"xs": 1}})).unwrap()["xs"],
            json!([1, 2])
        );
        assert_eq!(
            modify(&doc, &json!({"$unshift": {"xs": 1}})).unwrap()["xs"],
            json!([1, 2])
        );
        assert_eq!(
            modify(&doc, &json!({"$push": {"ys": 1}})).unwrap()["ys"],
            json!([1])
        );
        let bad = json!({"_id": "x1", "xs": 3});
        assert!(modify(&bad, &json!({"$push": {"xs": 1}})).is_err());
    }

    #[test]
    fn test_add_to_set() {
        let doc = json!({"_id": "x1", "xs": [1, 2]});
        assert_eq!(
            modify(&doc, &json!({"$addToSet": {"xs": 2}})).unwrap()["xs"],
            json!([1, 2])
        );
        assert_eq!(
            modify(&doc, &json!({"$addToSet": {"xs": 3}})).unwrap()["xs"],
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_pop() {
        let doc = json!({"_id": "x1", "xs": [1, 2, 3]});
        assert_eq!(modify(&doc, &json!({"$pop": {"xs": 1}})).unwrap()["xs"], json!([1, 2]));
        assert_eq!(modify(&doc, &json!({"$pop": {"xs": -1}})).unwrap()["xs"], json!([2, 3]));
        assert!(modify(&doc, &json!({"$pop": {"missing": 1}})).is_err());
    }

    #[test]
    fn test_pull_equality_and_subquery() {
        let doc = json!({"_id": "x1", "xs": [1, 2, 3, 2]});
        assert_eq!(
            modify(&doc, &json!({"$pull": {"xs": 2}})).unwrap()["xs"],
            json!([1, 3])
        );
        assert_eq!(
            modify(&doc, &json!({"$pull": {"xs": {"$gt": 1}}})).unwrap()["xs"],
            json!([1])
        );
    }

    #[test]
    fn test_positional_update() {
        let candidate = json!({
            "_id": "x1",
            "access": [
                {"kind": "email", "value": "old@x.y"},
                {"kind": "phone", "value": "123"}
            ]
        });
        let query = json!({"access.kind": "email"});
        let spec = json!({"$set": {"access.$.value": "new@x.y", "plain": 1}});
        let (doc, remaining) = resolve_positional(&candidate, &query, &spec).unwrap();
        assert_eq!(doc["access"][0]["value"], json!("new@x.y"));
        assert_eq!(doc["access"][1]["value"], json!("123"));
        assert_eq!(remaining, json!({"$set": {"plain": 1}}));
    }

    #[test]
    fn test_positional_requires_filter() {
        let candidate = json!({"_id": "x1", "xs": [{"a": 1}]});
        let spec = json!({"$set": {"xs.$.a": 2}});
        assert!(resolve_positional(&candidate, &json!({"other": 1}), &spec).is_err());
    }

    #[test]
    fn test_positional_rejects_nested_positional() {
        let candidate = json!({"_id": "x1"});
        let spec = json!({"$set": {"a.$.b.$.c": 2}});
        assert!(resolve_positional(&candidate, &json!({"a.b.c": 1}), &spec).is_err());
    }

    #[test]
    fn test_positional_rejects_operator_filter() {
        let candidate = json!({"_id": "x1", "xs": [{"a": 1}]});
        let spec = json!({"$set": {"xs.$.a": 2}});
        let query = json!({"$not": {"xs.a": 1}});
        assert!(resolve_positional(&candidate, &query, &spec).is_err());
    }

    #[test]
    fn test_positional_filters_through_and() {
        let candidate = json!({"_id": "x1", "xs": [{"a": 1}, {"a": 2}]});
        let spec = json!({"$set": {"xs.$.b": true}});
        let query = json!({"$and": [{"xs.a": 2}]});
        let (doc, _) = resolve_positional(&candidate, &query, &spec).unwrap();
        assert_eq!(doc["xs"][0].get("b"), None);
        assert_eq!(doc["xs"][1]["b"], json!(true));
    }
}
