// src/query.rs
//! Query matching: MongoDB-style comparison operators, logical operators and
//! transparent array traversal over dot paths.

use std::cmp::Ordering;

use serde_json::Value;

use crate::compare::compare_things;
use crate::document::{as_date_ms, get_dot_value};
use crate::error::{DbError, Result};

/// Field-level comparison operators. Closed set: anything else under a field
/// condition is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComparisonOperator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
    In,
    Nin,
    Exists,
    Regex,
    Size,
    ElemMatch,
}

impl ComparisonOperator {
    fn from_key(key: &str) -> Result<Self> {
        Ok(match key {
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$in" => Self::In,
            "$nin" => Self::Nin,
            "$exists" => Self::Exists,
            "$regex" => Self::Regex,
            "$size" => Self::Size,
            "$elemMatch" => Self::ElemMatch,
            other => return Err(DbError::InvalidQueryOperator(other.to_string())),
        })
    }
}

/// Whether two values belong to the same ordered kind. Ordering operators
/// only fire between comparable values; anything else is simply no-match.
fn are_comparable(a: &Value, b: &Value) -> bool {
    matches!((a, b), (Value::Number(_), Value::Number(_)))
        || matches!((a, b), (Value::String(_), Value::String(_)))
        || (as_date_ms(a).is_some() && as_date_ms(b).is_some())
}

fn things_equal(a: Option<&Value>, b: &Value) -> bool {
    match (a, b) {
        (None, _) => false,
        (Some(a @ Value::Array(_)), Value::Array(_)) => {
            compare_things(Some(a), Some(b)) == Ordering::Equal
        }
        // Mixed array / non-array equality never matches; element-level
        // matching happens before the condition reaches here.
        (Some(Value::Array(_)), _) | (Some(_), Value::Array(_)) => false,
        (Some(a), b) => compare_things(Some(a), Some(b)) == Ordering::Equal,
    }
}

/// Truthiness of the `$exists` operand, JSON-flavored: null and false and
/// zero mean "must be absent", everything else (empty string included) means
/// "must be present".
fn operand_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(_) | Value::Array(_) | Value::Object(_) => true,
    }
}

fn ordering_matches(op: ComparisonOperator, ord: Ordering) -> bool {
    match op {
        ComparisonOperator::Lt => ord == Ordering::Less,
        ComparisonOperator::Lte => ord != Ordering::Greater,
        ComparisonOperator::Gt => ord == Ordering::Greater,
        ComparisonOperator::Gte => ord != Ordering::Less,
        _ => false,
    }
}

fn match_operator(
    op: ComparisonOperator,
    target: Option<&Value>,
    operand: &Value,
) -> Result<bool> {
    match op {
        ComparisonOperator::Lt
        | ComparisonOperator::Lte
        | ComparisonOperator::Gt
        | ComparisonOperator::Gte => {
            let value = match target {
                Some(v) if are_comparable(v, operand) => v,
                _ => return Ok(false),
            };
            Ok(ordering_matches(op, compare_things(Some(value), Some(operand))))
        }
        ComparisonOperator::Eq => Ok(things_equal(target, operand)),
        ComparisonOperator::Ne => Ok(!things_equal(target, operand)),
        ComparisonOperator::In | ComparisonOperator::Nin => {
            let candidates = operand.as_array().ok_or_else(|| {
                DbError::InvalidQueryOperator(format!(
                    "{} requires an array operand",
                    if op == ComparisonOperator::In { "$in" } else { "$nin" }
                ))
            })?;
            let found = candidates.iter().any(|c| things_equal(target, c));
            Ok(if op == ComparisonOperator::In { found } else { !found })
        }
        ComparisonOperator::Exists => {
            Ok(target.is_some() == operand_truthy(operand))
        }
        ComparisonOperator::Regex => {
            let pattern = operand.as_str().ok_or_else(|| {
                DbError::InvalidQueryOperator("$regex requires a pattern string".to_string())
            })?;
            let re = regex::Regex::new(pattern).map_err(|e| {
                DbError::InvalidQueryOperator(format!("$regex pattern: {e}"))
            })?;
            Ok(match target {
                Some(Value::String(s)) => re.is_match(s),
                _ => false,
            })
        }
        ComparisonOperator::Size => {
            let size = operand
                .as_u64()
                .ok_or_else(|| {
                    DbError::InvalidQueryOperator(
                        "$size requires a non-negative integer".to_string(),
                    )
                })?;
            Ok(match target {
                Some(Value::Array(items)) => items.len() as u64 == size,
                _ => false,
            })
        }
        ComparisonOperator::ElemMatch => {
            let items = match target {
                Some(Value::Array(items)) => items,
                _ => return Ok(false),
            };
            for item in items {
                if match_query(item, operand)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Whether a field condition is an operator object (`{"$gt": 5, ...}`).
///
/// Mixing `$`-operators with plain keys in one condition is an error.
fn operator_condition(condition: &Value) -> Result<bool> {
    let map = match condition {
        Value::Object(map) if as_date_ms(condition).is_none() => map,
        _ => return Ok(false),
    };
    let dollar = map.keys().filter(|k| k.starts_with('$')).count();
    if dollar == 0 {
        Ok(false)
    } else if dollar == map.len() {
        Ok(true)
    } else {
        Err(DbError::InvalidQueryOperator(
            "cannot mix operators and normal fields in one condition".to_string(),
        ))
    }
}

fn match_condition(doc: &Value, field: &str, condition: &Value) -> Result<bool> {
    match_condition_inner(doc, field, condition, false)
}

fn match_condition_inner(
    doc: &Value,
    field: &str,
    condition: &Value,
    treat_array_as_value: bool,
) -> Result<bool> {
    let target = get_dot_value(doc, field);

    // Array targets: $size/$elemMatch and whole-array equality apply to the
    // array itself; otherwise the condition matches if any element does.
    if let Some(Value::Array(items)) = &target {
        if !treat_array_as_value {
            let whole_array = condition.is_array()
                || condition.get("$size").is_some()
                || condition.get("$elemMatch").is_some();
            if !whole_array {
                for item in items {
                    let scoped = serde_json::json!({ "k": item });
                    if match_condition_inner(&scoped, "k", condition, true)? {
                        return Ok(true);
                    }
                }
                return match_condition_inner(doc, field, condition, true);
            }
            return match_condition_inner(doc, field, condition, true);
        }
    }

    if operator_condition(condition)? {
        let map = condition.as_object().ok_or_else(|| {
            DbError::InvalidQueryOperator("operator condition must be an object".to_string())
        })?;
        for (key, operand) in map {
            let op = ComparisonOperator::from_key(key)?;
            if !match_operator(op, target.as_ref(), operand)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    Ok(things_equal(target.as_ref(), condition))
}

fn logical_operand<'a>(key: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| {
        DbError::InvalidQueryOperator(format!("{key} requires an array of queries"))
    })
}

/// Match a document against a query.
///
/// Top-level keys are either logical operators (`$and`, `$or`, `$not`) or
/// field paths; every entry must match.
pub fn match_query(doc: &Value, query: &Value) -> Result<bool> {
    let map = match query {
        Value::Object(map) => map,
        _ => {
            return Err(DbError::InvalidQueryOperator(
                "query must be an object".to_string(),
            ))
        }
    };
    for (key, value) in map {
        if key.starts_with('$') {
            match key.as_str() {
                "$and" => {
                    for sub in logical_operand(key, value)? {
                        if !match_query(doc, sub)? {
                            return Ok(false);
                        }
                    }
                }
                "$or" => {
                    let mut any = false;
                    for sub in logical_operand(key, value)? {
                        if match_query(doc, sub)? {
                            any = true;
                            break;
                        }
                    }
                    if !any {
                        return Ok(false);
                    }
                }
                "$not" => {
                    if match_query(doc, value)? {
                        return Ok(false);
                    }
                }
                other => return Err(DbError::InvalidQueryOperator(other.to_string())),
            }
        } else if !match_condition(doc, key, value)? {
            return Ok(false);
        }
    }
    Ok(true)
}
