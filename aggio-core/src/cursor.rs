// src/cursor.rs
//! Lazy query builder: filter, sort, skip/limit and projection are only
//! applied when `exec` runs.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::compare::{compare_things_with, StringComparator};
use crate::db::Db;
use crate::document::{get_dot_value, set_dot_value, SharedDoc};
use crate::error::{DbError, Result};
use crate::query::match_query;

pub struct Cursor<'a> {
    db: &'a Db,
    query: Value,
    limit: Option<usize>,
    skip: Option<usize>,
    sort: Option<Value>,
    projection: Option<Value>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(db: &'a Db, query: Value) -> Self {
        Cursor {
            db,
            query,
            limit: None,
            skip: None,
            sort: None,
            projection: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sort spec: ordered mapping of dot paths to `1` (ascending) or `-1`
    /// (descending); earlier keys take precedence.
    pub fn sort(mut self, spec: Value) -> Self {
        self.sort = Some(spec);
        self
    }

    /// Projection spec: dot paths mapped to `1` (keep) or `0` (omit). The
    /// two modes cannot be mixed, except `_id` which is independent.
    pub fn project(mut self, spec: Value) -> Self {
        self.projection = Some(spec);
        self
    }

    /// Run the query. Results are deep copies, so callers can mutate them
    /// freely.
    pub fn exec(self) -> Result<Vec<Value>> {
        let (candidates, comparator) = {
            let mut inner = self.db.inner().lock();
            let candidates = inner.get_candidates(&self.query, false)?;
            (candidates, inner.compare_strings.clone())
        };

        let selected = match &self.sort {
            None => self.select_unsorted(&candidates)?,
            Some(spec) => self.select_sorted(&candidates, spec, comparator.as_ref())?,
        };

        match &self.projection {
            Some(projection) => project_docs(selected, projection),
            None => Ok(selected),
        }
    }

    /// Without a sort, skip and limit apply incrementally while scanning.
    fn select_unsorted(&self, candidates: &[SharedDoc]) -> Result<Vec<Value>> {
        let skip = self.skip.unwrap_or(0);
        let mut skipped = 0;
        let mut out = Vec::new();
        for candidate in candidates {
            if !match_query(candidate, &self.query)? {
                continue;
            }
            if skipped < skip {
                skipped += 1;
                continue;
            }
            out.push((**candidate).clone());
            if let Some(limit) = self.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// With a sort, everything matches first, then the slice is taken from
    /// the globally ordered result.
    fn select_sorted(
        &self,
        candidates: &[SharedDoc],
        spec: &Value,
        comparator: Option<&StringComparator>,
    ) -> Result<Vec<Value>> {
        let map = match spec {
            Value::Object(map) => map,
            _ => {
                return Err(DbError::Validation(
                    "sort spec must be an object".to_string(),
                ))
            }
        };
        let mut keys: Vec<(String, i64)> = Vec::with_capacity(map.len());
        for (key, value) in map {
            match value.as_i64() {
                Some(direction @ (1 | -1)) => keys.push((key.clone(), direction)),
                _ => {
                    return Err(DbError::Validation(format!(
                        "sort values must be 1 or -1, got {value} for {key:?}"
                    )))
                }
            }
        }

        let mut matched: Vec<Value> = Vec::new();
        for candidate in candidates {
            if match_query(candidate, &self.query)? {
                matched.push((**candidate).clone());
            }
        }

        matched.sort_by(|a, b| {
            for (key, direction) in &keys {
                let va = get_dot_value(a, key);
                let vb = get_dot_value(b, key);
                let ord = compare_things_with(va.as_ref(), vb.as_ref(), comparator);
                let ord = if *direction < 0 { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let skip = self.skip.unwrap_or(0).min(matched.len());
        let mut sliced: Vec<Value> = matched.split_off(skip);
        if let Some(limit) = self.limit {
            sliced.truncate(limit);
        }
        Ok(sliced)
    }
}

fn project_docs(docs: Vec<Value>, projection: &Value) -> Result<Vec<Value>> {
    let map = match projection {
        Value::Object(map) if !map.is_empty() => map,
        Value::Object(_) => return Ok(docs),
        _ => {
            return Err(DbError::Validation(
                "projection spec must be an object".to_string(),
            ))
        }
    };

    let mut keep_id = true;
    let mut mode: Option<bool> = None; // Some(true) = keep, Some(false) = omit
    let mut fields: Vec<&String> = Vec::new();
    for (key, value) in map {
        let action = match value {
            Value::Number(n) if n.as_i64() == Some(1) => true,
            Value::Number(n) if n.as_i64() == Some(0) => false,
            Value::Bool(b) => *b,
            _ => {
                return Err(DbError::Validation(format!(
                    "projection values must be 0 or 1, got {value} for {key:?}"
                )))
            }
        };
        if key == "_id" {
            keep_id = action;
            continue;
        }
        match mode {
            None => mode = Some(action),
            Some(current) if current != action => {
                return Err(DbError::Validation(
                    "cannot both keep and omit fields except for _id".to_string(),
                ))
            }
            Some(_) => {}
        }
        fields.push(key);
    }

    let keep_mode = mode.unwrap_or(false);
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let projected = if mode.is_none() {
            // Only _id was mentioned.
            let mut projected = doc;
            if !keep_id {
                if let Value::Object(map) = &mut projected {
                    map.shift_remove("_id");
                }
            }
            projected
        } else if keep_mode {
            let mut projected = Value::Object(Map::new());
            for field in &fields {
                if let Some(value) = get_dot_value(&doc, field) {
                    set_dot_value(&mut projected, field, value);
                }
            }
            if keep_id {
                if let Some(id) = doc.get("_id") {
                    set_dot_value(&mut projected, "_id", id.clone());
                }
            }
            projected
        } else {
            let mut projected = doc;
            for field in &fields {
                crate::document::remove_dot_value(&mut projected, field);
            }
            if !keep_id {
                if let Value::Object(map) = &mut projected {
                    map.shift_remove("_id");
                }
            }
            projected
        };
        out.push(projected);
    }
    Ok(out)
}
