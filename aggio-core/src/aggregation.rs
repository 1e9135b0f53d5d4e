// src/aggregation.rs
//! The `aggio` pipeline: a small aggregation language executed against an
//! ephemeral collection. Each stage queries the collection, then resets its
//! indexes to the stage output so the next stage sees the materialized
//! intermediate state.

use log::warn;
use serde_json::{json, Map, Value};

use crate::db::{Db, DbOptions, UpdateOptions};
use crate::document::get_dot_value;
use crate::error::{DbError, Result};
use crate::util::{render_template, string_case, stringify_scalar};

/// Pipeline options.
#[derive(Debug, Clone)]
pub struct AggioOptions {
    /// Strip `_id` from stage results (default true); ephemeral ids are an
    /// implementation detail of the pipeline collection.
    pub exclude_id: bool,
}

impl Default for AggioOptions {
    fn default() -> Self {
        AggioOptions { exclude_id: true }
    }
}

/// Pipeline input: a document slice, an existing collection, or options to
/// build one.
pub enum AggioInput<'a> {
    Docs(Vec<Value>),
    Collection(&'a Db),
    Options(DbOptions),
}

impl From<Vec<Value>> for AggioInput<'static> {
    fn from(docs: Vec<Value>) -> Self {
        AggioInput::Docs(docs)
    }
}

impl<'a> From<&'a Db> for AggioInput<'a> {
    fn from(db: &'a Db) -> Self {
        AggioInput::Collection(db)
    }
}

impl From<DbOptions> for AggioInput<'static> {
    fn from(options: DbOptions) -> Self {
        AggioInput::Options(options)
    }
}

/// Pipeline stage. Parsed up front so an unknown stage fails before anything
/// runs.
#[derive(Debug, Clone)]
enum Stage {
    Match(Value),
    MatchOne(Value),
    Sort(Value),
    Project(Value),
    Update(Value),
    GroupBy(Value),
    KeyBy(Value),
    Pick(Value),
    Template(String),
    First,
    Last,
    Limit(usize),
}

impl Stage {
    fn parse(stage: &Value) -> Result<Stage> {
        let map = match stage {
            Value::Object(map) if map.len() == 1 => map,
            _ => {
                return Err(DbError::Aggregation(
                    "each pipeline stage must be a single-key object".to_string(),
                ))
            }
        };
        let (key, value) = match map.iter().next() {
            Some(entry) => entry,
            None => {
                return Err(DbError::Aggregation(
                    "each pipeline stage must be a single-key object".to_string(),
                ))
            }
        };
        Ok(match key.as_str() {
            "$match" => Stage::Match(value.clone()),
            "$matchOne" => Stage::MatchOne(value.clone()),
            "$sort" => Stage::Sort(value.clone()),
            "$project" => Stage::Project(value.clone()),
            "$update" => Stage::Update(value.clone()),
            "$groupBy" => Stage::GroupBy(value.clone()),
            "$keyBy" => Stage::KeyBy(value.clone()),
            "$pick" => Stage::Pick(value.clone()),
            "$template" => {
                let template = value.as_str().ok_or_else(|| {
                    DbError::Aggregation("$template requires a template string".to_string())
                })?;
                Stage::Template(template.to_string())
            }
            "$first" => Stage::First,
            "$last" => Stage::Last,
            "$limit" => {
                let n = value.as_u64().ok_or_else(|| {
                    DbError::Aggregation("$limit requires a non-negative integer".to_string())
                })?;
                Stage::Limit(n as usize)
            }
            other => {
                return Err(DbError::Aggregation(format!(
                    "unknown aggregation stage {other:?}"
                )))
            }
        })
    }
}

/// Run a pipeline with default options.
pub fn aggio(input: AggioInput<'_>, pipeline: &[Value]) -> Result<Value> {
    aggio_with_options(input, pipeline, AggioOptions::default())
}

/// Run a pipeline. The result shape depends on the final stage: an array for
/// list-shaped stages, an object for `$groupBy`/`$keyBy`, a scalar for
/// `$pick`/`$first`/`$last`.
pub fn aggio_with_options(
    input: AggioInput<'_>,
    pipeline: &[Value],
    options: AggioOptions,
) -> Result<Value> {
    let db = match input {
        AggioInput::Docs(docs) => Db::create(DbOptions {
            docs: Some(docs),
            ..Default::default()
        })?,
        AggioInput::Collection(source) => Db::create(DbOptions {
            docs: Some(source.get_all_data()),
            ..Default::default()
        })?,
        AggioInput::Options(db_options) => Db::create(db_options)?,
    };

    let stages: Vec<Stage> = pipeline.iter().map(Stage::parse).collect::<Result<_>>()?;
    run_pipeline(&db, &stages, &options)
}

/// `$stringify` directive inside a `$pick` sub-expression.
enum Stringify {
    Case(String),
    Template(String),
}

fn parse_stringify(value: Option<&Value>) -> Result<Option<Stringify>> {
    match value {
        None => Ok(None),
        Some(Value::String(case)) => Ok(Some(Stringify::Case(case.clone()))),
        Some(Value::Object(map)) => match map.get("$template").and_then(Value::as_str) {
            Some(template) => Ok(Some(Stringify::Template(template.to_string()))),
            None => Err(DbError::Aggregation(
                "$stringify object requires a $template string".to_string(),
            )),
        },
        Some(other) => Err(DbError::Aggregation(format!(
            "invalid $stringify value {other}"
        ))),
    }
}

fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Resolve one `$join`/`$joinEach`/`$each` part against a document. `#`
/// prefixes a literal, `\` escapes a leading `#`.
fn part_value(doc: &Value, key: &str, stringify: &Option<Stringify>) -> Result<Option<Value>> {
    if let Some(literal) = key.strip_prefix('#') {
        return Ok(Some(Value::String(literal.to_string())));
    }
    let key = key.strip_prefix('\\').unwrap_or(key);
    let value = get_dot_value(doc, key);

    if let Some(Stringify::Template(template)) = stringify {
        let scoped = value.clone().unwrap_or(Value::Null);
        return Ok(Some(Value::String(render_template(template, doc, &scoped)?)));
    }
    if let Some(Stringify::Case(case)) = stringify {
        if let Some(v) = &value {
            if !v.is_null() {
                return Ok(Some(Value::String(string_case(case, &stringify_scalar(v))?)));
            }
        }
    }
    Ok(value)
}

/// Keys used in `$groupBy`/`$keyBy` output objects must stringify cleanly:
/// strings and numbers do, an absent value becomes `"undefined"`, anything
/// else is an error.
fn assert_object_key(value: Option<&Value>) -> Result<String> {
    match value {
        None => Ok("undefined".to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(DbError::Aggregation(format!(
            "invalid type of key {other}"
        ))),
    }
}

fn strip_ids(items: &mut [Value]) {
    for item in items.iter_mut() {
        if let Value::Object(map) = item {
            map.shift_remove("_id");
        }
    }
}

fn run_find(
    db: &Db,
    query: &Value,
    sort: Option<&Value>,
    projection: Option<&Value>,
    limit: Option<usize>,
    options: &AggioOptions,
) -> Result<Vec<Value>> {
    let mut cursor = db.find(query.clone());
    if let Some(sort) = sort {
        cursor = cursor.sort(sort.clone());
    }
    if let Some(projection) = projection {
        cursor = cursor.project(projection.clone());
    }
    if let Some(limit) = limit {
        cursor = cursor.limit(limit);
    }
    let mut items = cursor.exec()?;
    if options.exclude_id {
        strip_ids(&mut items);
    }
    Ok(items)
}

fn stage_object(value: &Value, stage: &str) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(DbError::Aggregation(format!(
            "{stage} requires an object value"
        ))),
    }
}

fn run_pipeline(db: &Db, stages: &[Stage], options: &AggioOptions) -> Result<Value> {
    let mut last_sort = json!({ "_id": -1 });
    let mut result = Value::Null;
    let mut take_first = false;
    let mut take_last = false;
    let mut limit: Option<usize> = None;

    for stage in stages {
        match stage {
            Stage::First => take_first = true,
            Stage::Last => take_last = true,
            Stage::Limit(n) => limit = Some(*n),

            Stage::Match(query) => {
                let items = run_find(db, query, Some(&last_sort), None, None, options)?;
                db.reset_indexes(items.clone())?;
                result = Value::Array(items);
            }

            Stage::MatchOne(query) => {
                let item = run_find(db, query, None, None, Some(1), options)?.pop();
                db.reset_indexes(item.clone().into_iter().collect())?;
                result = item.unwrap_or(Value::Null);
            }

            Stage::Sort(spec) => {
                last_sort = spec.clone();
                let items = run_find(db, &json!({}), Some(&last_sort), None, None, options)?;
                db.reset_indexes(items.clone())?;
                result = Value::Array(items);
            }

            Stage::Project(spec) => {
                let items =
                    run_find(db, &json!({}), Some(&last_sort), Some(spec), None, options)?;
                db.reset_indexes(items.clone())?;
                result = Value::Array(items);
            }

            Stage::Update(value) => {
                let mut spec = stage_object(value, "$update")?;
                let match_query = spec.shift_remove("$match").unwrap_or_else(|| json!({}));
                let multi = spec
                    .shift_remove("$multi")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let upsert = spec
                    .shift_remove("$upsert")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                db.update(
                    &match_query,
                    &Value::Object(spec),
                    UpdateOptions {
                        multi,
                        upsert,
                        ..Default::default()
                    },
                )?;
                let items = run_find(db, &json!({}), Some(&last_sort), None, None, options)?;
                result = Value::Array(items);
            }

            Stage::Template(template) => {
                let items = run_find(db, &json!({}), Some(&last_sort), None, None, options)?;
                db.reset_indexes(items.clone())?;
                let mut rendered = Vec::with_capacity(items.len());
                for doc in &items {
                    rendered.push(Value::String(render_template(template, doc, doc)?));
                }
                result = Value::Array(rendered);
            }

            Stage::Pick(value) => {
                if let Some(outcome) = run_pick(db, value, &last_sort, options)? {
                    result = outcome;
                }
            }

            Stage::GroupBy(value) => {
                result = run_group_by(db, value, &last_sort, options)?;
            }

            Stage::KeyBy(value) => {
                result = run_key_by(db, value, &last_sort, options)?;
            }
        }
    }

    if take_first {
        if let Value::Array(items) = &result {
            result = items.first().cloned().unwrap_or(Value::Null);
        }
    }
    if take_last {
        if let Value::Array(items) = &result {
            result = items.last().cloned().unwrap_or(Value::Null);
        }
    }
    if let Some(limit) = limit {
        if let Value::Array(items) = &mut result {
            items.truncate(limit);
        }
    }

    Ok(result)
}

/// `$pick` with a field path yields that field of the first document (or the
/// array it names); with a sub-expression it joins or collects parts. A
/// sub-expression that produces nothing leaves the previous stage's result
/// in place (`None`).
fn run_pick(
    db: &Db,
    value: &Value,
    last_sort: &Value,
    options: &AggioOptions,
) -> Result<Option<Value>> {
    if let Value::String(path) = value {
        // Field-path form works on the raw first document, ids included.
        let item = db
            .find(json!({}))
            .sort(last_sort.clone())
            .project(json!({ path.as_str(): 1 }))
            .limit(1)
            .exec()?
            .pop();
        let resolved = item.as_ref().and_then(|doc| get_dot_value(doc, path));
        let items: Vec<Value> = match resolved {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single],
        };
        let picked = items.first().cloned().unwrap_or(Value::Null);
        db.reset_indexes(items.into_iter().filter(Value::is_object).collect())?;
        return Ok(Some(picked));
    }

    let mut config = stage_object(value, "$pick")?;
    let stringify = parse_stringify(config.shift_remove("$stringify").as_ref())?;
    let (kind, parts_value) = match config.iter().next() {
        Some((k, v)) => (k.clone(), v.clone()),
        None => {
            return Err(DbError::Aggregation(
                "$pick requires a field path or a $join/$joinEach/$each expression".to_string(),
            ))
        }
    };
    let parts: Vec<String> = match &parts_value {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    DbError::Aggregation(format!("{kind} parts must be strings"))
                })
            })
            .collect::<Result<_>>()?,
        Value::String(single) => vec![single.clone()],
        _ => {
            return Err(DbError::Aggregation(format!(
                "{kind} requires a string or an array of strings"
            )))
        }
    };

    match kind.as_str() {
        "$join" => {
            let item = match run_find(db, &json!({}), Some(last_sort), None, Some(1), options)?
                .pop()
            {
                Some(item) => item,
                None => return Ok(Some(Value::Null)),
            };
            let mut invalid = false;
            let mut joined = String::new();
            for part in &parts {
                let v = part_value(&item, part, &stringify)?;
                if is_nullish(v.as_ref()) {
                    invalid = true;
                } else if let Some(v) = v {
                    joined.push_str(&stringify_scalar(&v));
                }
            }
            if invalid || joined.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Value::String(joined)))
            }
        }
        "$joinEach" => {
            let items = run_find(db, &json!({}), Some(last_sort), None, None, options)?;
            let mut out = Vec::new();
            for item in &items {
                let mut invalid = false;
                let mut joined = String::new();
                for part in &parts {
                    let v = part_value(item, part, &stringify)?;
                    if is_nullish(v.as_ref()) {
                        invalid = true;
                    } else if let Some(v) = v {
                        joined.push_str(&stringify_scalar(&v));
                    }
                }
                if !invalid && !joined.is_empty() {
                    out.push(Value::String(joined));
                }
            }
            Ok(Some(Value::Array(out)))
        }
        "$each" => {
            let items = run_find(db, &json!({}), Some(last_sort), None, None, options)?;
            let mut out = Vec::new();
            for item in &items {
                for part in &parts {
                    let v = part_value(item, part, &stringify)?;
                    if let Some(v) = v {
                        if !v.is_null() {
                            out.push(v);
                        }
                    }
                }
            }
            Ok(Some(Value::Array(out)))
        }
        other => Err(DbError::Aggregation(format!(
            "unknown $pick expression {other:?}"
        ))),
    }
}

fn run_group_by(
    db: &Db,
    value: &Value,
    last_sort: &Value,
    options: &AggioOptions,
) -> Result<Value> {
    let items = run_find(db, &json!({}), Some(last_sort), None, None, options)?;
    let spec = match value {
        Value::String(path) => json!({ "$pick": path }),
        other => other.clone(),
    };
    let spec_map = stage_object(&spec, "$groupBy")?;
    let (key, key_value) = match spec_map.iter().next() {
        Some((k, v)) => (k.clone(), v.clone()),
        None => {
            return Err(DbError::Aggregation(
                "$groupBy requires a key definition".to_string(),
            ))
        }
    };

    let mut group: Map<String, Value> = Map::new();
    for el in items {
        let group_key = if key == "$pick" {
            let picked = aggio_with_options(
                AggioInput::Docs(vec![el.clone()]),
                &[json!({ "$pick": key_value })],
                options.clone(),
            )?;
            if picked.is_null() {
                continue;
            }
            assert_object_key(Some(&picked))?
        } else {
            assert_object_key(get_dot_value(&el, &key).as_ref())?
        };
        match group.get_mut(&group_key) {
            Some(Value::Array(bucket)) => bucket.push(el),
            _ => {
                group.insert(group_key, json!([el]));
            }
        }
    }

    let grouped = Value::Object(group);
    db.reset_indexes(vec![grouped.clone()])?;
    Ok(grouped)
}

fn run_key_by(
    db: &Db,
    value: &Value,
    last_sort: &Value,
    options: &AggioOptions,
) -> Result<Value> {
    let spec = match value {
        Value::String(path) => json!({ "$pick": path }),
        other => other.clone(),
    };
    let mut spec_map = stage_object(&spec, "$keyBy")?;
    let on_many = spec_map
        .shift_remove("$onMany")
        .and_then(|v| v.as_str().map(str::to_string));

    // The residual entries (anything that isn't the key definition) filter
    // the items as an ordinary query.
    let mut query = spec_map.clone();
    query.shift_remove("$pick");
    query.shift_remove("$template");

    let (key, key_value) = match spec_map.iter().find(|(k, _)| !query.contains_key(*k)) {
        Some((k, v)) => (k.clone(), v.clone()),
        None => match spec_map.iter().next() {
            Some((k, v)) => (k.clone(), v.clone()),
            None => {
                return Err(DbError::Aggregation(
                    "$keyBy requires a key definition".to_string(),
                ))
            }
        },
    };

    let items = run_find(db, &Value::Object(query), Some(last_sort), None, None, options)?;

    let mut keyed: Map<String, Value> = Map::new();
    let mut as_list: Vec<String> = Vec::new();
    for el in items {
        let entry_key = if key == "$pick" || key == "$template" {
            let picked = aggio_with_options(
                AggioInput::Docs(vec![el.clone()]),
                &[json!({ key.as_str(): key_value }), json!({ "$first": true })],
                options.clone(),
            )?;
            if picked.is_null() {
                continue;
            }
            assert_object_key(Some(&picked))?
        } else {
            assert_object_key(get_dot_value(&el, &key).as_ref())?
        };

        if let Some(existing) = keyed.get_mut(&entry_key) {
            match on_many.as_deref() {
                Some("list") => {
                    if as_list.iter().any(|k| k == &entry_key) {
                        if let Value::Array(list) = existing {
                            list.push(el);
                        }
                    } else {
                        let previous = existing.clone();
                        *existing = json!([previous, el]);
                        as_list.push(entry_key);
                    }
                }
                Some("last") => {
                    *existing = el;
                }
                Some("warn") => {
                    warn!("found multiple items with key {entry_key}");
                }
                Some("first") => {}
                _ => {
                    return Err(DbError::Aggregation(format!(
                        "found multiple items with key {entry_key}"
                    )))
                }
            }
            continue;
        }
        keyed.insert(entry_key, el);
    }

    let keyed = Value::Object(keyed);
    db.reset_indexes(vec![keyed.clone()])?;
    Ok(keyed)
}
