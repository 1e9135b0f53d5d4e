// src/db.rs
//! The collection orchestrator: holds the indexes, routes queries to the best
//! one, and keeps the persistence log in sync with every mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::compare::StringComparator;
use crate::cursor::Cursor;
use crate::document::{
    as_date_ms, check_object, deep_copy, deep_copy_strict, doc_id, get_dot_value, is_date,
    now_value, SharedDoc,
};
use crate::error::{DbError, Result};
use crate::index::Index;
use crate::persistence::{IndexSpec, Persistence, SerializationHook};
use crate::query::match_query;
use crate::storage::StorageAdapter;
use crate::update::{modify, resolve_positional};
use crate::util::uid;

const ID_FIELD: &str = "_id";
const AUTOCOMPACTION_MIN_INTERVAL_MS: u64 = 5000;

/// Collection configuration. `Default` gives an in-memory collection that
/// loads on creation.
pub struct DbOptions {
    pub filename: Option<String>,
    pub in_memory_only: bool,
    pub timestamp_data: bool,
    pub autoload: bool,
    pub corrupt_alert_threshold: Option<f64>,
    pub after_serialization: Option<SerializationHook>,
    pub before_deserialization: Option<SerializationHook>,
    pub compare_strings: Option<StringComparator>,
    pub storage: Option<Box<dyn StorageAdapter>>,
    /// Documents inserted right after construction.
    pub docs: Option<Vec<Value>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            filename: None,
            in_memory_only: false,
            timestamp_data: false,
            autoload: true,
            corrupt_alert_threshold: None,
            after_serialization: None,
            before_deserialization: None,
            compare_strings: None,
            storage: None,
            docs: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub multi: bool,
    pub upsert: bool,
    pub return_updated_docs: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            multi: false,
            upsert: false,
            return_updated_docs: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub multi: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub field_name: String,
    pub unique: bool,
    pub sparse: bool,
    /// Registers the field as a TTL index; documents whose date value is
    /// older than this many seconds are expired lazily on read.
    pub expire_after_seconds: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub num_affected: usize,
    pub upsert: bool,
    /// The updated documents, when `return_updated_docs` was requested (or
    /// on upsert, the inserted document).
    pub updated: Option<Vec<Value>>,
}

pub(crate) struct DbInner {
    indexes: BTreeMap<String, Index>,
    ttl_indexes: BTreeMap<String, f64>,
    persistence: Persistence,
    timestamp_data: bool,
    pub(crate) compare_strings: Option<StringComparator>,
}

impl DbInner {
    pub(crate) fn get_all_data(&self) -> Vec<SharedDoc> {
        self.indexes
            .get(ID_FIELD)
            .map(|idx| idx.get_all())
            .unwrap_or_default()
    }

    fn create_new_id(&self) -> String {
        loop {
            let id = uid(16);
            let taken = self
                .indexes
                .get(ID_FIELD)
                .map(|idx| !idx.get_matching(Some(&json!(id))).is_empty())
                .unwrap_or(false);
            if !taken {
                return id;
            }
        }
    }

    fn prepare_for_insertion(&self, doc: &Value) -> Result<Value> {
        let mut prepared = deep_copy(doc);
        let map = match &mut prepared {
            Value::Object(map) => map,
            _ => {
                return Err(DbError::Validation(
                    "documents must be objects".to_string(),
                ))
            }
        };
        if !map.contains_key(ID_FIELD) {
            map.insert(ID_FIELD.to_string(), json!(self.create_new_id()));
        }
        if self.timestamp_data {
            if !map.contains_key("createdAt") {
                map.insert("createdAt".to_string(), now_value());
            }
            if !map.contains_key("updatedAt") {
                map.insert("updatedAt".to_string(), now_value());
            }
        }
        check_object(&prepared)?;
        Ok(prepared)
    }

    /// Add one document to every index; all-or-nothing across indexes.
    fn add_to_indexes(&mut self, doc: &SharedDoc) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for (i, name) in names.iter().enumerate() {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.insert(doc),
                None => Ok(()),
            };
            if let Err(err) = outcome {
                for done in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(done) {
                        index.remove(doc);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn remove_from_indexes(&mut self, doc: &SharedDoc) {
        for index in self.indexes.values_mut() {
            index.remove(doc);
        }
    }

    /// Swap old documents for new ones in every index; all-or-nothing.
    fn update_indexes(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for (i, name) in names.iter().enumerate() {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.update_many(pairs),
                None => Ok(()),
            };
            if let Err(err) = outcome {
                for done in &names[..i] {
                    if let Some(index) = self.indexes.get_mut(done) {
                        index.revert_update_many(pairs)?;
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn insert_inner(&mut self, docs: Vec<Value>) -> Result<Vec<SharedDoc>> {
        let mut prepared: Vec<SharedDoc> = Vec::with_capacity(docs.len());
        for doc in &docs {
            prepared.push(Arc::new(self.prepare_for_insertion(doc)?));
        }
        for (i, doc) in prepared.iter().enumerate() {
            if let Err(err) = self.add_to_indexes(doc) {
                for done in &prepared[..i] {
                    self.remove_from_indexes(done);
                }
                return Err(err);
            }
        }
        let new_states: Vec<Value> = prepared.iter().map(|d| (**d).clone()).collect();
        self.persistence.persist_new_state(&new_states)?;
        Ok(prepared)
    }

    /// Narrow the documents a query has to be matched against, using the
    /// best available index: scalar equality, then `$in`, then a range, then
    /// a full scan.
    fn select_candidates(&self, query: &Value) -> Vec<SharedDoc> {
        let map = match query {
            Value::Object(map) => map,
            _ => return self.get_all_data(),
        };

        for (key, value) in map {
            if key.starts_with('$') {
                continue;
            }
            let scalar = !matches!(value, Value::Object(_) | Value::Array(_)) || is_date(value);
            if scalar {
                if let Some(index) = self.indexes.get(key) {
                    return index.get_matching(Some(value));
                }
            }
        }
        for (key, value) in map {
            if let Some(Value::Array(values)) = value.get("$in") {
                if let Some(index) = self.indexes.get(key) {
                    return index.get_matching_any(values);
                }
            }
        }
        for (key, value) in map {
            let has_bounds = value.as_object().is_some_and(|cond| {
                ["$lt", "$lte", "$gt", "$gte"]
                    .iter()
                    .any(|op| cond.contains_key(*op))
            });
            if has_bounds {
                if let Some(index) = self.indexes.get(key) {
                    return index.get_between_bounds(value);
                }
            }
        }
        self.get_all_data()
    }

    /// Candidates for a query, expiring TTL-stale documents on the way
    /// unless `dont_expire` is set (removal must see stale documents).
    pub(crate) fn get_candidates(
        &mut self,
        query: &Value,
        dont_expire: bool,
    ) -> Result<Vec<SharedDoc>> {
        let candidates = self.select_candidates(query);
        if dont_expire || self.ttl_indexes.is_empty() {
            return Ok(candidates);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let mut valid = Vec::with_capacity(candidates.len());
        let mut expired_ids: Vec<String> = Vec::new();
        for doc in candidates {
            let mut stale = false;
            for (field, seconds) in &self.ttl_indexes {
                if let Some(ms) = get_dot_value(&doc, field).as_ref().and_then(as_date_ms) {
                    if now > ms + (seconds * 1000.0) as i64 {
                        stale = true;
                        break;
                    }
                }
            }
            if stale {
                if let Some(id) = doc_id(&doc) {
                    expired_ids.push(id.to_string());
                }
            } else {
                valid.push(doc);
            }
        }
        for id in expired_ids {
            self.remove_inner(&json!({ ID_FIELD: id }), false)?;
        }
        Ok(valid)
    }

    pub(crate) fn update_inner(
        &mut self,
        query: &Value,
        spec: &Value,
        options: &UpdateOptions,
    ) -> Result<UpdateResult> {
        if options.upsert {
            let candidates = self.get_candidates(query, false)?;
            let mut matched = false;
            for candidate in &candidates {
                if match_query(candidate, query)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                // A plain spec is the document to insert; a modifier spec is
                // applied to the operator-stripped query skeleton.
                let to_insert = if check_object(spec).is_ok() {
                    deep_copy(spec)
                } else {
                    modify(&deep_copy_strict(query), spec)?
                };
                let inserted = self.insert_inner(vec![to_insert])?;
                return Ok(UpdateResult {
                    num_affected: 1,
                    upsert: true,
                    updated: Some(vec![(*inserted[0]).clone()]),
                });
            }
        }

        let candidates = self.get_candidates(query, false)?;
        let mut pairs: Vec<(SharedDoc, SharedDoc)> = Vec::new();
        for candidate in candidates {
            if !match_query(&candidate, query)? {
                continue;
            }
            if !options.multi && !pairs.is_empty() {
                continue;
            }
            let created_at = candidate.get("createdAt").cloned();
            let (base, remaining) = resolve_positional(&candidate, query, spec)?;
            let mut new_doc = modify(&base, &remaining)?;
            if self.timestamp_data {
                if let Value::Object(map) = &mut new_doc {
                    if let Some(created) = created_at {
                        map.insert("createdAt".to_string(), created);
                    }
                    map.insert("updatedAt".to_string(), now_value());
                }
            }
            pairs.push((candidate, Arc::new(new_doc)));
        }

        self.update_indexes(&pairs)?;
        let new_states: Vec<Value> = pairs.iter().map(|(_, new)| (**new).clone()).collect();
        self.persistence.persist_new_state(&new_states)?;
        Ok(UpdateResult {
            num_affected: pairs.len(),
            upsert: false,
            updated: options.return_updated_docs.then_some(new_states),
        })
    }

    pub(crate) fn remove_inner(&mut self, query: &Value, multi: bool) -> Result<usize> {
        let candidates = self.get_candidates(query, true)?;
        let mut removed: Vec<SharedDoc> = Vec::new();
        let mut tombstones: Vec<Value> = Vec::new();
        for candidate in candidates {
            if !match_query(&candidate, query)? {
                continue;
            }
            if !multi && !removed.is_empty() {
                break;
            }
            if let Some(id) = doc_id(&candidate) {
                tombstones.push(json!({ ID_FIELD: id, "$$deleted": true }));
            }
            removed.push(candidate);
        }
        for doc in &removed {
            self.remove_from_indexes(doc);
        }
        self.persistence.persist_new_state(&tombstones)?;
        Ok(removed.len())
    }

    pub(crate) fn ensure_index_inner(&mut self, options: IndexOptions) -> Result<()> {
        if options.field_name.is_empty() {
            return Err(DbError::Validation(
                "cannot create an index without a fieldName".to_string(),
            ));
        }
        if self.indexes.contains_key(&options.field_name) {
            return Ok(());
        }
        let mut index = Index::new(options.field_name.clone(), options.unique, options.sparse);
        // Backfill from existing data; on failure the index is discarded and
        // the collection is untouched.
        index.insert_many(&self.get_all_data())?;
        if let Some(seconds) = options.expire_after_seconds {
            self.ttl_indexes.insert(options.field_name.clone(), seconds);
        }
        let spec = IndexSpec {
            field_name: options.field_name.clone(),
            unique: options.unique,
            sparse: options.sparse,
            expire_after_seconds: options.expire_after_seconds,
        };
        self.indexes.insert(options.field_name, index);
        self.persistence
            .persist_index_marker(&json!({ "$$indexCreated": spec }))
    }

    pub(crate) fn remove_index_inner(&mut self, field_name: &str) -> Result<()> {
        if field_name == ID_FIELD {
            return Err(DbError::Validation(
                "the _id index cannot be removed".to_string(),
            ));
        }
        self.indexes.remove(field_name);
        self.ttl_indexes.remove(field_name);
        self.persistence
            .persist_index_marker(&json!({ "$$indexRemoved": field_name }))
    }

    /// Rebuild every index from scratch over `docs`. Documents without an
    /// `_id` get one assigned.
    pub(crate) fn reset_indexes(&mut self, docs: Vec<Value>) -> Result<()> {
        let mut shared: Vec<SharedDoc> = Vec::with_capacity(docs.len());
        for mut doc in docs {
            if doc_id(&doc).is_none() {
                let id = self.create_new_id();
                if let Value::Object(map) = &mut doc {
                    map.insert(ID_FIELD.to_string(), json!(id));
                }
            }
            shared.push(Arc::new(doc));
        }
        for index in self.indexes.values_mut() {
            index.reset(&shared)?;
        }
        Ok(())
    }

    fn index_specs(&self) -> Vec<IndexSpec> {
        self.indexes
            .iter()
            .map(|(name, index)| IndexSpec {
                field_name: name.clone(),
                unique: index.unique,
                sparse: index.sparse,
                expire_after_seconds: self.ttl_indexes.get(name).copied(),
            })
            .collect()
    }

    pub(crate) fn compact_inner(&mut self) -> Result<()> {
        let docs: Vec<Value> = self.get_all_data().iter().map(|d| (**d).clone()).collect();
        let specs = self.index_specs();
        self.persistence.persist_cached_database(&docs, &specs)
    }

    pub(crate) fn load_database_inner(&mut self) -> Result<()> {
        let treated = self.persistence.load()?;
        for spec in &treated.indexes {
            if !self.indexes.contains_key(&spec.field_name) {
                self.indexes.insert(
                    spec.field_name.clone(),
                    Index::new(spec.field_name.clone(), spec.unique, spec.sparse),
                );
            }
            if let Some(seconds) = spec.expire_after_seconds {
                self.ttl_indexes.insert(spec.field_name.clone(), seconds);
            }
        }
        let count = treated.docs.len();
        self.reset_indexes(treated.docs)?;
        // Normalize the log: the replayed state becomes one line per doc.
        self.compact_inner()?;
        debug!("database loaded, {count} document(s)");
        Ok(())
    }
}

/// An embedded, schema-less collection of JSON documents.
pub struct Db {
    inner: Arc<Mutex<DbInner>>,
    autocompaction_stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl Db {
    /// Build a collection. Unless `autoload` is disabled the datafile is
    /// loaded (and compacted) before this returns; initial `docs` are
    /// inserted afterwards.
    pub fn create(options: DbOptions) -> Result<Db> {
        let DbOptions {
            filename,
            in_memory_only,
            timestamp_data,
            autoload,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
            compare_strings,
            storage,
            docs,
        } = options;

        let persistence = Persistence::new(
            filename,
            in_memory_only,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
            storage,
        )?;

        let mut indexes = BTreeMap::new();
        indexes.insert(ID_FIELD.to_string(), Index::new(ID_FIELD, true, false));

        let db = Db {
            inner: Arc::new(Mutex::new(DbInner {
                indexes,
                ttl_indexes: BTreeMap::new(),
                persistence,
                timestamp_data,
                compare_strings,
            })),
            autocompaction_stop: Mutex::new(None),
        };

        if autoload {
            db.load_database()?;
        }
        if let Some(docs) = docs {
            if !docs.is_empty() {
                db.insert_many(docs)?;
            }
        }
        Ok(db)
    }

    pub(crate) fn inner(&self) -> &Mutex<DbInner> {
        &self.inner
    }

    /// Load (or reload) the datafile, replacing the in-memory state.
    pub fn load_database(&self) -> Result<()> {
        self.inner.lock().load_database_inner()
    }

    /// Deep copies of every document, in `_id` order.
    pub fn get_all_data(&self) -> Vec<Value> {
        self.inner
            .lock()
            .get_all_data()
            .iter()
            .map(|d| (**d).clone())
            .collect()
    }

    /// Rebuild the indexes over an arbitrary document set. Used by the
    /// aggregation pipeline to materialize intermediate stages.
    pub fn reset_indexes(&self, docs: Vec<Value>) -> Result<()> {
        self.inner.lock().reset_indexes(docs)
    }

    pub fn insert(&self, doc: Value) -> Result<Value> {
        let mut inserted = self.insert_many(vec![doc])?;
        inserted.pop().ok_or_else(|| {
            DbError::Validation("insert produced no document".to_string())
        })
    }

    /// Insert a batch; all-or-nothing.
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let inserted = self.inner.lock().insert_inner(docs)?;
        Ok(inserted.iter().map(|d| (**d).clone()).collect())
    }

    pub fn find(&self, query: Value) -> Cursor<'_> {
        Cursor::new(self, query)
    }

    pub fn find_one(&self, query: Value) -> Result<Option<Value>> {
        Ok(self.find(query).limit(1).exec()?.pop())
    }

    pub fn count(&self, query: Value) -> Result<usize> {
        Ok(self.find(query).exec()?.len())
    }

    pub fn update(
        &self,
        query: &Value,
        spec: &Value,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        self.inner.lock().update_inner(query, spec, &options)
    }

    /// Remove matching documents, returning how many were removed.
    pub fn remove(&self, query: &Value, options: RemoveOptions) -> Result<usize> {
        self.inner.lock().remove_inner(query, options.multi)
    }

    pub fn ensure_index(&self, options: IndexOptions) -> Result<()> {
        self.inner.lock().ensure_index_inner(options)
    }

    pub fn remove_index(&self, field_name: &str) -> Result<()> {
        self.inner.lock().remove_index_inner(field_name)
    }

    /// Rewrite the datafile to one line per live document.
    pub fn compact(&self) -> Result<()> {
        self.inner.lock().compact_inner()
    }

    /// Compact the datafile on a fixed interval (floored at 5 seconds). The
    /// timer holds only a weak reference, so dropping the collection stops
    /// it.
    pub fn set_autocompaction_interval(&self, interval_ms: u64) {
        self.stop_autocompaction();
        let interval = interval_ms.max(AUTOCOMPACTION_MIN_INTERVAL_MS);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let weak: Weak<Mutex<DbInner>> = Arc::downgrade(&self.inner);
        thread::spawn(move || loop {
            let mut waited = 0u64;
            while waited < interval {
                if stop_flag.load(AtomicOrdering::Relaxed) {
                    return;
                }
                thread::sleep(Duration::from_millis(100));
                waited += 100;
            }
            match weak.upgrade() {
                Some(inner) => {
                    if let Err(err) = inner.lock().compact_inner() {
                        warn!("autocompaction failed: {err}");
                    }
                }
                None => return,
            }
        });
        *self.autocompaction_stop.lock() = Some(stop);
    }

    pub fn stop_autocompaction(&self) {
        if let Some(stop) = self.autocompaction_stop.lock().take() {
            stop.store(true, AtomicOrdering::Relaxed);
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.stop_autocompaction();
    }
}
