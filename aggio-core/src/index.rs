// src/index.rs
//! Per-field ordered index over shared documents.
//!
//! Keys are document values ordered by the global total order; values are the
//! documents themselves, held as `Arc` so membership is pointer identity and
//! every index sees the same allocation the collection holds.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use serde_json::Value;

use crate::compare::compare_things;
use crate::document::{as_date_ms, doc_id, get_dot_value, SharedDoc};
use crate::error::{DbError, Result};

/// Index key: the value of the indexed field, `None` when the field is
/// absent. Ordered by the document total order, so absent sorts first.
#[derive(Debug, Clone)]
pub struct IndexKey(pub Option<Value>);

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_things(self.0.as_ref(), other.0.as_ref())
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl IndexKey {
    fn describe(&self) -> String {
        match &self.0 {
            None => "undefined".to_string(),
            Some(v) => v.to_string(),
        }
    }
}

/// Type-tagged projection used to deduplicate array keys, so `1` and `"1"`
/// stay distinct while equal values collapse.
fn project_for_unique(value: &Value) -> String {
    match value {
        Value::Null => "$null".to_string(),
        Value::Bool(b) => format!("$boolean{b}"),
        Value::Number(n) => format!("$number{n}"),
        Value::String(s) => format!("$string{s}"),
        v => match as_date_ms(v) {
            Some(ms) => format!("$date{ms}"),
            None => format!("$deep{v}"),
        },
    }
}

/// One ordered index. An array-valued field indexes the document under each
/// distinct element (multi-key).
pub struct Index {
    pub field_name: String,
    pub unique: bool,
    pub sparse: bool,
    tree: BTreeMap<IndexKey, Vec<SharedDoc>>,
}

impl Index {
    pub fn new(field_name: impl Into<String>, unique: bool, sparse: bool) -> Self {
        Index {
            field_name: field_name.into(),
            unique,
            sparse,
            tree: BTreeMap::new(),
        }
    }

    /// Keys a document contributes to this index. Empty for sparse indexes
    /// when the field is absent.
    fn keys_for(&self, doc: &Value) -> Vec<IndexKey> {
        match get_dot_value(doc, &self.field_name) {
            None => {
                if self.sparse {
                    Vec::new()
                } else {
                    vec![IndexKey(None)]
                }
            }
            Some(Value::Array(items)) => {
                let mut seen = Vec::new();
                let mut keys = Vec::new();
                for item in items {
                    let projection = project_for_unique(&item);
                    if !seen.contains(&projection) {
                        seen.push(projection);
                        keys.push(IndexKey(Some(item)));
                    }
                }
                keys
            }
            Some(value) => vec![IndexKey(Some(value))],
        }
    }

    fn insert_key(&mut self, key: IndexKey, doc: &SharedDoc) -> Result<()> {
        if self.unique && self.tree.get(&key).is_some_and(|entry| !entry.is_empty()) {
            return Err(DbError::UniqueViolation {
                field_name: self.field_name.clone(),
                key: key.describe(),
            });
        }
        self.tree.entry(key).or_default().push(Arc::clone(doc));
        Ok(())
    }

    fn remove_key(&mut self, key: &IndexKey, doc: &SharedDoc) {
        if let Some(entry) = self.tree.get_mut(key) {
            entry.retain(|held| !Arc::ptr_eq(held, doc));
            if entry.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    /// Index one document. A multi-key insert that hits a unique violation
    /// rolls back the keys already inserted for this document.
    pub fn insert(&mut self, doc: &SharedDoc) -> Result<()> {
        let keys = self.keys_for(doc);
        let mut inserted: Vec<IndexKey> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Err(err) = self.insert_key(key.clone(), doc) {
                for done in &inserted {
                    self.remove_key(done, doc);
                }
                return Err(err);
            }
            inserted.push(key);
        }
        Ok(())
    }

    /// Index a batch; all-or-nothing.
    pub fn insert_many(&mut self, docs: &[SharedDoc]) -> Result<()> {
        for (i, doc) in docs.iter().enumerate() {
            if let Err(err) = self.insert(doc) {
                for done in &docs[..i] {
                    self.remove(done);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unindex one document (pointer identity). Unknown documents are a
    /// no-op.
    pub fn remove(&mut self, doc: &SharedDoc) {
        for key in self.keys_for(doc) {
            self.remove_key(&key, doc);
        }
    }

    /// Replace a batch of documents; all-or-nothing. Old documents are all
    /// removed before any new one is inserted, so a batch may freely swap
    /// unique keys between documents.
    pub fn update_many(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        for (old, _) in pairs {
            self.remove(old);
        }
        for (i, (_, new)) in pairs.iter().enumerate() {
            if let Err(err) = self.insert(new) {
                for (_, done) in &pairs[..i] {
                    self.remove(done);
                }
                for (old, _) in pairs {
                    self.insert(old)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Undo a successful `update_many`.
    pub fn revert_update_many(&mut self, pairs: &[(SharedDoc, SharedDoc)]) -> Result<()> {
        let reversed: Vec<(SharedDoc, SharedDoc)> = pairs
            .iter()
            .map(|(old, new)| (Arc::clone(new), Arc::clone(old)))
            .collect();
        self.update_many(&reversed)
    }

    fn get_matching_key(&self, key: &IndexKey) -> Vec<SharedDoc> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    /// Documents whose field equals `value` (`None` = field absent).
    pub fn get_matching(&self, value: Option<&Value>) -> Vec<SharedDoc> {
        self.get_matching_key(&IndexKey(value.cloned()))
    }

    /// Documents matching any of `values`, deduplicated by `_id`.
    pub fn get_matching_any(&self, values: &[Value]) -> Vec<SharedDoc> {
        let mut seen_ids: Vec<String> = Vec::new();
        let mut out = Vec::new();
        for value in values {
            for doc in self.get_matching(Some(value)) {
                match doc_id(&doc) {
                    Some(id) if seen_ids.iter().any(|s| s == id) => {}
                    Some(id) => {
                        seen_ids.push(id.to_string());
                        out.push(doc);
                    }
                    None => out.push(doc),
                }
            }
        }
        out
    }

    /// Documents whose key falls inside the `$lt/$lte/$gt/$gte` bounds of a
    /// range condition, in key order. A contradictory range is an empty
    /// result, not an error.
    pub fn get_between_bounds(&self, range: &Value) -> Vec<SharedDoc> {
        let lower = range
            .get("$gt")
            .map(|v| (v, false))
            .or_else(|| range.get("$gte").map(|v| (v, true)));
        let upper = range
            .get("$lt")
            .map(|v| (v, false))
            .or_else(|| range.get("$lte").map(|v| (v, true)));

        // BTreeMap::range panics on an inverted range, and on equal bounds
        // that are both excluded; both describe an empty key interval.
        if let (Some((lo, lo_inclusive)), Some((hi, hi_inclusive))) = (lower, upper) {
            match compare_things(Some(lo), Some(hi)) {
                Ordering::Greater => return Vec::new(),
                Ordering::Equal if !(lo_inclusive && hi_inclusive) => return Vec::new(),
                _ => {}
            }
        }

        let start = match lower {
            Some((v, true)) => Bound::Included(IndexKey(Some(v.clone()))),
            Some((v, false)) => Bound::Excluded(IndexKey(Some(v.clone()))),
            None => Bound::Unbounded,
        };
        let end = match upper {
            Some((v, true)) => Bound::Included(IndexKey(Some(v.clone()))),
            Some((v, false)) => Bound::Excluded(IndexKey(Some(v.clone()))),
            None => Bound::Unbounded,
        };
        self.tree
            .range((start, end))
            .flat_map(|(_, docs)| docs.iter().cloned())
            .collect()
    }

    /// Every indexed document, in key order.
    pub fn get_all(&self) -> Vec<SharedDoc> {
        self.tree.values().flat_map(|docs| docs.iter().cloned()).collect()
    }

    /// Drop everything and re-index from scratch.
    pub fn reset(&mut self, docs: &[SharedDoc]) -> Result<()> {
        self.tree.clear();
        self.insert_many(docs)
    }
}
