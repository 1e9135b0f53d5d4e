// src/persistence.rs
//! Append-only persistence log.
//!
//! Every mutation appends full document lines; a `$$deleted` tombstone marks
//! removals, and `$$indexCreated` / `$$indexRemoved` markers record the index
//! catalog. Loading replays the log last-write-wins, then the collection
//! compacts it back to one line per live document.

use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{deserialize, doc_id, serialize};
use crate::error::{DbError, Result};
use crate::storage::StorageAdapter;
use crate::util::uid;

/// Line-level transform applied after serialization / before
/// deserialization, e.g. encryption or compression of the log.
pub type SerializationHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Catalog entry for one secondary index, as written to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub field_name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<f64>,
}

/// Result of replaying a raw datafile.
#[derive(Debug, Default)]
pub struct TreatedData {
    pub docs: Vec<Value>,
    pub indexes: Vec<IndexSpec>,
}

pub struct Persistence {
    filename: String,
    in_memory_only: bool,
    corrupt_alert_threshold: f64,
    after_serialization: SerializationHook,
    before_deserialization: SerializationHook,
    storage: Option<Box<dyn StorageAdapter>>,
}

// Hooks and the storage adapter are opaque, so Debug only shows the
// configuration scalars.
impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("filename", &self.filename)
            .field("in_memory_only", &self.in_memory_only)
            .field("corrupt_alert_threshold", &self.corrupt_alert_threshold)
            .finish_non_exhaustive()
    }
}

impl Persistence {
    /// Build the persistence layer, validating the hook pair by round-tripping
    /// random strings so a mismatched pair is caught before it can destroy a
    /// datafile.
    pub fn new(
        filename: Option<String>,
        in_memory_only: bool,
        corrupt_alert_threshold: Option<f64>,
        after_serialization: Option<SerializationHook>,
        before_deserialization: Option<SerializationHook>,
        storage: Option<Box<dyn StorageAdapter>>,
    ) -> Result<Self> {
        let in_memory_only = in_memory_only || filename.is_none();
        let filename = filename.unwrap_or_default();

        if filename.ends_with('~') {
            return Err(DbError::Validation(
                "the datafile name can't end with a ~, which is reserved for crash safe backup files"
                    .to_string(),
            ));
        }

        match (&after_serialization, &before_deserialization) {
            (Some(_), None) => {
                return Err(DbError::HookConfiguration(
                    "serialization hook defined but deserialization hook undefined".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(DbError::HookConfiguration(
                    "deserialization hook defined but serialization hook undefined".to_string(),
                ))
            }
            _ => {}
        }

        let identity: SerializationHook = Arc::new(|s: &str| s.to_string());
        let after = after_serialization.unwrap_or_else(|| Arc::clone(&identity));
        let before = before_deserialization.unwrap_or(identity);

        for len in 1..=30 {
            for _ in 0..10 {
                let probe = uid(len);
                if before(&after(&probe)) != probe {
                    return Err(DbError::HookAsymmetry);
                }
            }
        }

        if !in_memory_only && storage.is_none() {
            return Err(DbError::StorageAdapterMissing);
        }

        Ok(Persistence {
            filename,
            in_memory_only,
            corrupt_alert_threshold: corrupt_alert_threshold.unwrap_or(0.1),
            after_serialization: after,
            before_deserialization: before,
            storage,
        })
    }

    /// Replay a raw datafile: last write per `_id` wins, `$$deleted`
    /// tombstones drop documents, index markers maintain the catalog.
    pub fn treat_raw_data(&self, raw: &str) -> Result<TreatedData> {
        let lines: Vec<&str> = raw.split('\n').collect();
        let mut docs_by_id: Map<String, Value> = Map::new();
        let mut indexes: Vec<IndexSpec> = Vec::new();
        // Datafiles end with a newline, so the final empty line is expected
        // and should not count as corruption.
        let mut corrupt_items: i64 = -1;

        for line in &lines {
            let decoded = (self.before_deserialization)(line);
            match deserialize(&decoded) {
                Ok(doc) => {
                    if let Some(id) = doc_id(&doc) {
                        if doc.get("$$deleted") == Some(&Value::Bool(true)) {
                            docs_by_id.shift_remove(id);
                        } else {
                            docs_by_id.insert(id.to_string(), doc.clone());
                        }
                    } else if let Some(marker) = doc.get("$$indexCreated") {
                        match serde_json::from_value::<IndexSpec>(marker.clone()) {
                            Ok(spec) => {
                                indexes.retain(|s| s.field_name != spec.field_name);
                                indexes.push(spec);
                            }
                            Err(_) => corrupt_items += 1,
                        }
                    } else if let Some(field) =
                        doc.get("$$indexRemoved").and_then(Value::as_str)
                    {
                        indexes.retain(|s| s.field_name != field);
                    }
                }
                Err(_) => corrupt_items += 1,
            }
        }

        if !lines.is_empty()
            && corrupt_items as f64 / lines.len() as f64 > self.corrupt_alert_threshold
        {
            return Err(DbError::CorruptionThreshold {
                corrupt: corrupt_items.max(0) as usize,
                total: lines.len(),
                threshold: self.corrupt_alert_threshold,
            });
        }
        if corrupt_items > 0 {
            warn!(
                "skipped {} corrupt line(s) while loading {}",
                corrupt_items, self.filename
            );
        }

        Ok(TreatedData {
            docs: docs_by_id.into_iter().map(|(_, doc)| doc).collect(),
            indexes,
        })
    }

    /// Read and replay the datafile. In-memory collections load empty.
    pub fn load(&mut self) -> Result<TreatedData> {
        if self.in_memory_only {
            return Ok(TreatedData::default());
        }
        let storage = match &mut self.storage {
            Some(storage) => storage,
            None => return Err(DbError::StorageAdapterMissing),
        };
        let raw = storage.get_item(&self.filename)?.unwrap_or_default();
        let treated = self.treat_raw_data(&raw)?;
        debug!(
            "loaded {}: {} document(s), {} secondary index(es)",
            self.filename,
            treated.docs.len(),
            treated.indexes.len()
        );
        Ok(treated)
    }

    fn encode_line(&self, value: &Value) -> Result<String> {
        let mut line = (self.after_serialization)(&serialize(value)?);
        line.push('\n');
        Ok(line)
    }

    /// Append new document states to the log. Empty batches and in-memory
    /// collections are no-ops.
    pub fn persist_new_state(&mut self, docs: &[Value]) -> Result<()> {
        if self.in_memory_only || docs.is_empty() {
            return Ok(());
        }
        let mut to_persist = String::new();
        for doc in docs {
            to_persist.push_str(&self.encode_line(doc)?);
        }
        let storage = match &mut self.storage {
            Some(storage) => storage,
            None => return Err(DbError::StorageAdapterMissing),
        };
        storage.append_item(&self.filename, &to_persist)
    }

    /// Rewrite the datafile from the live state: one line per document plus
    /// one `$$indexCreated` marker per secondary index.
    pub fn persist_cached_database(
        &mut self,
        docs: &[Value],
        index_specs: &[IndexSpec],
    ) -> Result<()> {
        if self.in_memory_only {
            return Ok(());
        }
        let mut to_persist = String::new();
        for doc in docs {
            to_persist.push_str(&self.encode_line(doc)?);
        }
        for spec in index_specs {
            if spec.field_name == "_id" {
                continue;
            }
            let marker = serde_json::json!({ "$$indexCreated": spec });
            to_persist.push_str(&self.encode_line(&marker)?);
        }
        let storage = match &mut self.storage {
            Some(storage) => storage,
            None => return Err(DbError::StorageAdapterMissing),
        };
        storage.set_item(&self.filename, &to_persist)?;
        debug!("compacted datafile {}", self.filename);
        Ok(())
    }

    /// Append an index-catalog marker (`$$indexCreated` or `$$indexRemoved`).
    pub fn persist_index_marker(&mut self, marker: &Value) -> Result<()> {
        if self.in_memory_only {
            return Ok(());
        }
        let line = self.encode_line(marker)?;
        let storage = match &mut self.storage {
            Some(storage) => storage,
            None => return Err(DbError::StorageAdapterMissing),
        };
        storage.append_item(&self.filename, &line)
    }
}
