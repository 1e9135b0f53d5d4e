// src/lib.rs
//! An embedded, single-process, schema-less JSON document store with
//! MongoDB-style queries and updates, per-field ordered indexes, an
//! append-only datafile and a small aggregation pipeline (`aggio`).

mod aggregation;
mod compare;
mod cursor;
mod db;
mod document;
mod error;
mod index;
mod persistence;
mod query;
mod storage;
mod update;
mod util;

pub use aggregation::{aggio, aggio_with_options, AggioInput, AggioOptions};
pub use compare::StringComparator;
pub use cursor::Cursor;
pub use db::{Db, DbOptions, IndexOptions, RemoveOptions, UpdateOptions, UpdateResult};
pub use document::{date_value, now_value, SharedDoc, DATE_KEY};
pub use error::{DbError, Result};
pub use persistence::{IndexSpec, SerializationHook};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};
