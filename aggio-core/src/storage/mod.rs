// src/storage/mod.rs
//! Pluggable storage behind the persistence log.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::Result;

/// Key/value string storage. The persistence layer treats keys as datafile
/// names and values as whole newline-separated logs.
pub trait StorageAdapter: Send {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&mut self, key: &str, value: &str) -> Result<()>;

    /// Append to an item without rewriting it. Adapters with a cheaper path
    /// than read-concat-write should override this.
    fn append_item(&mut self, key: &str, value: &str) -> Result<()> {
        let mut current = self.get_item(key)?.unwrap_or_default();
        current.push_str(value);
        self.set_item(key, &current)
    }

    fn remove_item(&mut self, key: &str) -> Result<()>;

    fn get_all_keys(&self) -> Result<Vec<String>>;
}
