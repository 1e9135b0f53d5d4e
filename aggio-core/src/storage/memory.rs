// src/storage/memory.rs
//! HashMap-backed storage for tests and ephemeral collections.

use std::collections::HashMap;

use super::StorageAdapter;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: HashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.get(key).cloned())
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<()> {
        self.items.remove(key);
        Ok(())
    }

    fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.items.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.get_item("a").unwrap(), None);
        storage.set_item("a", "one").unwrap();
        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("one"));
        storage.remove_item("a").unwrap();
        assert_eq!(storage.get_item("a").unwrap(), None);
    }

    #[test]
    fn test_default_append() {
        let mut storage = MemoryStorage::new();
        storage.append_item("log", "a\n").unwrap();
        storage.append_item("log", "b\n").unwrap();
        assert_eq!(storage.get_item("log").unwrap().as_deref(), Some("a\nb\n"));
    }
}
