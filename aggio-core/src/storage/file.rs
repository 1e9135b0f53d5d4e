// src/storage/file.rs
//! File-backed storage. Keys are paths relative to a root directory; writes
//! are crash-safe (temp file, fsync, rename), and a leftover `~` backup from
//! an interrupted write is recovered on read.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::StorageAdapter;
use crate::error::Result;

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FileStorage { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push("~");
        PathBuf::from(name)
    }

    /// If the datafile is missing but its `~` backup exists, a write was
    /// interrupted after the temp file was flushed; promote the backup.
    fn ensure_datafile_integrity(&self, path: &Path) -> Result<()> {
        let backup = Self::backup_path(path);
        if !path.exists() && backup.exists() {
            fs::rename(&backup, path)?;
        }
        Ok(())
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let rel = rel.to_string_lossy().to_string();
                if !rel.ends_with('~') {
                    keys.push(rel);
                }
            }
        }
        Ok(())
    }
}

impl StorageAdapter for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        self.ensure_datafile_integrity(&path)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let backup = Self::backup_path(&path);
        {
            let mut file = File::create(&backup)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&backup, &path)?;
        Ok(())
    }

    fn append_item(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        self.ensure_datafile_integrity(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let backup = Self::backup_path(&path);
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        Ok(())
    }

    fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.set_item("col.db", "line1\n").unwrap();
        assert_eq!(storage.get_item("col.db").unwrap().as_deref(), Some("line1\n"));
        assert_eq!(storage.get_item("other.db").unwrap(), None);
    }

    #[test]
    fn test_append_without_rewrite() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_item("col.db", "a\n").unwrap();
        storage.append_item("col.db", "b\n").unwrap();
        assert_eq!(storage.get_item("col.db").unwrap().as_deref(), Some("a\nb\n"));
    }

    #[test]
    fn test_backup_recovery() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("col.db~"), "recovered\n").unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(
            storage.get_item("col.db").unwrap().as_deref(),
            Some("recovered\n")
        );
        assert!(dir.path().join("col.db").exists());
        assert!(!dir.path().join("col.db~").exists());
    }

    #[test]
    fn test_nested_keys_and_listing() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.set_item("nested/col.db", "x").unwrap();
        storage.set_item("top.db", "y").unwrap();
        let keys = storage.get_all_keys().unwrap();
        assert_eq!(keys, vec!["nested/col.db".to_string(), "top.db".to_string()]);
        storage.remove_item("nested/col.db").unwrap();
        assert_eq!(storage.get_item("nested/col.db").unwrap(), None);
    }
}
