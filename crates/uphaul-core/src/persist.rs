//! Atomic JSON blob persistence.
//!
//! Every durable cache in uphaul (quota, bans, learned sizes, session
//! state) is a single JSON file owned by exactly one component. Writes go
//! through a temp file in the destination directory followed by a rename,
//! so out-of-process readers never observe a torn blob.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// A single-file JSON store for one owning component.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the blob, falling back to the type's default.
    ///
    /// A missing or unreadable file is not an error: the in-memory state
    /// starts empty and the next successful save reconciles.
    pub fn load_or_default<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        match std::fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Discarding unparsable cache file");
                    T::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read cache file");
                T::default()
            }
        }
    }

    /// Atomically replace the blob.
    ///
    /// Failures are logged and swallowed: in-memory state wins and the next
    /// save retries the full snapshot.
    pub fn save<T: Serialize>(&self, value: &T) {
        if let Err(e) = self.try_save(value) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist cache file");
        }
    }

    fn try_save<T: Serialize>(&self, value: &T) -> std::io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        // Temp file in the same directory so the rename stays on one
        // filesystem.
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), &json)?;
        tmp.persist(&self.path)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        debug!(path = %self.path.display(), bytes = json.len(), "Persisted cache file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("absent.json"));
        let value: HashMap<String, u64> = store.load_or_default();
        assert!(value.is_empty());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("cache.json"));

        let mut value = HashMap::new();
        value.insert("gdrive".to_string(), 42u64);
        store.save(&value);

        let restored: HashMap<String, u64> = store.load_or_default();
        assert_eq!(restored, value);
    }

    #[test]
    fn save_replaces_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("cache.json"));

        store.save(&vec![1u64, 2, 3]);
        store.save(&vec![9u64]);

        let restored: Vec<u64> = store.load_or_default();
        assert_eq!(restored, vec![9]);
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = JsonStore::new(&path);
        let value: Vec<u64> = store.load_or_default();
        assert!(value.is_empty());
    }

    #[test]
    fn no_partial_file_is_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("cache.json"));
        store.save(&vec![1u64]);

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["cache.json"]);
    }
}
