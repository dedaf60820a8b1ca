//! Persisted key-value store.
//!
//! One JSON object on disk, rewritten on every mutation. Holds playback
//! preferences, remembered login details, the session and the cache's
//! id -> local path hints.

use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

/// String keys to string values, mirrored to a JSON file.
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Discarding corrupt store {:?}: {}", path, e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Store `value` under `key` and write the file.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    /// Drop `key`. Missing keys are not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Remove every key starting with `prefix`, returning how many went.
    pub fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        self.update(|entries| {
            let before = entries.len();
            entries.retain(|k, _| !k.starts_with(prefix));
            before - entries.len()
        })
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        self.update(|entries| entries.clear())
    }

    /// Apply `change` to a copy of the entries. The copy replaces the live
    /// map only once it is on disk, so a failed write changes nothing.
    fn update<T>(&self, change: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> Result<T> {
        let mut entries = self.lock();
        let mut next = entries.clone();
        let out = change(&mut next);
        if next != *entries {
            self.persist(&next)?;
            *entries = next;
        }
        Ok(out)
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(entries).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
