//! Small key-value persistence capability that the registries are built on.
//!
//! Production binds each registry to files on disk; tests can hand the same
//! registries a [`MemoryStore`] instead.

use std::{collections::BTreeMap, path::PathBuf};

use async_trait::async_trait;
use log::{debug, trace};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    list_files, read_json_optional, remove_file_if_exists, validate_id, write_json_atomic, Result,
};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Inserts or replaces; persisted before returning.
    async fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Inserts only if the key is absent. Returns whether it was inserted.
    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool>;

    /// Removes a key; returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Reads a typed value out of a store.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// A whole registry kept in one JSON object file.
///
/// Each mutation is a read-modify-write of the file, serialized by an
/// in-process mutex and persisted atomically.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>> {
        Ok(read_json_optional(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, map: &BTreeMap<String, Value>) -> Result<()> {
        trace!("Persisting {} entries to {}", map.len(), self.path.display());
        write_json_atomic(&self.path, map).await
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_string(), value);
        self.save(&map).await
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), value);
        self.save(&map).await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&map).await?;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }
}

/// One JSON document per key, named `<key>.json` inside a directory.
///
/// Keys become file names, so they must pass [`validate_id`].
pub struct JsonDirStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonDirStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        validate_id(key)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

#[async_trait]
impl KeyValueStore for JsonDirStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_path(key)?;
        read_json_optional(&path).await
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let path = self.key_path(key)?;
        write_json_atomic(&path, &value).await
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let path = self.key_path(key)?;
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        write_json_atomic(&path, &value).await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key)?;
        remove_file_if_exists(&path).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for path in list_files(&self.dir).await? {
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem() {
                    let key = stem.to_string_lossy().to_string();
                    if validate_id(&key).is_ok() {
                        keys.push(key);
                    } else {
                        debug!("Ignoring unexpected file {}", path.display());
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.map.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Value) -> Result<bool> {
        let mut map = self.map.lock().await;
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(key.to_string(), value);
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.map.lock().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.lock().await.keys().cloned().collect())
    }
}
