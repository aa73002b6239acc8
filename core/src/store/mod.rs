// Storage — pluggable byte backend plus the namespaced JSON view the
// engine persists its session state through.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Join two namespace segments with `separator`, eliding empty sides.
pub fn join_namespaces(prefix: &str, suffix: &str, separator: &str) -> String {
    if prefix.is_empty() {
        suffix.to_string()
    } else if suffix.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}{separator}{suffix}")
    }
}

/// Unified storage trait for cross-platform persistence.
///
/// Backends are opaque byte stores; errors are propagated unchanged as
/// strings. Everything above this trait speaks JSON.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), String>;
    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, String>;
    fn remove(&self, key: &str) -> std::result::Result<(), String>;
}

/// In-memory storage useful for testing and throwaway sessions
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), String> {
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, String> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> std::result::Result<(), String> {
        self.data.write().remove(key);
        Ok(())
    }
}

/// Sled-backed storage for hosts that need subscriptions to survive restarts
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: &str) -> std::result::Result<Self, String> {
        let db = sled::open(path).map_err(|e| e.to_string())?;
        Ok(Self { db })
    }
}

impl StorageBackend for SledStorage {
    fn put(&self, key: &str, value: &[u8]) -> std::result::Result<(), String> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| e.to_string())?;
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, String> {
        let value = self.db.get(key.as_bytes()).map_err(|e| e.to_string())?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn remove(&self, key: &str) -> std::result::Result<(), String> {
        self.db.remove(key.as_bytes()).map_err(|e| e.to_string())?;
        self.db.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Namespaced JSON view over a [`StorageBackend`].
///
/// Keys are joined with `:`; values are JSON-encoded on write and decoded
/// on read, with JSON `null` reads mapping to absent. Two views sharing a
/// backend but holding different namespaces never collide.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            namespace: String::new(),
        }
    }

    /// Derive a view whose namespace is this one extended by `suffix`.
    pub fn extend(&self, suffix: &str) -> Storage {
        Storage {
            backend: Arc::clone(&self.backend),
            namespace: join_namespaces(&self.namespace, suffix, ":"),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> String {
        join_namespaces(&self.namespace, key, ":")
    }

    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self
            .backend
            .get(&self.full_key(key))
            .map_err(Error::Storage)?;
        let Some(bytes) = raw else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.backend
            .put(&self.full_key(key), &bytes)
            .map_err(Error::Storage)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend
            .remove(&self.full_key(key))
            .map_err(Error::Storage)
    }
}
