//! Persistent key-value store.
//!
//! Values are grouped in namespaces. A `put` writes all of its entries or
//! none of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("failed to replace store file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Int(i64),
    Str(String),
}

impl StoredValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StoredValue::Str(s) => Some(s),
            StoredValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoredValue::Int(n) => Some(*n),
            StoredValue::Str(_) => None,
        }
    }
}

impl From<&str> for StoredValue {
    fn from(s: &str) -> Self {
        StoredValue::Str(s.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(s: String) -> Self {
        StoredValue::Str(s)
    }
}

impl From<i64> for StoredValue {
    fn from(n: i64) -> Self {
        StoredValue::Int(n)
    }
}

/// Durable key-value storage.
pub trait KvStore: Send + Sync {
    /// Read one key.
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError>;

    /// Write a group of keys atomically.
    fn put(&self, namespace: &str, entries: &[(&str, StoredValue)]) -> Result<(), StoreError>;

    /// Remove every key in a namespace.
    fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

type Namespaces = BTreeMap<String, BTreeMap<String, StoredValue>>;

/// JSON file backed store.
///
/// The whole file is rewritten through a temporary file and renamed into
/// place, so a crash leaves either the old or the new contents.
pub struct FileKvStore {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl FileKvStore {
    /// Open a store file. A missing or empty file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Namespaces::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Namespaces::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_out(&self, data: &Namespaces) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let data = self.data.lock();
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn put(&self, namespace: &str, entries: &[(&str, StoredValue)]) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        let mut next = data.clone();
        let ns = next.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            ns.insert((*key).to_string(), value.clone());
        }

        self.write_out(&next)?;
        *data = next;
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if !data.contains_key(namespace) {
            return Ok(());
        }

        let mut next = data.clone();
        next.remove(namespace);
        self.write_out(&next)?;
        *data = next;
        Ok(())
    }
}

/// In-memory store, for tests and diskless runs.
#[derive(Default)]
pub struct MemoryKvStore {
    data: Mutex<Namespaces>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held in a namespace.
    pub fn len(&self, namespace: &str) -> usize {
        self.data.lock().get(namespace).map_or(0, BTreeMap::len)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredValue>, StoreError> {
        Ok(self
            .data
            .lock()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn put(&self, namespace: &str, entries: &[(&str, StoredValue)]) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        let ns = data.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            ns.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        self.data.lock().remove(namespace);
        Ok(())
    }
}
