//! Per-service key-value partitions.
//!
//! A component only ever sees a [`Partition`]: every key it names is
//! prefixed with `{chain_id}:{service}:` before it reaches the backing
//! [`KvStore`], so two services can never address each other's data.
//!
//! ```text
//! dbSet {key: "greeting"} from "notes"
//!        │
//!        └──► "local:notes:greeting" ──► KvStore
//! ```

use crate::error::SupervisorError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const MAX_KEY_LEN: usize = 256;
pub const MAX_VALUE_LEN: usize = 100 * 1024;

/// Flat byte store underneath all partitions.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SupervisorError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), SupervisorError>;
    fn remove(&self, key: &str) -> Result<(), SupervisorError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory store; the default for embedded use and tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, fully prefixed.
    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SupervisorError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), SupervisorError> {
        lock(&self.entries).insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SupervisorError> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Store persisted as a JSON object of hex-encoded values, rewritten on
/// every change. Used by the CLI so permanent grants survive restarts.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SupervisorError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                SupervisorError::Storage(format!("corrupt store {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(SupervisorError::Storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        debug!(path = %path.display(), "opened storage file");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), SupervisorError> {
        let text = serde_json::to_string_pretty(entries)
            .map_err(|e| SupervisorError::Storage(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| {
            SupervisorError::Storage(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SupervisorError> {
        lock(&self.entries)
            .get(key)
            .map(|v| hex::decode(v).map_err(|e| SupervisorError::Storage(e.to_string())))
            .transpose()
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), SupervisorError> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), hex::encode(value));
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), SupervisorError> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// One service's view of the store.
#[derive(Clone)]
pub struct Partition {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl Partition {
    pub fn new(store: Arc<dyn KvStore>, chain_id: &str, service: &str) -> Self {
        Self {
            store,
            prefix: format!("{}:{}:", chain_id, service),
        }
    }

    fn full_key(&self, key: &str) -> Result<String, SupervisorError> {
        if key.is_empty() {
            return Err(SupervisorError::Storage("key must not be empty".into()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(SupervisorError::Storage(format!(
                "key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        Ok(format!("{}{}", self.prefix, key))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SupervisorError> {
        self.store.get(&self.full_key(key)?)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), SupervisorError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(SupervisorError::Storage(format!(
                "value exceeds {} bytes",
                MAX_VALUE_LEN
            )));
        }
        self.store.set(&self.full_key(key)?, value)
    }

    pub fn remove(&self, key: &str) -> Result<(), SupervisorError> {
        self.store.remove(&self.full_key(key)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SupervisorError> {
        self.get(key)?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| SupervisorError::Storage(format!("corrupt record '{}': {}", key, e)))
            })
            .transpose()
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), SupervisorError> {
        let bytes = serde_json::to_vec(value).map_err(|e| SupervisorError::Storage(e.to_string()))?;
        self.set(key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partitions_do_not_overlap() {
        let store = Arc::new(MemoryKvStore::new());
        let notes = Partition::new(store.clone(), "local", "notes");
        let other = Partition::new(store.clone(), "local", "other");

        notes.set("greeting", b"hello").unwrap();
        assert_eq!(notes.get("greeting").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(other.get("greeting").unwrap(), None);
        assert_eq!(store.keys(), vec!["local:notes:greeting".to_string()]);

        other.remove("greeting").unwrap();
        assert!(notes.get("greeting").unwrap().is_some());
    }

    #[test]
    fn enforces_limits() {
        let partition = Partition::new(Arc::new(MemoryKvStore::new()), "local", "notes");
        assert!(partition.set(&"k".repeat(MAX_KEY_LEN + 1), b"v").is_err());
        assert!(partition.set("", b"v").is_err());
        let big = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            partition.set("big", &big),
            Err(SupervisorError::Storage(_))
        ));
        assert!(partition.set("fits", &vec![0u8; MAX_VALUE_LEN]).is_ok());
    }

    #[test]
    fn json_records() {
        let partition = Partition::new(Arc::new(MemoryKvStore::new()), "local", "supervisor");
        partition.set_json("rec", &json!({"a": 1})).unwrap();
        let back: Option<serde_json::Value> = partition.get_json("rec").unwrap();
        assert_eq!(back, Some(json!({"a": 1})));

        partition.set("rec", b"not json").unwrap();
        assert!(partition.get_json::<serde_json::Value>("rec").is_err());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileKvStore::open(&path).unwrap();
        store.set("local:notes:k", b"value").unwrap();
        store.set("local:notes:gone", b"x").unwrap();
        store.remove("local:notes:gone").unwrap();
        drop(store);

        let reopened = FileKvStore::open(&path).unwrap();
        assert_eq!(reopened.get("local:notes:k").unwrap(), Some(b"value".to_vec()));
        assert_eq!(reopened.get("local:notes:gone").unwrap(), None);
    }
}
