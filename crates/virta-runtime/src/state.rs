//! Keyed state storage
//!
//! Per-key, per-namespace byte-value storage behind a capability trait. The
//! scheduler owns an injected handle and addresses everything by
//! `(namespace, key)`; no component ever reaches another key's state.
//!
//! # Example
//! ```ignore
//! use virta_runtime::state::{KeyedStateStore, FileStateStore};
//!
//! let store = FileStateStore::open("/var/lib/virta/state")?;
//! store.put("step-1/restriction", b"k1", &bytes)?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[cfg(feature = "persistence")]
use std::path::Path;
#[cfg(feature = "persistence")]
use tracing::info;

/// Error type for state store operations
#[derive(Debug)]
pub enum StoreError {
    /// I/O or storage error
    Io(String),
    /// Serialization error
    Serialization(String),
    /// Key not found
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(s) => write!(f, "I/O error: {}", s),
            StoreError::Serialization(s) => write!(f, "Serialization error: {}", s),
            StoreError::NotFound(s) => write!(f, "Key not found: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for keyed state storage backends.
///
/// Implementations are internally synchronized; the scheduler only ever
/// issues key-scoped operations, so no cross-key coordination is required.
pub trait KeyedStateStore: Send + Sync {
    /// Retrieve the value stored under `(namespace, key)`, if any.
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value under `(namespace, key)`, overwriting any prior value.
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Remove the value under `(namespace, key)`; no-op if absent.
    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError>;

    /// List all keys present in a namespace, in unsigned-byte order.
    fn list_keys(&self, namespace: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Flush all pending writes to durable storage.
    fn flush(&self) -> Result<(), StoreError>;
}

/// In-memory state store for testing and single-process runs
#[derive(Default)]
pub struct MemoryStateStore {
    namespaces: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyedStateStore for MemoryStateStore {
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let namespaces = self
            .namespaces
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut namespaces = self
            .namespaces
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError> {
        let mut namespaces = self
            .namespaces
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        if let Some(ns) = namespaces.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let namespaces = self
            .namespaces
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(()) // No-op for memory store
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// File-system based state store
///
/// Stores each value as `<dir>/<namespace>/<hex(key)>`. Writes are atomic
/// via temp file + rename, so a crash mid-write never leaves a torn value.
pub struct FileStateStore {
    dir: std::path::PathBuf,
}

impl FileStateStore {
    /// Open or create a file-based store rooted at the given directory
    pub fn open(dir: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn key_to_path(&self, namespace: &str, key: &[u8]) -> std::path::PathBuf {
        self.dir.join(namespace).join(hex_encode(key))
    }
}

impl KeyedStateStore for FileStateStore {
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.key_to_path(namespace, key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let path = self.key_to_path(namespace, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError> {
        let path = self.key_to_path(namespace, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let ns_dir = self.dir.join(namespace);
        if !ns_dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&ns_dir).map_err(|e| StoreError::Io(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = hex_decode(name) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(()) // File writes are already flushed on rename
    }
}

/// RocksDB-based keyed state store
#[cfg(feature = "persistence")]
pub struct RocksDbStateStore {
    db: rocksdb::DB,
}

#[cfg(feature = "persistence")]
impl RocksDbStateStore {
    /// Open or create a RocksDB store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        let db = rocksdb::DB::open(&opts, path).map_err(|e| StoreError::Io(e.to_string()))?;

        info!("Opened RocksDB keyed state store");
        Ok(Self { db })
    }

    fn full_key(namespace: &str, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(namespace.len() + 1 + key.len());
        full.extend_from_slice(namespace.as_bytes());
        full.push(0);
        full.extend_from_slice(key);
        full
    }
}

#[cfg(feature = "persistence")]
impl KeyedStateStore for RocksDbStateStore {
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(Self::full_key(namespace, key))
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .put(Self::full_key(namespace, key), value)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .delete(Self::full_key(namespace, key))
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut prefix = namespace.as_bytes().to_vec();
        prefix.push(0);

        let mut keys = Vec::new();
        for item in self.db.prefix_iterator(&prefix) {
            let (full, _) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            if let Some(key) = full.strip_prefix(prefix.as_slice()) {
                keys.push(key.to_vec());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Io(e.to_string()))
    }
}
