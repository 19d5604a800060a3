//! Transactional state store backed by sled.
//!
//! Operation bodies never touch sled directly. They read and write through a
//! [`Transaction`] owned by the invocation, and the write set is applied in a
//! single sled transaction when the outermost scope commits.

mod transaction;

pub use transaction::{Transaction, TransactionGuard, TransactionOp};

use std::path::PathBuf;

use serde_json::Value;
use sha2::{Digest, Sha256};
use sled::{Db, Tree};

use crate::error::StoreError;

/// Tree holding operation state.
const STATE_TREE: &str = "state";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Enable zstd compression.
    pub compression: bool,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./opguard_data"),
            cache_capacity: 64 * 1024 * 1024,
            flush_every_ms: Some(500),
            compression: true,
            temporary: false,
        }
    }
}

impl StoreConfig {
    /// Create a configuration for the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary in-memory configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(self.compression)
            .flush_every_ms(self.flush_every_ms);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }
        config
    }
}

/// Key/value store for state mutated by critical operations.
///
/// Values are JSON documents. Cloning is cheap and shares the database.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    state: Tree,
}

impl StateStore {
    /// Open or create a store.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let db = config.to_sled_config().open()?;
        let state = db.open_tree(STATE_TREE)?;
        Ok(Self { db, state })
    }

    /// Read a value outside any transaction.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.state.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a value outside any transaction.
    pub fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.state.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Remove a value outside any transaction.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state.remove(key.as_bytes())?;
        Ok(())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether the store holds no state.
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for item in self.state.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// SHA-256 digest over every key and value.
    ///
    /// Two stores with equal digests hold identical state.
    pub fn digest(&self) -> Result<String, StoreError> {
        let mut hasher = Sha256::new();
        for item in self.state.iter() {
            let (key, value) = item?;
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(&key);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(&value);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.state.clone())
    }

    /// Monotonic id unique to this database, surviving restarts.
    pub fn generate_id(&self) -> Result<u64, StoreError> {
        Ok(self.db.generate_id()?)
    }

    /// Open an auxiliary tree in the same database.
    pub fn open_tree(&self, name: &str) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(name)?)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get_delete() {
        let store = StateStore::open(StoreConfig::temporary()).unwrap();
        store.put("article:1", &json!({"title": "Hello"})).unwrap();
        assert_eq!(store.get("article:1").unwrap(), Some(json!({"title": "Hello"})));
        assert_eq!(store.len(), 1);

        store.delete("article:1").unwrap();
        assert_eq!(store.get("article:1").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_digest_tracks_content() {
        let store = StateStore::open(StoreConfig::temporary()).unwrap();
        let empty = store.digest().unwrap();

        store.put("a", &json!(1)).unwrap();
        let one = store.digest().unwrap();
        assert_ne!(empty, one);

        store.delete("a").unwrap();
        assert_eq!(store.digest().unwrap(), empty);
    }

    #[test]
    fn test_keys_with_prefix() {
        let store = StateStore::open(StoreConfig::temporary()).unwrap();
        store.put("user:1", &json!("a")).unwrap();
        store.put("user:2", &json!("b")).unwrap();
        store.put("post:1", &json!("c")).unwrap();
        assert_eq!(store.keys_with_prefix("user:").unwrap(), vec!["user:1", "user:2"]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(StoreConfig::new(dir.path())).unwrap();
            store.put("k", &json!({"v": 1})).unwrap();
            store.flush().unwrap();
        }
        let store = StateStore::open(StoreConfig::new(dir.path())).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!({"v": 1})));
    }
}
