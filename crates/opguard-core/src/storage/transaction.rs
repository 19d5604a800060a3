//! Invocation-scoped transactions with savepoints.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use serde_json::Value;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Tree};
use tracing::debug;

use crate::error::StoreError;

/// A pending write.
#[derive(Debug, Clone)]
pub enum TransactionOp {
    /// Store an encoded value.
    Put {
        /// Key.
        key: String,
        /// JSON-encoded value.
        bytes: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Key.
        key: String,
    },
}

impl TransactionOp {
    fn key(&self) -> &str {
        match self {
            TransactionOp::Put { key, .. } | TransactionOp::Delete { key } => key,
        }
    }
}

/// A transaction owned by one top-level invocation.
///
/// Writes are buffered and applied atomically when the outermost
/// [`TransactionGuard`] commits. Every key read from the store is tracked;
/// commit fails with [`StoreError::Conflict`] if any of them changed in the
/// meantime. Nested scopes take a savepoint on entry and roll back to it
/// unless they commit.
pub struct Transaction {
    tree: Tree,
    ops: Vec<TransactionOp>,
    /// Keys read from the store with the value observed.
    read_set: HashMap<String, Option<IVec>>,
    /// Uncommitted writes (key -> value, None for deleted).
    write_cache: HashMap<String, Option<Value>>,
    /// Operation count at each open scope.
    savepoints: Vec<usize>,
}

impl Transaction {
    pub(crate) fn new(tree: Tree) -> Self {
        Self {
            tree,
            ops: Vec::new(),
            read_set: HashMap::new(),
            write_cache: HashMap::new(),
            savepoints: Vec::new(),
        }
    }

    /// Open a scope. The outermost scope owns the store transaction.
    pub fn enter(&mut self) -> TransactionGuard<'_> {
        self.savepoints.push(self.ops.len());
        debug!(depth = self.savepoints.len(), "transaction scope entered");
        TransactionGuard {
            txn: self,
            finished: false,
        }
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Whether any scope is open.
    pub fn is_active(&self) -> bool {
        !self.savepoints.is_empty()
    }

    /// Pending operations.
    pub fn operations(&self) -> &[TransactionOp] {
        &self.ops
    }

    /// Number of pending operations.
    pub fn operation_count(&self) -> usize {
        self.ops.len()
    }

    /// Read a value, seeing this transaction's uncommitted writes.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(cached) = self.write_cache.get(key) {
            return Ok(cached.clone());
        }
        let raw = self.read_tracked(key)?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Check whether a key exists.
    pub fn exists(&mut self, key: &str) -> Result<bool, StoreError> {
        if let Some(cached) = self.write_cache.get(key) {
            return Ok(cached.is_some());
        }
        Ok(self.read_tracked(key)?.is_some())
    }

    /// Queue a write.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Result<(), StoreError> {
        self.ensure_active()?;
        let key = key.into();
        let bytes = serde_json::to_vec(&value)?;
        self.write_cache.insert(key.clone(), Some(value));
        self.ops.push(TransactionOp::Put { key, bytes });
        Ok(())
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_active()?;
        let key = key.into();
        self.write_cache.insert(key.clone(), None);
        self.ops.push(TransactionOp::Delete { key });
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), StoreError> {
        if self.savepoints.is_empty() {
            return Err(StoreError::Transaction(
                "write outside of a transaction scope".into(),
            ));
        }
        Ok(())
    }

    fn read_tracked(&mut self, key: &str) -> Result<Option<IVec>, StoreError> {
        let raw = self.tree.get(key.as_bytes())?;
        self.read_set
            .entry(key.to_string())
            .or_insert_with(|| raw.clone());
        Ok(raw)
    }

    fn release_commit(&mut self) -> Result<(), StoreError> {
        if self.savepoints.pop().is_none() {
            return Err(StoreError::Transaction(
                "commit without an open scope".into(),
            ));
        }
        if !self.savepoints.is_empty() {
            debug!(depth = self.savepoints.len(), "nested scope committed into parent");
            return Ok(());
        }

        let result = self.apply();
        self.reset();
        result
    }

    fn release_rollback(&mut self) {
        let Some(savepoint) = self.savepoints.pop() else {
            return;
        };
        self.ops.truncate(savepoint);
        self.rebuild_write_cache();
        if self.savepoints.is_empty() {
            self.reset();
        }
        debug!(
            depth = self.savepoints.len(),
            savepoint, "transaction scope rolled back"
        );
    }

    fn rebuild_write_cache(&mut self) {
        self.write_cache.clear();
        for op in &self.ops {
            let value = match op {
                TransactionOp::Put { bytes, .. } => serde_json::from_slice(bytes).ok(),
                TransactionOp::Delete { .. } => None,
            };
            self.write_cache.insert(op.key().to_string(), value);
        }
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.read_set.clear();
        self.write_cache.clear();
    }

    /// Apply the write set after re-checking the read set, atomically.
    fn apply(&self) -> Result<(), StoreError> {
        if self.ops.is_empty() && self.read_set.is_empty() {
            return Ok(());
        }

        let result: Result<(), TransactionError<StoreError>> = self.tree.transaction(|tx| {
            for (key, observed) in &self.read_set {
                let current = tx.get(key.as_bytes())?;
                if current != *observed {
                    return Err(ConflictableTransactionError::Abort(StoreError::Conflict {
                        key: key.clone(),
                    }));
                }
            }
            for op in &self.ops {
                match op {
                    TransactionOp::Put { key, bytes } => {
                        tx.insert(key.as_bytes(), bytes.as_slice())?;
                    }
                    TransactionOp::Delete { key } => {
                        tx.remove(key.as_bytes())?;
                    }
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(ops = self.ops.len(), "transaction applied");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }
}

/// RAII handle for one transaction scope.
///
/// Dropping the guard without calling [`commit`](Self::commit) rolls the
/// scope back to its savepoint.
pub struct TransactionGuard<'a> {
    txn: &'a mut Transaction,
    finished: bool,
}

impl TransactionGuard<'_> {
    /// Commit this scope.
    ///
    /// Nested scopes fold into their parent; the outermost scope applies
    /// the write set to the store.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        self.txn.release_commit()
    }

    /// Roll this scope back to its savepoint.
    pub fn rollback(mut self) {
        self.finished = true;
        self.txn.release_rollback();
    }
}

impl Deref for TransactionGuard<'_> {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        self.txn
    }
}

impl DerefMut for TransactionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Transaction {
        self.txn
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.txn.release_rollback();
        }
    }
}
