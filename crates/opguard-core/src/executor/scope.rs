//! Handle an operation body uses to touch state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::cancel::CancellationToken;
use super::Executor;
use crate::backup::{BackupPoint, Compensation};
use crate::context::SecurityContext;
use crate::error::SecurityFailure;
use crate::operation::{Operation, OperationDescriptor, OperationError, Payload};
use crate::storage::Transaction;

/// Execution environment of one invocation.
///
/// Store access goes through the invocation's transaction and is counted
/// by the monitor. Side effects the store cannot undo register a
/// compensation with [`on_rollback`](Self::on_rollback).
pub struct ExecutionScope<'a> {
    executor: &'a Executor,
    context: &'a SecurityContext,
    descriptor: &'a OperationDescriptor,
    txn: &'a mut Transaction,
    backup: &'a mut BackupPoint,
    calls: Arc<AtomicU64>,
    cancel: &'a CancellationToken,
    started_at: u64,
    deadline: Option<Duration>,
    nested: u32,
}

impl<'a> ExecutionScope<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        executor: &'a Executor,
        context: &'a SecurityContext,
        descriptor: &'a OperationDescriptor,
        txn: &'a mut Transaction,
        backup: &'a mut BackupPoint,
        calls: Arc<AtomicU64>,
        cancel: &'a CancellationToken,
        started_at: u64,
        deadline: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            context,
            descriptor,
            txn,
            backup,
            calls,
            cancel,
            started_at,
            deadline,
            nested: 0,
        }
    }

    /// Context of the invocation.
    pub fn context(&self) -> &SecurityContext {
        self.context
    }

    /// The operation's descriptor.
    pub fn descriptor(&self) -> &OperationDescriptor {
        self.descriptor
    }

    /// The operation's payload.
    pub fn payload(&self) -> &Payload {
        self.descriptor.payload()
    }

    /// Transaction nesting depth (1 for a top-level invocation).
    pub fn depth(&self) -> usize {
        self.txn.depth()
    }

    /// Read a value, seeing this invocation's uncommitted writes.
    pub fn get(&mut self, key: &str) -> Result<Option<Value>, OperationError> {
        self.count_call();
        Ok(self.txn.get(key)?)
    }

    /// Check whether a key exists.
    pub fn exists(&mut self, key: &str) -> Result<bool, OperationError> {
        self.count_call();
        Ok(self.txn.exists(key)?)
    }

    /// Queue a write, applied on commit.
    pub fn put(&mut self, key: impl Into<String>, value: Value) -> Result<(), OperationError> {
        self.count_call();
        Ok(self.txn.put(key, value)?)
    }

    /// Queue a delete, applied on commit.
    pub fn delete(&mut self, key: impl Into<String>) -> Result<(), OperationError> {
        self.count_call();
        Ok(self.txn.delete(key)?)
    }

    /// Register an undo action run if the invocation fails.
    ///
    /// Compensations run newest first.
    pub fn on_rollback<F>(&mut self, label: impl Into<String>, undo: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.backup.push(Compensation::new(label, undo));
    }

    /// Fail if the invocation was cancelled or its hard deadline passed.
    pub fn checkpoint(&self) -> Result<(), OperationError> {
        if self.cancel.is_cancelled() {
            return Err(OperationError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            let elapsed = self.executor.clock().elapsed_since(self.started_at);
            if elapsed >= deadline {
                return Err(OperationError::DeadlineExceeded {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Run a nested critical operation inside this invocation's
    /// transaction.
    ///
    /// The child gets the context `{correlation id}.{n}`, its own checks,
    /// backup point and audit entry. Its writes fold into this transaction
    /// and its compensations into this backup point when it succeeds.
    pub fn execute_nested(&mut self, operation: &dyn Operation) -> Result<Value, SecurityFailure> {
        self.nested += 1;
        let child = self.context.child(self.nested);
        self.executor.execute_nested(
            operation,
            &child,
            &mut *self.txn,
            &mut *self.backup,
            self.calls.clone(),
            self.cancel,
            self.started_at,
        )
    }

    fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}
