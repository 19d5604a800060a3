//! Result cache and audit trail behavior through the executor.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{context, payload, TestContext};
use opguard_core::access::{PermissionRegistry, StaticRoleProvider};
use opguard_core::audit::{read_records, AuditOutcome, JsonLinesAuditSink};
use opguard_core::cache::{canonical_json, Fingerprint};
use opguard_core::config::{CacheConfig, GuardConfig};
use opguard_core::emergency::LockoutEmergencyProtocol;
use opguard_core::error::FailureKind;
use opguard_core::executor::{ExecutionScope, Executor};
use opguard_core::operation::{FnOperation, Operation, OperationDescriptor, OperationError};
use opguard_core::storage::{StateStore, StoreConfig};
use opguard_core::validation::{ReferenceLookup, RuleSet};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

fn reader_context(config: GuardConfig) -> TestContext {
    let ctx = TestContext::new(config, &["notes.read"]);
    ctx.grant_role("alice", "reader", &["notes.read"]);
    ctx
}

fn counted_read(
    runs: Arc<AtomicUsize>,
) -> FnOperation<impl Fn(&mut ExecutionScope<'_>) -> Result<Value, OperationError>> {
    FnOperation::new(
        OperationDescriptor::new("notes.get")
            .with_payload(payload(json!({"id": "n1", "fields": ["text", "owner"]})))
            .require("notes.read")
            .cacheable()
            .tag("note:n1"),
        move |_: &mut ExecutionScope<'_>| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": "n1", "owner": "alice"}))
        },
    )
}

#[test]
fn test_cached_read_is_idempotent() {
    let ctx = reader_context(GuardConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let op = counted_read(runs.clone());

    let first = ctx.executor.execute(&op, &context("alice")).unwrap();
    let second = ctx.executor.execute(&op, &context("alice")).unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.payload, second.payload);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.executor.cache().stats().hits(), 1);
    assert_eq!(ctx.metrics.kind_metrics("notes.get").cache_hits, 1);
}

#[test]
fn test_cache_entry_keyed_by_sha256_of_kind_payload_and_scope() {
    let ctx = reader_context(GuardConfig::default());
    let op = counted_read(Arc::new(AtomicUsize::new(0)));
    let alice = context("alice");
    ctx.executor.execute(&op, &alice).unwrap();

    let descriptor = op.descriptor();
    let scope = ctx.executor.access().security_scope(&alice);
    let mut hasher = Sha256::new();
    hasher.update(b"notes.get");
    hasher.update(canonical_json(&Value::Object(descriptor.payload().clone())).as_bytes());
    hasher.update(scope.as_bytes());
    let expected = hex::encode(hasher.finalize());

    let fingerprint = Fingerprint::new("notes.get", descriptor.payload());
    assert_eq!(fingerprint.key(&scope).as_str(), expected);
    assert_eq!(ctx.executor.cache().len(), 1);
    assert!(ctx.executor.cache().get(&fingerprint, &scope).is_some());
}

#[test]
fn test_cache_is_partitioned_by_security_scope() {
    let ctx = reader_context(GuardConfig::default());
    ctx.grant_role("carol", "auditor", &["notes.read"]);
    let runs = Arc::new(AtomicUsize::new(0));
    let op = counted_read(runs.clone());

    ctx.executor.execute(&op, &context("alice")).unwrap();
    let carol = ctx.executor.execute(&op, &context("carol")).unwrap();

    assert!(!carol.cached);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.executor.cache().len(), 2);
}

#[test]
fn test_failed_revalidation_is_never_served() {
    let ctx = reader_context(GuardConfig::default());
    let owners: Arc<RwLock<HashSet<String>>> =
        Arc::new(RwLock::new(["alice".to_string()].into_iter().collect()));
    let known = owners.clone();
    ctx.executor.validation().register_lookup(
        "users",
        Arc::new(move |value: &Value| {
            value
                .as_str()
                .is_some_and(|name| known.read().contains(name))
        }) as Arc<dyn ReferenceLookup>,
    );

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let op = FnOperation::new(
        OperationDescriptor::new("notes.get")
            .with_payload(payload(json!({"id": "n1"})))
            .with_result_rules(RuleSet::new().required("owner").references("owner", "users"))
            .require("notes.read")
            .cacheable(),
        move |_: &mut ExecutionScope<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"id": "n1", "owner": "alice"}))
        },
    );

    assert!(!ctx.executor.execute(&op, &context("alice")).unwrap().cached);
    assert!(ctx.executor.execute(&op, &context("alice")).unwrap().cached);

    owners.write().remove("alice");

    for _ in 0..2 {
        let err = ctx.executor.execute(&op, &context("alice")).unwrap_err();
        assert_eq!(err.kind, FailureKind::ResultInvalid);
    }
    assert_eq!(ctx.executor.cache().stats().integrity_failures(), 1);
    assert!(ctx.executor.cache().is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn test_cache_entries_expire_with_kind_ttl() {
    let config = GuardConfig::default()
        .with_cache(CacheConfig::default().with_kind_ttl("notes.get", 500));
    let ctx = reader_context(config);
    let runs = Arc::new(AtomicUsize::new(0));
    let op = counted_read(runs.clone());

    ctx.executor.execute(&op, &context("alice")).unwrap();
    ctx.clock.advance(Duration::from_millis(499));
    assert!(ctx.executor.execute(&op, &context("alice")).unwrap().cached);

    ctx.clock.advance(Duration::from_millis(1));
    assert!(!ctx.executor.execute(&op, &context("alice")).unwrap().cached);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.executor.cache().stats().expirations(), 1);
}

#[test]
fn test_tag_invalidation_forces_reexecution() {
    let ctx = reader_context(GuardConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let op = counted_read(runs.clone());

    ctx.executor.execute(&op, &context("alice")).unwrap();
    ctx.executor.cache().invalidate_tags(&["note:n1"]);
    let again = ctx.executor.execute(&op, &context("alice")).unwrap();

    assert!(!again.cached);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failed_operation_is_not_cached() {
    let ctx = reader_context(GuardConfig::default());
    let op = FnOperation::new(
        OperationDescriptor::new("notes.get")
            .with_payload(payload(json!({"id": "missing"})))
            .require("notes.read")
            .cacheable(),
        |_: &mut ExecutionScope<'_>| Err(OperationError::failed("note not found")),
    );

    assert!(ctx.executor.execute(&op, &context("alice")).is_err());
    assert!(ctx.executor.cache().is_empty());
}

#[test]
fn test_cacheable_body_may_reenter_its_own_fingerprint() {
    let ctx = reader_context(GuardConfig::default());
    let runs = Arc::new(AtomicUsize::new(0));
    let inner = counted_read(runs.clone());
    let executor = &ctx.executor;
    let inner_ref = &inner;
    let outer = FnOperation::new(
        OperationDescriptor::new("notes.get")
            .with_payload(payload(json!({"id": "n1", "fields": ["text", "owner"]})))
            .require("notes.read")
            .cacheable(),
        move |_: &mut ExecutionScope<'_>| {
            let warmed = executor.execute(inner_ref, &context("alice"))?;
            Ok(warmed.payload)
        },
    );

    let result = ctx.executor.execute(&outer, &context("alice")).unwrap();

    assert_eq!(result.payload, json!({"id": "n1", "owner": "alice"}));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.executor.cache().populating(), 0);
    assert!(ctx.executor.execute(&outer, &context("alice")).unwrap().cached);
}

#[test]
fn test_panicking_cacheable_body_leaves_no_populate_lock() {
    let ctx = reader_context(GuardConfig::default());
    let op = FnOperation::new(
        OperationDescriptor::new("notes.get")
            .with_payload(payload(json!({"id": "n9"})))
            .require("notes.read")
            .cacheable(),
        |_: &mut ExecutionScope<'_>| -> Result<Value, OperationError> {
            panic!("decoder bug");
        },
    );

    let err = ctx.executor.execute(&op, &context("alice")).unwrap_err();

    assert_eq!(err.kind, FailureKind::ExecutionFailed);
    assert_eq!(ctx.executor.cache().populating(), 0);
    assert!(ctx.executor.cache().is_empty());
    assert_eq!(ctx.executor.monitor().active_count(), 0);
}

#[test]
fn test_json_lines_audit_log_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("audit.jsonl");
    let store = StateStore::open(StoreConfig::temporary()).unwrap();
    let registry = Arc::new(PermissionRegistry::new());
    registry.declare("accounts.login");
    let roles = Arc::new(StaticRoleProvider::new());
    roles.assign("alice", "member");
    let sink = Arc::new(JsonLinesAuditSink::open(&log_path).unwrap());

    let executor = Executor::builder(store)
        .role_provider(roles)
        .permission_registry(registry)
        .audit_sink(sink)
        .build()
        .unwrap();
    executor.access().define_role("member", &["accounts.login"]);

    let ok = FnOperation::new(
        OperationDescriptor::new("accounts.login")
            .with_payload(payload(json!({"user": "alice", "password": "hunter2"})))
            .require("accounts.login"),
        |scope: &mut ExecutionScope<'_>| {
            scope.put("session:alice", json!({"active": true}))?;
            Ok(json!({"session": "alice"}))
        },
    );
    let failing = FnOperation::new(
        OperationDescriptor::new("accounts.login").require("accounts.login"),
        |_: &mut ExecutionScope<'_>| {
            Err(OperationError::failed("login rejected: password=hunter2"))
        },
    );
    let first = context("alice");
    let second = context("alice");
    executor.execute(&ok, &first).unwrap();
    executor.execute(&failing, &second).unwrap_err();
    executor.audit().flush();

    let records = read_records(&log_path).unwrap();
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].correlation_id, first.correlation_id());
    assert_eq!(records[0].outcome, AuditOutcome::Success);
    assert!(records[0].error_kind.is_none());

    assert_eq!(records[1].correlation_id, second.correlation_id());
    assert_eq!(records[1].outcome, AuditOutcome::Failure);
    assert_eq!(records[1].error_kind, Some(FailureKind::ExecutionFailed));
    let message = records[1].error_message.as_deref().unwrap_or_default();
    assert!(!message.contains("hunter2"));
    assert!(message.contains("[REDACTED]"));

    let raw = std::fs::read_to_string(&log_path).unwrap();
    assert!(!raw.contains("hunter2"));
}

#[test]
fn test_repeated_denials_lock_out_actor() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(StoreConfig::new(dir.path())).unwrap();
    let registry = Arc::new(PermissionRegistry::new());
    registry.declare("admin.purge");
    let roles = Arc::new(StaticRoleProvider::new());

    // The lockout protocol needs the executor's access control, so build it first.
    let executor = Executor::builder(store.clone())
        .role_provider(roles.clone())
        .permission_registry(registry.clone())
        .build()
        .unwrap();
    let lockout = Arc::new(LockoutEmergencyProtocol::new(executor.access().clone(), 2));
    let executor = Executor::builder(store)
        .access(executor.access().clone())
        .emergency(lockout.clone())
        .build()
        .unwrap();

    let purge = FnOperation::new(
        OperationDescriptor::new("admin.purge").require("admin.purge"),
        |_: &mut ExecutionScope<'_>| Ok(json!({})),
    );
    for _ in 0..2 {
        let err = executor.execute(&purge, &context("mallory")).unwrap_err();
        assert_eq!(err.kind, FailureKind::Unauthorized);
    }
    assert!(executor.access().is_locked_out("mallory"));

    // Even a later grant does not help while the lockout stands.
    executor.access().define_role("admin", &["admin.*"]);
    roles.assign("mallory", "admin");
    executor.access().invalidate_actor("mallory");
    assert_eq!(
        executor.execute(&purge, &context("mallory")).unwrap_err().kind,
        FailureKind::Unauthorized
    );

    executor.access().lift_lockout("mallory");
    lockout.forgive("mallory");
    assert!(executor.execute(&purge, &context("mallory")).is_ok());
}
