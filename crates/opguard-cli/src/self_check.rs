//! `self-check`: drive the execution pipeline end to end.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;

use opguard_core::access::{PermissionRegistry, StaticRoleProvider};
use opguard_core::audit::{AuditOutcome, MemoryAuditSink};
use opguard_core::config::GuardConfig;
use opguard_core::context::SecurityContext;
use opguard_core::error::{ConfigError, FailureKind, StoreError};
use opguard_core::executor::{BuildError, ExecutionScope, Executor};
use opguard_core::metrics::{new_shared_registry, SharedMetricsRegistry};
use opguard_core::operation::{FnOperation, OperationDescriptor, OperationError};
use opguard_core::storage::{StateStore, StoreConfig};
use opguard_core::validation::{RuleSet, ValueType};

const ACTOR: &str = "opguard-self-check";
const ROLE: &str = "self-check";

/// Self-check setup errors. Failed checks are reported, not returned.
#[derive(Debug, Error)]
pub enum SelfCheckError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("executor error: {0}")]
    Build(#[from] BuildError),
}

/// One named check.
#[derive(Debug)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// Outcome of a self-check run.
#[derive(Debug)]
pub struct Report {
    pub checks: Vec<Check>,
    pub prometheus: String,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            let mark = if check.passed { "ok  " } else { "FAIL" };
            out.push_str(&format!("[{}] {:<14} {}\n", mark, check.name, check.detail));
        }
        let passed = self.checks.iter().filter(|c| c.passed).count();
        out.push_str(&format!("{}/{} checks passed", passed, self.checks.len()));
        out
    }
}

struct Bench {
    executor: Executor,
    audit: Arc<MemoryAuditSink>,
    metrics: SharedMetricsRegistry,
    checks: Vec<Check>,
}

impl Bench {
    fn record(&mut self, name: &'static str, passed: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if passed {
            tracing::debug!(check = name, "self-check passed");
        } else {
            tracing::warn!(check = name, detail = %detail, "self-check failed");
        }
        self.checks.push(Check {
            name,
            passed,
            detail,
        });
    }
}

fn context(actor: &str) -> SecurityContext {
    SecurityContext::builder()
        .actor(actor)
        .origin("127.0.0.1")
        .session("self-check")
        .build()
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Run the checks against `data_dir`, or a temporary store.
pub fn run(config: Option<&Path>, data_dir: Option<&Path>) -> Result<Report, SelfCheckError> {
    let config = match config {
        Some(path) => GuardConfig::from_json_file(path)?,
        None => GuardConfig::default(),
    };
    let cache_enabled = config.cache.enabled;
    let store = StateStore::open(match data_dir {
        Some(dir) => StoreConfig::new(dir),
        None => StoreConfig::temporary(),
    })?;

    let registry = Arc::new(PermissionRegistry::new());
    registry.declare("selfcheck.write");
    registry.declare("selfcheck.read");
    let roles = Arc::new(StaticRoleProvider::new());
    roles.assign(ACTOR, ROLE);

    let audit = Arc::new(MemoryAuditSink::new());
    let metrics = new_shared_registry();
    let executor = Executor::builder(store)
        .config(config)
        .role_provider(roles)
        .permission_registry(registry)
        .audit_sink(audit.clone())
        .metrics(metrics.clone())
        .build()?;
    executor.access().define_role(ROLE, &["selfcheck.*"]);

    let mut bench = Bench {
        executor,
        audit,
        metrics,
        checks: Vec::new(),
    };
    tracing::info!("running self-check");

    check_commit(&mut bench);
    check_rollback(&mut bench)?;
    if cache_enabled {
        check_cache(&mut bench);
    } else {
        bench.record("cache", true, "skipped, cache disabled");
    }
    check_denial(&mut bench);

    Ok(Report {
        prometheus: bench.metrics.to_prometheus(),
        checks: bench.checks,
    })
}

fn check_commit(bench: &mut Bench) {
    let op = FnOperation::new(
        OperationDescriptor::new("selfcheck.write")
            .with_payload(payload(json!({"key": "probe", "value": 1})))
            .with_rules(RuleSet::new().required("key").typed("value", ValueType::Number))
            .require("selfcheck.write"),
        |scope: &mut ExecutionScope<'_>| {
            let key = format!("selfcheck:{}", scope.payload()["key"].as_str().unwrap_or("probe"));
            let value = scope.payload()["value"].clone();
            scope.put(key.clone(), value)?;
            Ok(json!({ "written": key }))
        },
    );
    let ctx = context(ACTOR);
    match bench.executor.execute(&op, &ctx) {
        Ok(result) => {
            let stored = bench.executor.store().get("selfcheck:probe").ok().flatten();
            let entries = bench.audit.for_correlation(ctx.correlation_id());
            let one_success = entries.len() == 1 && entries[0].outcome == AuditOutcome::Success;
            bench.record(
                "commit",
                stored == Some(json!(1)) && one_success,
                format!("committed in {:?}", result.elapsed),
            );
        }
        Err(e) => bench.record("commit", false, e.to_string()),
    }
}

fn check_rollback(bench: &mut Bench) -> Result<(), SelfCheckError> {
    let before = bench.executor.store().digest()?;
    let op = FnOperation::new(
        OperationDescriptor::new("selfcheck.write").require("selfcheck.write"),
        |scope: &mut ExecutionScope<'_>| {
            scope.put("selfcheck:partial", json!(true))?;
            Err(OperationError::failed("simulated failure"))
        },
    );
    let outcome = bench.executor.execute(&op, &context(ACTOR));
    let after = bench.executor.store().digest()?;
    match outcome {
        Err(e) if e.kind == FailureKind::ExecutionFailed => {
            bench.record("rollback", before == after, "store unchanged after failure")
        }
        Err(e) => bench.record("rollback", false, format!("unexpected failure {}", e.kind)),
        Ok(_) => bench.record("rollback", false, "failing body reported success"),
    }
    Ok(())
}

fn check_cache(bench: &mut Bench) {
    let op = FnOperation::new(
        OperationDescriptor::new("selfcheck.read")
            .with_payload(payload(json!({"key": "probe"})))
            .require("selfcheck.read")
            .cacheable(),
        |scope: &mut ExecutionScope<'_>| {
            let value = scope.get("selfcheck:probe")?;
            Ok(json!({ "value": value }))
        },
    );
    let first = bench.executor.execute(&op, &context(ACTOR));
    let second = bench.executor.execute(&op, &context(ACTOR));
    match (first, second) {
        (Ok(a), Ok(b)) => bench.record(
            "cache",
            !a.cached && b.cached && a.payload == b.payload,
            format!("hit rate {:.2}", bench.metrics.cache_hit_rate()),
        ),
        (Err(e), _) | (_, Err(e)) => bench.record("cache", false, e.to_string()),
    }
}

fn check_denial(bench: &mut Bench) {
    let op = FnOperation::new(
        OperationDescriptor::new("selfcheck.write").require("selfcheck.write"),
        |scope: &mut ExecutionScope<'_>| {
            scope.put("selfcheck:intruder", json!(true))?;
            Ok(Value::Null)
        },
    );
    match bench.executor.execute(&op, &context("intruder")) {
        Err(e) if e.kind == FailureKind::Unauthorized => {
            let untouched = bench
                .executor
                .store()
                .get("selfcheck:intruder")
                .map(|v| v.is_none())
                .unwrap_or(false);
            bench.record(
                "authorization",
                untouched,
                format!("denied, missing {:?}", e.missing_permissions()),
            )
        }
        Err(e) => bench.record("authorization", false, format!("unexpected failure {}", e.kind)),
        Ok(_) => bench.record("authorization", false, "unauthorized actor was admitted"),
    }
}
