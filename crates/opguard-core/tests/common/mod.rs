//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use opguard_core::access::{PermissionRegistry, StaticRoleProvider};
use opguard_core::audit::{AuditEntry, MemoryAuditSink};
use opguard_core::backup::StoreBackupService;
use opguard_core::clock::{ManualClock, SharedClock};
use opguard_core::config::GuardConfig;
use opguard_core::context::SecurityContext;
use opguard_core::emergency::RecordingEmergencyProtocol;
use opguard_core::executor::Executor;
use opguard_core::metrics::{new_shared_registry, SharedMetricsRegistry};
use opguard_core::monitor::NullProbe;
use opguard_core::operation::Payload;
use opguard_core::storage::{StateStore, StoreConfig};
use serde_json::Value;

pub const START_MICROS: u64 = 1_000_000;

pub struct TestContext {
    pub executor: Executor,
    pub clock: Arc<ManualClock>,
    pub roles: Arc<StaticRoleProvider>,
    pub audit: Arc<MemoryAuditSink>,
    pub emergency: Arc<RecordingEmergencyProtocol>,
    pub backup: Arc<StoreBackupService>,
    pub metrics: SharedMetricsRegistry,
    _dir: tempfile::TempDir,
}

impl TestContext {
    /// Executor over an on-disk store with the given permissions declared.
    pub fn new(config: GuardConfig, permissions: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(StoreConfig::new(dir.path())).unwrap();
        let clock = Arc::new(ManualClock::new(START_MICROS));
        let shared: SharedClock = clock.clone();

        let registry = Arc::new(PermissionRegistry::new());
        for permission in permissions {
            registry.declare(*permission);
        }
        let roles = Arc::new(StaticRoleProvider::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let emergency = Arc::new(RecordingEmergencyProtocol::new());
        let backup = Arc::new(StoreBackupService::open(store.clone(), shared.clone()).unwrap());
        let metrics = new_shared_registry();

        let executor = Executor::builder(store)
            .config(config)
            .clock(shared)
            .probe(Arc::new(NullProbe))
            .role_provider(roles.clone())
            .permission_registry(registry)
            .audit_sink(audit.clone())
            .backup(backup.clone())
            .emergency(emergency.clone())
            .metrics(metrics.clone())
            .build()
            .unwrap();

        Self {
            executor,
            clock,
            roles,
            audit,
            emergency,
            backup,
            metrics,
            _dir: dir,
        }
    }

    /// Define `role` with `grants` and give it to `actor`.
    pub fn grant_role(&self, actor: &str, role: &str, grants: &[&str]) {
        self.executor.access().define_role(role, grants);
        self.roles.assign(actor, role);
        self.executor.access().invalidate_actor(actor);
    }

    /// Outcome entries (operation or unauthorized access) of a correlation id.
    pub fn outcome_entries(&self, correlation_id: &str) -> Vec<AuditEntry> {
        self.audit
            .for_correlation(correlation_id)
            .into_iter()
            .filter(|e| e.category.is_outcome())
            .collect()
    }
}

pub fn context(actor: &str) -> SecurityContext {
    SecurityContext::builder()
        .actor(actor)
        .origin("10.0.0.7")
        .session("session-1")
        .build()
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}
