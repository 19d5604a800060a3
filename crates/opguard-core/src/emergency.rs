//! Emergency escalation.
//!
//! The executor invokes the protocol for security-critical failures
//! (`Unauthorized`, `ResultInvalid`) and for critical threshold breaches.
//! Protocols must not fail and must not block for long.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::access::AccessControl;
use crate::context::SecurityContext;
use crate::error::FailureKind;

/// Why the protocol was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncidentReason {
    /// A security-critical failure.
    SecurityFailure {
        /// Failure kind.
        kind: FailureKind,
    },
    /// A metric exceeded the critical multiple of its ceiling.
    CriticalThreshold {
        /// Human-readable breach summary.
        summary: String,
    },
}

impl IncidentReason {
    /// Failure kind recorded in the audit trail.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            IncidentReason::SecurityFailure { kind } => *kind,
            IncidentReason::CriticalThreshold { .. } => FailureKind::ThresholdViolation,
        }
    }
}

/// One escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// Operation kind.
    pub kind: String,
    /// Actor of the invocation.
    pub actor_id: String,
    /// Network origin of the invocation.
    pub origin: String,
    /// Correlation id.
    pub correlation_id: String,
    /// Trigger.
    pub reason: IncidentReason,
    /// Escalation time (micros).
    pub timestamp: u64,
}

impl Incident {
    /// Create an incident for an invocation.
    pub fn new(
        context: &SecurityContext,
        kind: &str,
        reason: IncidentReason,
        timestamp: u64,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            actor_id: context.actor_id().to_string(),
            origin: context.origin().to_string(),
            correlation_id: context.correlation_id().to_string(),
            reason,
            timestamp,
        }
    }

    /// One-line description.
    pub fn describe(&self) -> String {
        match &self.reason {
            IncidentReason::SecurityFailure { kind } => {
                format!("{} on {} by {}", kind, self.kind, self.actor_id)
            }
            IncidentReason::CriticalThreshold { summary } => {
                format!("critical threshold on {}: {}", self.kind, summary)
            }
        }
    }
}

/// Escalation hook.
pub trait EmergencyProtocol: Send + Sync {
    /// Handle an incident.
    fn invoke(&self, incident: &Incident);
}

/// Protocol that reports incidents through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEmergencyProtocol;

impl EmergencyProtocol for LoggingEmergencyProtocol {
    fn invoke(&self, incident: &Incident) {
        error!(
            target: "opguard::emergency",
            kind = %incident.kind,
            actor = %incident.actor_id,
            origin = %incident.origin,
            correlation_id = %incident.correlation_id,
            trigger = %incident.reason.failure_kind(),
            "emergency protocol invoked: {}",
            incident.describe()
        );
    }
}

/// Protocol that locks an actor out after repeated security failures.
///
/// Threshold incidents are logged but never lock anyone out. The system
/// actor is never locked out.
pub struct LockoutEmergencyProtocol {
    access: Arc<AccessControl>,
    max_incidents: u32,
    incidents: DashMap<String, u32>,
}

impl LockoutEmergencyProtocol {
    /// Lock actors out on their `max_incidents`th security failure.
    pub fn new(access: Arc<AccessControl>, max_incidents: u32) -> Self {
        Self {
            access,
            max_incidents: max_incidents.max(1),
            incidents: DashMap::new(),
        }
    }

    /// Security incidents counted for an actor.
    pub fn incidents_for(&self, actor_id: &str) -> u32 {
        self.incidents.get(actor_id).map(|n| *n).unwrap_or(0)
    }

    /// Forget an actor's incidents (after a lockout is lifted).
    pub fn forgive(&self, actor_id: &str) {
        self.incidents.remove(actor_id);
    }
}

impl EmergencyProtocol for LockoutEmergencyProtocol {
    fn invoke(&self, incident: &Incident) {
        LoggingEmergencyProtocol.invoke(incident);

        let IncidentReason::SecurityFailure { kind } = &incident.reason else {
            return;
        };
        if incident.actor_id == crate::context::SYSTEM_ACTOR {
            return;
        }
        let count = {
            let mut entry = self.incidents.entry(incident.actor_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= self.max_incidents && !self.access.is_locked_out(&incident.actor_id) {
            self.access.lock_out(
                incident.actor_id.clone(),
                format!("{} security incidents, last {} on {}", count, kind, incident.kind),
            );
        }
    }
}

/// Protocol that keeps every incident in memory.
#[derive(Debug, Default)]
pub struct RecordingEmergencyProtocol {
    incidents: Mutex<Vec<Incident>>,
}

impl RecordingEmergencyProtocol {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded incidents.
    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().clone()
    }

    /// Number of recorded incidents.
    pub fn len(&self) -> usize {
        self.incidents.lock().len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.incidents.lock().is_empty()
    }
}

impl EmergencyProtocol for RecordingEmergencyProtocol {
    fn invoke(&self, incident: &Incident) {
        self.incidents.lock().push(incident.clone());
    }
}
