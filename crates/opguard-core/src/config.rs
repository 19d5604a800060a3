//! Executor configuration.
//!
//! Every section has serde defaults so partial JSON documents are accepted.
//! Durations are expressed in milliseconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default rate-limit window (1 minute).
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;

/// Default attempts allowed per window.
pub const DEFAULT_RATE_MAX_ATTEMPTS: u32 = 60;

/// Default ceiling on concurrently monitored operations.
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// Default duration ceiling per operation (5 seconds).
pub const DEFAULT_MAX_DURATION_MS: u64 = 5_000;

/// Default memory-growth ceiling per operation (64 MB).
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 64 * 1024 * 1024;

/// Multiplier above which a breach is critical.
pub const DEFAULT_CRITICAL_MULTIPLIER: f64 = 2.0;

/// Default result cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 1_000;

/// Default result cache TTL (5 minutes).
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;

/// Default role cache TTL (1 minute).
pub const DEFAULT_ROLE_CACHE_TTL_MS: u64 = 60_000;

/// Default maximum result nesting depth.
pub const DEFAULT_MAX_RESULT_DEPTH: usize = 32;

/// Default redaction marker.
pub const DEFAULT_REDACTION_MARKER: &str = "[REDACTED]";

/// Field names redacted by default.
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credit_card",
    "card_number",
    "cvv",
    "ssn",
    "private_key",
];

/// Complete executor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Operation monitor.
    pub monitor: MonitorConfig,
    /// Result cache.
    pub cache: CacheConfig,
    /// Audit logging.
    pub audit: AuditConfig,
    /// Access control.
    pub access: AccessConfig,
    /// Validation service.
    pub validation: ValidationConfig,
}

impl GuardConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.enabled {
            self.rate_limit.default_rule().validate("rate_limit")?;
            for (kind, rule) in &self.rate_limit.per_kind {
                rule.validate(&format!("rate_limit.per_kind.{}", kind))?;
            }
        }
        if self.monitor.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "monitor.max_concurrent must be at least 1".into(),
            ));
        }
        if !(self.monitor.critical_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "monitor.critical_multiplier must be >= 1.0".into(),
            ));
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache.capacity must be at least 1 when the cache is enabled".into(),
            ));
        }
        if self.audit.redaction_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "audit.redaction_marker must not be empty".into(),
            ));
        }
        if self.validation.max_result_depth == 0 {
            return Err(ConfigError::Invalid(
                "validation.max_result_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Set the rate limit section.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the monitor section.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Set the cache section.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the audit section.
    pub fn with_audit(mut self, audit: AuditConfig) -> Self {
        self.audit = audit;
        self
    }

    /// Set the access section.
    pub fn with_access(mut self, access: AccessConfig) -> Self {
        self.access = access;
        self
    }
}

/// Fixed-window rate limit for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Attempts allowed per window.
    pub max_attempts: u32,
}

impl RateLimitRule {
    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.window_ms == 0 || self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{}: window_ms and max_attempts must be positive",
                section
            )));
        }
        Ok(())
    }
}

/// Rate limiting section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enforced.
    pub enabled: bool,
    /// Default window length in milliseconds.
    pub window_ms: u64,
    /// Default attempts per window.
    pub max_attempts: u32,
    /// Overrides per operation kind.
    pub per_kind: BTreeMap<String, RateLimitRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: DEFAULT_RATE_WINDOW_MS,
            max_attempts: DEFAULT_RATE_MAX_ATTEMPTS,
            per_kind: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Disabled rate limiting.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Default rule.
    pub fn default_rule(&self) -> RateLimitRule {
        RateLimitRule {
            window_ms: self.window_ms,
            max_attempts: self.max_attempts,
        }
    }

    /// Rule in effect for an operation kind.
    pub fn rule_for(&self, kind: &str) -> RateLimitRule {
        self.per_kind
            .get(kind)
            .copied()
            .unwrap_or_else(|| self.default_rule())
    }

    /// Add a per-kind override.
    pub fn with_kind(mut self, kind: impl Into<String>, window_ms: u64, max_attempts: u32) -> Self {
        self.per_kind.insert(
            kind.into(),
            RateLimitRule {
                window_ms,
                max_attempts,
            },
        );
        self
    }
}

/// What the monitor does when the concurrency ceiling is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Reject immediately.
    FailFast,
    /// Wait for a free slot up to `timeout_ms`.
    Block {
        /// Maximum wait in milliseconds.
        timeout_ms: u64,
    },
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        AdmissionPolicy::FailFast
    }
}

/// Ceilings for one operation kind. `None` disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Wall-clock ceiling in milliseconds.
    pub max_duration_ms: Option<u64>,
    /// Memory growth ceiling in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Ceiling on store calls made by the body.
    pub max_storage_calls: Option<u64>,
    /// Deadline after which cooperative checkpoints fail.
    pub hard_deadline_ms: Option<u64>,
}

/// Operation monitor section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Ceiling on concurrently monitored operations.
    pub max_concurrent: usize,
    /// Behavior at the ceiling.
    pub admission: AdmissionPolicy,
    /// Factor over a ceiling at which a breach becomes critical.
    pub critical_multiplier: f64,
    /// Thresholds applied to kinds without an override.
    pub default_thresholds: ThresholdConfig,
    /// Threshold overrides per operation kind.
    pub per_kind: BTreeMap<String, ThresholdConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            admission: AdmissionPolicy::FailFast,
            critical_multiplier: DEFAULT_CRITICAL_MULTIPLIER,
            default_thresholds: ThresholdConfig {
                max_duration_ms: Some(DEFAULT_MAX_DURATION_MS),
                max_memory_bytes: Some(DEFAULT_MAX_MEMORY_BYTES),
                max_storage_calls: None,
                hard_deadline_ms: None,
            },
            per_kind: BTreeMap::new(),
        }
    }
}

impl MonitorConfig {
    /// Thresholds in effect for an operation kind.
    pub fn thresholds_for(&self, kind: &str) -> ThresholdConfig {
        self.per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_thresholds)
    }

    /// Set the concurrency ceiling.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the admission policy.
    pub fn with_admission(mut self, admission: AdmissionPolicy) -> Self {
        self.admission = admission;
        self
    }

    /// Add a per-kind threshold override.
    pub fn with_kind(mut self, kind: impl Into<String>, thresholds: ThresholdConfig) -> Self {
        self.per_kind.insert(kind.into(), thresholds);
        self
    }
}

/// Result cache section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether cacheable operations consult the cache.
    pub enabled: bool,
    /// Maximum number of entries.
    pub capacity: usize,
    /// Default time-to-live in milliseconds.
    pub default_ttl_ms: u64,
    /// TTL overrides per operation kind.
    pub per_kind_ttl_ms: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CACHE_CAPACITY,
            default_ttl_ms: DEFAULT_CACHE_TTL_MS,
            per_kind_ttl_ms: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    /// TTL for an operation kind.
    pub fn ttl_for(&self, kind: &str) -> Duration {
        Duration::from_millis(
            self.per_kind_ttl_ms
                .get(kind)
                .copied()
                .unwrap_or(self.default_ttl_ms),
        )
    }

    /// Set the capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Override the TTL of one kind.
    pub fn with_kind_ttl(mut self, kind: impl Into<String>, ttl_ms: u64) -> Self {
        self.per_kind_ttl_ms.insert(kind.into(), ttl_ms);
        self
    }
}

/// Audit logging section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Field names whose values are redacted.
    pub sensitive_fields: Vec<String>,
    /// Replacement for redacted values.
    pub redaction_marker: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS.iter().map(|s| s.to_string()).collect(),
            redaction_marker: DEFAULT_REDACTION_MARKER.to_string(),
        }
    }
}

/// Access control section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// How long resolved actor roles stay cached.
    pub role_cache_ttl_ms: u64,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            role_cache_ttl_ms: DEFAULT_ROLE_CACHE_TTL_MS,
        }
    }
}

/// Validation section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Maximum nesting depth accepted in results.
    pub max_result_depth: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_result_depth: DEFAULT_MAX_RESULT_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.critical_multiplier, 2.0);
        assert!(config.audit.sensitive_fields.iter().any(|f| f == "password"));
    }

    #[test]
    fn test_partial_json() {
        let config = GuardConfig::from_json_str(
            r#"{
                "rate_limit": {
                    "max_attempts": 3,
                    "per_kind": {"user.login": {"window_ms": 1000, "max_attempts": 5}}
                },
                "monitor": {"admission": {"mode": "block", "timeout_ms": 250}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.max_attempts, 3);
        assert_eq!(config.rate_limit.window_ms, DEFAULT_RATE_WINDOW_MS);
        assert_eq!(config.rate_limit.rule_for("user.login").max_attempts, 5);
        assert_eq!(config.rate_limit.rule_for("content.create").max_attempts, 3);
        assert_eq!(
            config.monitor.admission,
            AdmissionPolicy::Block { timeout_ms: 250 }
        );
        assert_eq!(config.cache.capacity, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GuardConfig::from_json_str(r#"{"monitor": {"max_concurrent": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));

        let err = GuardConfig::from_json_str(r#"{"monitor": {"critical_multiplier": 0.5}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("critical_multiplier"));

        assert!(GuardConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_thresholds_for_kind() {
        let monitor = MonitorConfig::default().with_kind(
            "media.transcode",
            ThresholdConfig {
                max_duration_ms: Some(60_000),
                ..ThresholdConfig::default()
            },
        );
        assert_eq!(
            monitor.thresholds_for("media.transcode").max_duration_ms,
            Some(60_000)
        );
        assert_eq!(
            monitor.thresholds_for("content.create").max_duration_ms,
            Some(DEFAULT_MAX_DURATION_MS)
        );
    }

    #[test]
    fn test_cache_ttl_for_kind() {
        let mut cache = CacheConfig::default();
        cache.per_kind_ttl_ms.insert("search.query".into(), 1_000);
        assert_eq!(cache.ttl_for("search.query"), Duration::from_secs(1));
        assert_eq!(cache.ttl_for("other"), Duration::from_millis(DEFAULT_CACHE_TTL_MS));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.json");
        let config = GuardConfig::default().with_rate_limit(RateLimitConfig::disabled());
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = GuardConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
