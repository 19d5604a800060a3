//! Redaction of sensitive values before anything reaches a sink.

use std::collections::BTreeMap;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::config::AuditConfig;
use crate::context::ContextSnapshot;

/// Lowercase and strip separators so `api_key`, `API-Key` and `apiKey`
/// compare equal.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Replaces values of sensitive fields with a marker.
#[derive(Debug, Clone)]
pub struct Redactor {
    sensitive: Vec<String>,
    marker: String,
    /// Matches `name=value` and `name: value` pairs in free text. `None`
    /// with a non-empty sensitive list means messages are dropped entirely.
    message_pattern: Option<Regex>,
}

impl Redactor {
    /// Build a redactor from the audit configuration.
    pub fn new(config: &AuditConfig) -> Self {
        let mut sensitive: Vec<String> = config
            .sensitive_fields
            .iter()
            .map(|f| normalize(f))
            .filter(|f| !f.is_empty())
            .collect();
        sensitive.sort();
        sensitive.dedup();

        let message_pattern = if sensitive.is_empty() {
            None
        } else {
            let names: Vec<String> = config
                .sensitive_fields
                .iter()
                .filter(|f| !normalize(f).is_empty())
                .map(|f| {
                    // Separators inside a configured name may be written any way.
                    f.split(|c: char| c == '_' || c == '-' || c == ' ')
                        .map(regex::escape)
                        .collect::<Vec<_>>()
                        .join("[_\\- ]?")
                })
                .collect();
            let pattern = format!(
                r#"(?i)(\b[\w\-]*(?:{})[\w\-]*)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
                names.join("|")
            );
            Regex::new(&pattern).ok()
        };

        Self {
            sensitive,
            marker: config.redaction_marker.clone(),
            message_pattern,
        }
    }

    /// Replacement marker.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Whether a field name is sensitive.
    pub fn is_sensitive(&self, name: &str) -> bool {
        let normalized = normalize(name);
        !normalized.is_empty() && self.sensitive.iter().any(|s| normalized.contains(s.as_str()))
    }

    /// Copy of `value` with sensitive object fields replaced at any depth.
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive(k) {
                            Value::String(self.marker.clone())
                        } else {
                            self.redact_value(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            other => other.clone(),
        }
    }

    /// Copy of attributes with sensitive values replaced.
    pub fn redact_attributes(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        attributes
            .iter()
            .map(|(k, v)| {
                let v = if self.is_sensitive(k) {
                    self.marker.clone()
                } else {
                    v.clone()
                };
                (k.clone(), v)
            })
            .collect()
    }

    /// Context snapshot with sensitive attributes and session id replaced.
    pub fn redact_context(&self, mut snapshot: ContextSnapshot) -> ContextSnapshot {
        snapshot.attributes = self.redact_attributes(&snapshot.attributes);
        if self.is_sensitive("session_id") {
            snapshot.session_id = self.marker.clone();
        }
        snapshot
    }

    /// Scrub `name=value` / `name: value` pairs of sensitive names.
    pub fn scrub_message(&self, message: &str) -> String {
        if self.sensitive.is_empty() {
            return message.to_string();
        }
        match &self.message_pattern {
            Some(re) => re
                .replace_all(message, |caps: &Captures| {
                    format!("{}{}{}", &caps[1], &caps[2], self.marker)
                })
                .into_owned(),
            None => self.marker.clone(),
        }
    }
}
