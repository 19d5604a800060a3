//! Input and result validation.
//!
//! The [`ValidationService`] evaluates declarative [`RuleSet`]s. Every rule
//! is evaluated and every violation is collected so the caller receives the
//! complete error set. Result validation walks arrays and nested objects and
//! fails closed on shapes it cannot verify.

mod rule;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::config::ValidationConfig;

pub use rule::{lookup_path, Constraint, Pattern, Rule, RuleError, RuleSet, ValueType, Violation};

/// External existence check used by `references` constraints.
pub trait ReferenceLookup: Send + Sync {
    /// Whether the referenced value exists.
    fn exists(&self, value: &Value) -> bool;
}

impl<F> ReferenceLookup for F
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    fn exists(&self, value: &Value) -> bool {
        self(value)
    }
}

/// Payload that passed input validation.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedPayload<'a>(&'a Map<String, Value>);

impl<'a> ValidatedPayload<'a> {
    /// The validated payload.
    pub fn into_inner(self) -> &'a Map<String, Value> {
        self.0
    }
}

/// Rule engine shared by the executor and the result cache.
pub struct ValidationService {
    config: ValidationConfig,
    lookups: RwLock<HashMap<String, Arc<dyn ReferenceLookup>>>,
}

impl ValidationService {
    /// Create a validation service.
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            lookups: RwLock::new(HashMap::new()),
        }
    }

    /// Register a named reference lookup.
    pub fn register_lookup(&self, name: impl Into<String>, lookup: Arc<dyn ReferenceLookup>) {
        self.lookups.write().insert(name.into(), lookup);
    }

    /// Validate operation input against its rules.
    pub fn validate_input<'a>(
        &self,
        payload: &'a Map<String, Value>,
        rules: &RuleSet,
    ) -> Result<ValidatedPayload<'a>, Vec<Violation>> {
        let mut violations = Vec::new();
        self.apply_rules(payload, rules, "", &mut violations);
        if violations.is_empty() {
            Ok(ValidatedPayload(payload))
        } else {
            Err(violations)
        }
    }

    /// Validate a produced result.
    ///
    /// Objects are checked against `rules`; arrays have every element checked
    /// with the same rules; nested containers are walked for structure. A
    /// null result, a null array element, a scalar where rules apply, or
    /// nesting deeper than the configured maximum is invalid.
    pub fn validate_result(&self, result: &Value, rules: &RuleSet) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        self.walk(result, rules, "$", 0, &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn walk(
        &self,
        value: &Value,
        rules: &RuleSet,
        path: &str,
        depth: usize,
        out: &mut Vec<Violation>,
    ) {
        if depth > self.config.max_result_depth {
            out.push(Violation::new(
                path,
                "shape",
                format!("nesting exceeds {} levels", self.config.max_result_depth),
            ));
            return;
        }

        match value {
            Value::Null => out.push(Violation::new(path, "shape", "no value produced")),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.walk(item, rules, &format!("{}[{}]", path, i), depth + 1, out);
                }
            }
            Value::Object(map) => {
                let prefix = if path == "$" { "" } else { path };
                self.apply_rules(map, rules, prefix, out);
                let structural = RuleSet::new();
                for (key, child) in map {
                    if child.is_object() || child.is_array() {
                        let child_path = if prefix.is_empty() {
                            key.clone()
                        } else {
                            format!("{}.{}", prefix, key)
                        };
                        self.walk(child, &structural, &child_path, depth + 1, out);
                    }
                }
            }
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                if !rules.is_empty() {
                    out.push(Violation::new(
                        path,
                        "shape",
                        format!("expected object, found {}", ValueType::describe(value)),
                    ));
                }
            }
        }
    }

    fn apply_rules(
        &self,
        object: &Map<String, Value>,
        rules: &RuleSet,
        prefix: &str,
        out: &mut Vec<Violation>,
    ) {
        for rule in rules.rules() {
            let display = if prefix.is_empty() {
                rule.field.clone()
            } else {
                format!("{}.{}", prefix, rule.field)
            };
            let value = lookup_path(object, &rule.field).filter(|v| !v.is_null());

            match (&rule.constraint, value) {
                (Constraint::Required, None) => {
                    out.push(Violation::new(display, "required", "field is required"));
                }
                (Constraint::Required, Some(_)) => {}
                // Optional constraints only apply to present values.
                (_, None) => {}
                (constraint, Some(value)) => {
                    if let Some(message) = self.check(constraint, value) {
                        out.push(Violation::new(display, constraint.name(), message));
                    }
                }
            }
        }
    }

    fn check(&self, constraint: &Constraint, value: &Value) -> Option<String> {
        match constraint {
            Constraint::Required => None,
            Constraint::Type(ty) => (!ty.matches(value))
                .then(|| format!("expected {}, found {}", ty, ValueType::describe(value))),
            Constraint::Range { min, max } => {
                let measured = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => Some(s.chars().count() as f64),
                    Value::Array(items) => Some(items.len() as f64),
                    _ => None,
                };
                let Some(measured) = measured else {
                    return Some(format!(
                        "range does not apply to {}",
                        ValueType::describe(value)
                    ));
                };
                if min.is_some_and(|m| measured < m) || max.is_some_and(|m| measured > m) {
                    Some(format!(
                        "{} outside [{}, {}]",
                        measured,
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("+inf".to_string(), |m| m.to_string())
                    ))
                } else {
                    None
                }
            }
            Constraint::Pattern(pattern) => match value.as_str() {
                Some(s) if pattern.is_match(s) => None,
                Some(_) => Some(format!("does not match {}", pattern.as_str())),
                None => Some(format!(
                    "pattern requires string, found {}",
                    ValueType::describe(value)
                )),
            },
            Constraint::Enum(allowed) => {
                (!allowed.contains(value)).then(|| "value not in allowed set".to_string())
            }
            Constraint::References(name) => {
                let lookup = self.lookups.read().get(name).cloned();
                match lookup {
                    Some(lookup) if lookup.exists(value) => None,
                    Some(_) => Some(format!("no {} matches this value", name)),
                    None => Some(format!("reference lookup '{}' is not registered", name)),
                }
            }
        }
    }
}

impl Default for ValidationService {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn article_rules() -> RuleSet {
        RuleSet::new()
            .required("title")
            .typed("title", ValueType::String)
            .range("title", Some(1.0), Some(10.0))
            .required("body")
            .one_of("status", vec![json!("draft"), json!("published")])
            .pattern("slug", "^[a-z0-9-]+$")
            .unwrap()
    }

    #[test]
    fn test_valid_input() {
        let service = ValidationService::default();
        let p = payload(json!({"title": "Hello", "body": "B", "status": "draft", "slug": "hello"}));
        assert!(service.validate_input(&p, &article_rules()).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let service = ValidationService::default();
        let p = payload(json!({"title": 42, "status": "archived", "slug": "Not A Slug"}));
        let violations = service.validate_input(&p, &article_rules()).unwrap_err();

        let fields: Vec<(&str, &str)> = violations
            .iter()
            .map(|v| (v.field.as_str(), v.rule.as_str()))
            .collect();
        assert!(fields.contains(&("title", "type")));
        assert!(fields.contains(&("title", "range")));
        assert!(fields.contains(&("body", "required")));
        assert!(fields.contains(&("status", "enum")));
        assert!(fields.contains(&("slug", "pattern")));
        assert_eq!(violations.len(), 5);
    }

    #[test]
    fn test_missing_required_reported_once_other_constraints_skipped() {
        let service = ValidationService::default();
        let rules = RuleSet::new()
            .required("title")
            .typed("title", ValueType::String)
            .range("title", Some(1.0), None);
        let violations = service.validate_input(&payload(json!({})), &rules).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "required");
    }

    #[test]
    fn test_null_counts_as_missing() {
        let service = ValidationService::default();
        let rules = RuleSet::new().required("title");
        let violations = service
            .validate_input(&payload(json!({"title": null})), &rules)
            .unwrap_err();
        assert_eq!(violations[0].field, "title");
    }

    #[test]
    fn test_references_lookup() {
        let service = ValidationService::default();
        service.register_lookup(
            "user",
            Arc::new(|v: &Value| v.as_str() == Some("alice")),
        );
        let rules = RuleSet::new().references("author", "user");

        assert!(service
            .validate_input(&payload(json!({"author": "alice"})), &rules)
            .is_ok());
        let violations = service
            .validate_input(&payload(json!({"author": "mallory"})), &rules)
            .unwrap_err();
        assert_eq!(violations[0].rule, "references");
    }

    #[test]
    fn test_unregistered_lookup_fails_closed() {
        let service = ValidationService::default();
        let rules = RuleSet::new().references("category", "category");
        let violations = service
            .validate_input(&payload(json!({"category": 3})), &rules)
            .unwrap_err();
        assert!(violations[0].message.contains("not registered"));
    }

    #[test]
    fn test_nested_field_paths() {
        let service = ValidationService::default();
        let rules = RuleSet::new().required("author.id").typed("author.id", ValueType::Integer);
        assert!(service
            .validate_input(&payload(json!({"author": {"id": 9}})), &rules)
            .is_ok());
        let violations = service
            .validate_input(&payload(json!({"author": {"id": "9"}})), &rules)
            .unwrap_err();
        assert_eq!(violations[0].field, "author.id");
    }

    #[test]
    fn test_result_array_elements_validated() {
        let service = ValidationService::default();
        let rules = RuleSet::new().required("id");
        let result = json!([{"id": 1}, {"name": "missing id"}, {"id": 3}]);
        let violations = service.validate_result(&result, &rules).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "$[1].id");
    }

    #[test]
    fn test_result_null_fails_closed() {
        let service = ValidationService::default();
        assert!(service.validate_result(&Value::Null, &RuleSet::new()).is_err());
        assert!(service
            .validate_result(&json!({"items": [null]}), &RuleSet::new())
            .is_err());
    }

    #[test]
    fn test_result_scalar_with_rules_fails_closed() {
        let service = ValidationService::default();
        let rules = RuleSet::new().required("id");
        assert!(service.validate_result(&json!("done"), &rules).is_err());
        assert!(service.validate_result(&json!("done"), &RuleSet::new()).is_ok());
    }

    #[test]
    fn test_result_depth_limit() {
        let service = ValidationService::new(ValidationConfig { max_result_depth: 2 });
        let deep = json!({"a": {"b": {"c": {"d": 1}}}});
        let violations = service.validate_result(&deep, &RuleSet::new()).unwrap_err();
        assert_eq!(violations[0].rule, "shape");
        assert!(service
            .validate_result(&json!({"a": {"b": 1}}), &RuleSet::new())
            .is_ok());
    }
}
