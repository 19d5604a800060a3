//! Declarative validation rules.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON value types a field can be constrained to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// UTF-8 string.
    String,
    /// Integral number.
    Integer,
    /// Any number.
    Number,
    /// Boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ValueType {
    /// Check whether a value has this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Object => value.is_object(),
            ValueType::Array => value.is_array(),
        }
    }

    /// Name of the type of an arbitrary value.
    pub fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_f64() => "number",
            Value::Number(_) => "integer",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Object => "object",
            ValueType::Array => "array",
        };
        f.write_str(name)
    }
}

/// Compiled regular expression with its source kept for reporting.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern.
    pub fn new(source: &str) -> Result<Self, RuleError> {
        let regex = Regex::new(source).map_err(|e| RuleError::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Pattern source.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Test a string against the pattern.
    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }
}

/// A single constraint on a field.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Field must be present and non-null.
    Required,
    /// Field must have the given type.
    Type(ValueType),
    /// Numeric value, string length (chars) or array length within bounds.
    Range {
        /// Inclusive lower bound.
        min: Option<f64>,
        /// Inclusive upper bound.
        max: Option<f64>,
    },
    /// String value must match the pattern.
    Pattern(Pattern),
    /// Value must be one of the listed values.
    Enum(Vec<Value>),
    /// Value must exist according to a named reference lookup.
    References(String),
}

impl Constraint {
    /// Short constraint name used in violations.
    pub fn name(&self) -> &'static str {
        match self {
            Constraint::Required => "required",
            Constraint::Type(_) => "type",
            Constraint::Range { .. } => "range",
            Constraint::Pattern(_) => "pattern",
            Constraint::Enum(_) => "enum",
            Constraint::References(_) => "references",
        }
    }
}

/// A `(field, constraint)` pair. Fields may be dotted paths (`author.id`).
#[derive(Debug, Clone)]
pub struct Rule {
    /// Field path.
    pub field: String,
    /// Constraint to apply.
    pub constraint: Constraint,
}

/// Declarative constraint set for a payload or result.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule.
    pub fn rule(mut self, field: impl Into<String>, constraint: Constraint) -> Self {
        self.rules.push(Rule {
            field: field.into(),
            constraint,
        });
        self
    }

    /// Require a field.
    pub fn required(self, field: impl Into<String>) -> Self {
        self.rule(field, Constraint::Required)
    }

    /// Constrain a field's type.
    pub fn typed(self, field: impl Into<String>, ty: ValueType) -> Self {
        self.rule(field, Constraint::Type(ty))
    }

    /// Constrain a field to an inclusive range.
    pub fn range(self, field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        self.rule(field, Constraint::Range { min, max })
    }

    /// Constrain a string field to a regular expression.
    pub fn pattern(self, field: impl Into<String>, pattern: &str) -> Result<Self, RuleError> {
        Ok(self.rule(field, Constraint::Pattern(Pattern::new(pattern)?)))
    }

    /// Constrain a field to a set of values.
    pub fn one_of(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.rule(field, Constraint::Enum(values))
    }

    /// Constrain a field to values known to a reference lookup.
    pub fn references(self, field: impl Into<String>, lookup: impl Into<String>) -> Self {
        self.rule(field, Constraint::References(lookup.into()))
    }

    /// All rules in declaration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether no rules are declared.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

/// One failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Field path (`$` for the value itself).
    pub field: String,
    /// Constraint name.
    pub rule: String,
    /// Human-readable description.
    pub message: String,
}

impl Violation {
    /// Create a violation.
    pub fn new(
        field: impl Into<String>,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            rule: rule.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.field, self.rule, self.message)
    }
}

/// Errors building rule sets.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Regular expression failed to compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Pattern source.
        pattern: String,
        /// Compiler message.
        reason: String,
    },
}

/// Resolve a dotted field path inside an object.
pub fn lookup_path<'a>(root: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_type_matches() {
        assert!(ValueType::Integer.matches(&json!(3)));
        assert!(!ValueType::Integer.matches(&json!(3.5)));
        assert!(ValueType::Number.matches(&json!(3.5)));
        assert!(ValueType::String.matches(&json!("x")));
        assert!(ValueType::Object.matches(&json!({})));
        assert!(!ValueType::Array.matches(&json!({})));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = RuleSet::new().pattern("slug", "([a-z").unwrap_err();
        assert!(err.to_string().contains("([a-z"));
    }

    #[test]
    fn test_rule_set_builder() {
        let rules = RuleSet::new()
            .required("title")
            .typed("title", ValueType::String)
            .range("rating", Some(1.0), Some(5.0))
            .pattern("slug", "^[a-z0-9-]+$")
            .unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules.rules()[2].constraint.name(), "range");
    }

    #[test]
    fn test_lookup_path() {
        let value = json!({"author": {"id": 7, "tags": ["a", "b"]}});
        let map = value.as_object().unwrap();
        assert_eq!(lookup_path(map, "author.id"), Some(&json!(7)));
        assert_eq!(lookup_path(map, "author.tags.1"), Some(&json!("b")));
        assert_eq!(lookup_path(map, "author.missing"), None);
        assert_eq!(lookup_path(map, "nope"), None);
    }
}
