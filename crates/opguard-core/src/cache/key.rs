//! Operation fingerprints and security-scoped cache keys.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Identity of a cacheable invocation: kind plus canonical payload.
///
/// Payloads that differ only in object key order share a fingerprint.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Fingerprint {
    kind: String,
    canonical_payload: String,
}

impl Fingerprint {
    /// Fingerprint an operation kind and payload.
    pub fn new(kind: impl Into<String>, payload: &Map<String, Value>) -> Self {
        let mut canonical_payload = String::new();
        write_canonical_object(payload, &mut canonical_payload);
        Self {
            kind: kind.into(),
            canonical_payload,
        }
    }

    /// Operation kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Canonical JSON of the payload.
    pub fn canonical_payload(&self) -> &str {
        &self.canonical_payload
    }

    /// Scope-independent digest, used to find every scoped key of this
    /// fingerprint.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        hasher.update(self.canonical_payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Key of this fingerprint within a security scope.
    pub fn key(&self, scope: &str) -> CacheKey {
        CacheKey::new(self, scope)
    }
}

/// `sha256(kind || canonical payload || security scope)`, hex encoded.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key of a fingerprint within a scope.
    pub fn new(fingerprint: &Fingerprint, scope: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.kind.as_bytes());
        hasher.update(fingerprint.canonical_payload.as_bytes());
        hasher.update(scope.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize a value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 of the canonical form, hex encoded.
pub fn checksum(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars have a single JSON spelling.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_canonical_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": "s"}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":"s","z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = Fingerprint::new("search.query", &obj(json!({"q": "rust", "page": 1})));
        let b = Fingerprint::new("search.query", &obj(json!({"page": 1, "q": "rust"})));
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_key_depends_on_kind_payload_and_scope() {
        let fp = Fingerprint::new("search.query", &obj(json!({"q": "rust"})));
        let other_kind = Fingerprint::new("search.suggest", &obj(json!({"q": "rust"})));
        let other_payload = Fingerprint::new("search.query", &obj(json!({"q": "go"})));

        assert_eq!(fp.key("scope-a"), fp.key("scope-a"));
        assert_ne!(fp.key("scope-a"), fp.key("scope-b"));
        assert_ne!(fp.key("scope-a"), other_kind.key("scope-a"));
        assert_ne!(fp.key("scope-a"), other_payload.key("scope-a"));
    }

    #[test]
    fn test_key_is_sha256_of_concatenation() {
        let fp = Fingerprint::new("k", &obj(json!({"a": 1})));
        let expected = hex::encode(Sha256::digest(br#"k{"a":1}scope"#));
        assert_eq!(fp.key("scope").as_str(), expected);
        assert_eq!(fp.key("scope").as_str().len(), 64);
    }

    #[test]
    fn test_checksum_stable_across_key_order() {
        assert_eq!(checksum(&json!({"a": 1, "b": 2})), checksum(&json!({"b": 2, "a": 1})));
        assert_ne!(checksum(&json!({"a": 1})), checksum(&json!({"a": 2})));
    }
}
