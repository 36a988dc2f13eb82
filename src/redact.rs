//! Recursive redaction of sensitive fields from JSON payloads and header
//! maps before they are stored in a trace or emitted on a diagnostics
//! endpoint.

use serde_json::Value;
use std::collections::HashMap;

const REDACTED: &str = "[REDACTED]";

/// Field names (case-insensitive) treated as secrets wherever they appear
/// in a JSON document, at any depth.
const SENSITIVE_KEYS: &[&str] = &[
    "apikey",
    "api_key",
    "accesstoken",
    "access_token",
    "authorization",
    "secret",
    "password",
    "token",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower == *k)
}

/// Recursively walk a JSON value, replacing the value of any
/// sensitive-named object key with `[REDACTED]`. Arrays and nested objects
/// are walked in full; scalars outside a sensitive key pass through
/// unchanged.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact_json(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

/// Redact a header map, matching header names case-insensitively against
/// the same sensitive-key list (`authorization` is the common case here).
pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}
