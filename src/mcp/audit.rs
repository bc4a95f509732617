//! Redaction for the per-call audit log line.
//!
//! `tools/call` params carry caller-supplied `arguments`, which is where secrets
//! show up in practice; the walk covers every nesting level.

use serde_json::{Map, Value};

const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: [&str; 5] = ["authorization", "bearer", "api_key", "apikey", "cookie"];
const SENSITIVE_FRAGMENTS: [&str; 5] = ["token", "secret", "password", "credential", "private_key"];

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact_object(map)),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

fn redact_object(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, item)| {
            let item = if is_sensitive_key(key) {
                Value::String(REDACTED.to_string())
            } else {
                redact_audit_value(item)
            };
            (key.clone(), item)
        })
        .collect()
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase().replace('-', "_");
    SENSITIVE_KEYS.contains(&normalized.as_str())
        || SENSITIVE_FRAGMENTS
            .iter()
            .any(|fragment| normalized.contains(fragment))
}
