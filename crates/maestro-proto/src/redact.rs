//! Recursive redaction of secret-shaped fields.
//!
//! Applied by the session store before any event or tool record reaches
//! disk. There is no code path that durably stores an unredacted value for
//! a key whose name suggests a secret.

use serde_json::Value;

/// Replacement written in place of a secret-shaped value.
pub const REDACTED: &str = "[REDACTED]";

const SECRET_MARKERS: [&str; 4] = ["key", "token", "secret", "password"];

fn key_is_secret(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// Returns a copy of `value` with every secret-shaped field replaced by
/// [`REDACTED`], recursively through nested objects and arrays.
///
/// The input is never mutated.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .iter()
                .map(|(k, v)| {
                    if key_is_secret(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}
