//! Canonical params encoding for subscription dedup.
//!
//! Canonical rules:
//! - object keys sorted by UTF-8 byte order, recursively
//! - no insignificant whitespace
//! - absent or `null` params are equivalent to `{}`

use serde_json::{Map, Value};

/// Canonical encoding of validated params, used as the dedup key.
pub fn fingerprint(params: Option<&Value>) -> String {
    let normalized = match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value.clone(),
    };
    let canon = canon_value(normalized);
    // Canonical values round-trip through serde_json without failure.
    serde_json::to_string(&canon).unwrap_or_default()
}

fn canon_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut canon = Map::new();
            for (key, value) in entries {
                canon.insert(key, canon_value(value));
            }
            Value::Object(canon)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canon_value).collect()),
        other => other,
    }
}
