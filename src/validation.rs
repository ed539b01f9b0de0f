//! Shared validation helpers used by the stores and the migration engine.

use serde_json::Value;

use crate::model::Attending;

/// Normalizes the free-text `attending` values seen in legacy payloads into
/// the four canonical statuses. Unknown values map to `No`.
pub fn normalize_attending(raw: &Value) -> Attending {
    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        _ => String::new(),
    };
    match text.to_ascii_lowercase().as_str() {
        "yes" | "1" | "true" => Attending::Yes,
        "invited" => Attending::Invited,
        "shown" => Attending::Shown,
        // "0", "no" and anything unrecognized
        _ => Attending::No,
    }
}

/// Sanity window for epoch-millisecond timestamps: 2015..2100. Legacy sync
/// markers outside this window are junk (seconds instead of millis, or
/// corrupted writes).
pub fn is_plausible_timestamp_ms(ts: i64) -> bool {
    (1_420_070_400_000..4_102_444_800_000).contains(&ts)
}

/// True when the value is a JSON object.
pub fn is_object(value: &Value) -> bool {
    value.is_object()
}

/// True when the value is a non-empty JSON array.
pub fn is_non_empty_array(value: &Value) -> bool {
    value.as_array().map(|a| !a.is_empty()).unwrap_or(false)
}

/// Checks a JSON object for required fields; returns the missing ones.
pub fn missing_fields<'a>(value: &Value, required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|field| {
            value
                .get(**field)
                .map(|v| v.is_null())
                .unwrap_or(true)
        })
        .copied()
        .collect()
}
