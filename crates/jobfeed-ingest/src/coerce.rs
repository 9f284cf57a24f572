//! Lossy-safe conversion of loosely typed input into column kinds.
//!
//! Coercion never fails: a value that cannot be represented becomes null and
//! the record carries on.

use jobfeed_core::{FieldKind, FieldValue};
use serde_json::Value as JsonValue;

const TRUE_TOKENS: [&str; 5] = ["true", "t", "1", "yes", "y"];
const FALSE_TOKENS: [&str; 5] = ["false", "f", "0", "no", "n"];

pub fn coerce(kind: FieldKind, raw: &JsonValue) -> FieldValue {
    if is_no_value(raw) {
        return FieldValue::Null;
    }
    match kind {
        FieldKind::Text => FieldValue::Text(stringify(raw)),
        FieldKind::Number => coerce_number(raw),
        FieldKind::Boolean => coerce_boolean(raw),
        FieldKind::Json => coerce_json(raw),
        FieldKind::Timestamp => FieldValue::Timestamp(stringify(raw)),
    }
}

/// Pass-through used when no schema is available: structured values stay JSON,
/// everything else becomes text. The sink converts to column types.
pub fn passthrough(raw: &JsonValue) -> FieldValue {
    match raw {
        _ if is_no_value(raw) => FieldValue::Null,
        JsonValue::Array(_) | JsonValue::Object(_) => FieldValue::Json(raw.clone()),
        _ => FieldValue::Text(stringify(raw)),
    }
}

pub fn is_no_value(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn stringify(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_number(raw: &JsonValue) -> FieldValue {
    let parsed = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .map(FieldValue::Number)
        .unwrap_or(FieldValue::Null)
}

fn coerce_boolean(raw: &JsonValue) -> FieldValue {
    if let JsonValue::Bool(flag) = raw {
        return FieldValue::Boolean(*flag);
    }
    let token = stringify(raw).trim().to_ascii_lowercase();
    if TRUE_TOKENS.contains(&token.as_str()) {
        FieldValue::Boolean(true)
    } else if FALSE_TOKENS.contains(&token.as_str()) {
        FieldValue::Boolean(false)
    } else {
        FieldValue::Null
    }
}

fn coerce_json(raw: &JsonValue) -> FieldValue {
    let JsonValue::String(text) = raw else {
        return FieldValue::Json(raw.clone());
    };

    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map(FieldValue::Json)
            .unwrap_or_else(|_| FieldValue::Json(raw.clone()));
    }
    // Multi-value cells such as "Engineering | Data".
    if trimmed.contains('|') {
        let parts = trimmed
            .split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| JsonValue::String(part.to_string()))
            .collect();
        return FieldValue::Json(JsonValue::Array(parts));
    }
    FieldValue::Json(raw.clone())
}
