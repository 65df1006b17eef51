//! Payload sanitization
//!
//! Workers may be written against JSON parsers that read every number as an
//! IEEE double. Integers outside the exactly representable range are turned
//! into decimal strings before a payload crosses the process boundary.

use serde::Serialize;
use serde_json::{Map, Number, Value};

/// Largest integer magnitude a double represents exactly (2^53 - 1)
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Make a payload transport-safe. Never fails and is idempotent.
pub fn sanitize_payload(value: Value) -> Value {
    match value {
        Value::Number(number) => sanitize_number(number),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_payload).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, sanitize_payload(value)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

/// Serialize and sanitize in one step
///
/// Fails only when `value` itself cannot be represented as JSON (for example
/// a map with non-string keys).
pub fn sanitize_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value).map(sanitize_payload)
}

/// Whether `value` already survives sanitization unchanged
pub fn is_transport_safe(value: &Value) -> bool {
    match value {
        Value::Number(number) => !exceeds_safe_range(number),
        Value::Array(items) => items.iter().all(is_transport_safe),
        Value::Object(map) => map.values().all(is_transport_safe),
        _ => true,
    }
}

fn exceeds_safe_range(number: &Number) -> bool {
    if let Some(unsigned) = number.as_u64() {
        unsigned > MAX_SAFE_INTEGER
    } else if let Some(signed) = number.as_i64() {
        signed.unsigned_abs() > MAX_SAFE_INTEGER
    } else {
        false
    }
}

fn sanitize_number(number: Number) -> Value {
    if exceeds_safe_range(&number) {
        Value::String(number.to_string())
    } else {
        Value::Number(number)
    }
}
