//! Maps raw upstream payloads onto canonical fields.

use serde_json::{Number, Value as JsonValue};

use crate::config::{Coercion, FieldMapping};

/// Canonical fields extracted from one upstream payload, in mapping order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub fields: Vec<(String, JsonValue)>,
    /// Optional fields whose value could not be coerced.
    pub degraded: Vec<String>,
}

impl Normalized {
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.fields
            .iter()
            .rev()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("field '{field}' cannot be coerced to {target:?}: {value}")]
pub struct NormalizationError {
    pub field: String,
    pub target: Coercion,
    pub value: JsonValue,
}

/// Extracts and coerces every mapped field from `payload`.
///
/// Missing paths and JSON `null` leave the field absent. A coercion failure
/// fails the whole normalization only when the field is required; fields
/// default to the owning call's `call_required` flag.
pub fn normalize(
    payload: &JsonValue,
    mappings: &[FieldMapping],
    call_required: bool,
) -> Result<Normalized, NormalizationError> {
    let mut normalized = Normalized::default();

    for mapping in mappings {
        let value = match lookup(payload, &mapping.source) {
            Some(JsonValue::Null) | None => continue,
            Some(value) => value,
        };

        let coerced = match mapping.coerce {
            Some(target) => coerce(value, target),
            None => Some(value.clone()),
        };

        match coerced {
            Some(value) => normalized.fields.push((mapping.name.clone(), value)),
            None if mapping.required.unwrap_or(call_required) => {
                return Err(NormalizationError {
                    field: mapping.name.clone(),
                    // coerced is only None when a target was set
                    target: mapping.coerce.unwrap_or(Coercion::String),
                    value: value.clone(),
                });
            }
            None => {
                log::debug!(
                    "optional field '{}' degraded, cannot coerce {}",
                    mapping.name,
                    value
                );
                normalized.degraded.push(mapping.name.clone());
            }
        }
    }

    Ok(normalized)
}

/// Resolves a JSON pointer or a dotted path against `payload`.
pub fn lookup<'a>(payload: &'a JsonValue, source: &str) -> Option<&'a JsonValue> {
    if source.starts_with('/') {
        return payload.pointer(source);
    }

    source.split('.').try_fold(payload, |node, segment| match node {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn coerce(value: &JsonValue, target: Coercion) -> Option<JsonValue> {
    match (target, value) {
        (Coercion::String, JsonValue::String(_)) => Some(value.clone()),
        (Coercion::String, JsonValue::Number(n)) => Some(JsonValue::String(n.to_string())),
        (Coercion::String, JsonValue::Bool(b)) => Some(JsonValue::String(b.to_string())),

        (Coercion::Integer, JsonValue::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                Some(value.clone())
            } else {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                    .map(|f| JsonValue::from(f as i64))
            }
        }
        (Coercion::Integer, JsonValue::String(s)) => {
            s.trim().parse::<i64>().ok().map(JsonValue::from)
        }

        (Coercion::Number, JsonValue::Number(_)) => Some(value.clone()),
        (Coercion::Number, JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(JsonValue::Number),

        (Coercion::Boolean, JsonValue::Bool(_)) => Some(value.clone()),
        (Coercion::Boolean, JsonValue::String(s)) => match s.trim() {
            "true" | "1" => Some(JsonValue::Bool(true)),
            "false" | "0" => Some(JsonValue::Bool(false)),
            _ => None,
        },
        (Coercion::Boolean, JsonValue::Number(n)) => match n.as_i64() {
            Some(0) => Some(JsonValue::Bool(false)),
            Some(1) => Some(JsonValue::Bool(true)),
            _ => None,
        },

        _ => None,
    }
}
