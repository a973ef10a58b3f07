//! Configuration value merging.

use serde_json::{Map, Value};

/// Deep-merge `overrides` onto `base`.
///
/// Maps merge key by key; scalars and arrays in `overrides` replace the
/// base value; an explicit `null` removes the key.
pub fn merge_values(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => Value::Object(merge_maps(base, overrides)),
        (base, Value::Null) => strip_nulls(base),
        (_, overrides) => strip_nulls(overrides),
    }
}

fn merge_maps(base: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overrides {
        if value.is_null() {
            merged.remove(key);
            continue;
        }
        let next = match merged.get(key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                merge_values(existing, value)
            }
            _ => strip_nulls(value),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Drop `null` map entries at every depth.
fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
