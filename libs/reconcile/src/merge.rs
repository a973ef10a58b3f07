//! Three-way merge patches.
//!
//! Given the previously applied document (`original`), the newly desired one
//! (`modified`) and the live object (`current`), [`three_way_merge`]
//! produces a JSON merge patch (RFC 7386) that:
//!
//! - sets every field of `modified` whose live value differs,
//! - removes fields present in `original` but dropped from `modified`,
//! - leaves every other live field alone, so values written by other actors
//!   (an autoscaler's replica count, defaulted fields) survive.
//!
//! Arrays are treated as atomic values and replaced whole.

use serde_json::{Map, Value};

/// Compute the patch to send for `modified`, given `original` and `current`.
///
/// Returns an empty object when nothing needs to change.
pub fn three_way_merge(original: Option<&Value>, modified: &Value, current: &Value) -> Value {
    match (modified.as_object(), current.as_object()) {
        (Some(modified), Some(current)) => Value::Object(object_patch(
            original.and_then(Value::as_object),
            modified,
            current,
        )),
        _ if modified == current => Value::Object(Map::new()),
        _ => modified.clone(),
    }
}

fn object_patch(
    original: Option<&Map<String, Value>>,
    modified: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, desired) in modified {
        let live = current.get(key);
        match (desired, live) {
            (Value::Object(desired), Some(Value::Object(live))) => {
                let previous = original
                    .and_then(|o| o.get(key))
                    .and_then(Value::as_object);
                let nested = object_patch(previous, desired, live);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Value::Null, None) => {}
            (desired, Some(live)) if desired == live => {}
            (desired, _) => {
                patch.insert(key.clone(), desired.clone());
            }
        }
    }

    if let Some(original) = original {
        for key in original.keys() {
            if !modified.contains_key(key) && current.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }

    patch
}

/// Returns true if a patch produced by [`three_way_merge`] changes nothing.
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

/// Apply a JSON merge patch (RFC 7386) to `target`.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else {
        return;
    };

    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            apply_merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}
