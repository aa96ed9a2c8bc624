//! JSON merge-patch for metadata overlays.
//!
//! Effective metadata is `baseline + active overlay` under RFC 7396
//! semantics: objects merge recursively, `null` removes a key, everything
//! else replaces.

use serde_json::Value;

/// Apply a merge patch to a target document, returning the merged result.
pub fn merge_patch(target: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(patch_map) => {
            let mut result = match target {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    result.remove(key);
                } else {
                    let merged = match result.get(key) {
                        Some(existing) => merge_patch(existing, patch_value),
                        None => merge_patch(&Value::Null, patch_value),
                    };
                    result.insert(key.clone(), merged);
                }
            }
            Value::Object(result)
        }
        other => other.clone(),
    }
}

/// Compose two patches so that applying the result equals applying `first`
/// then `second`.
///
/// Null markers in `second` are preserved so key removals survive
/// composition; this is what lets overlay supersession accumulate edits.
pub fn compose_patches(first: &Value, second: &Value) -> Value {
    match (first, second) {
        (Value::Object(a), Value::Object(b)) => {
            let mut result = a.clone();
            for (key, second_value) in b {
                match (result.get(key), second_value) {
                    (Some(existing), patch) if existing.is_object() && patch.is_object() => {
                        let composed = compose_patches(existing, patch);
                        result.insert(key.clone(), composed);
                    }
                    _ => {
                        result.insert(key.clone(), second_value.clone());
                    }
                }
            }
            Value::Object(result)
        }
        (_, second) => second.clone(),
    }
}
