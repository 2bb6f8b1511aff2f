//! Document value model
//!
//! Records are JSON object maps. The helpers here implement the merge
//! semantics used by `update`/`patch`: arrays are replaced wholesale,
//! plain objects merge key by key.

use serde_json::{Map, Value};

/// A record: attribute name to JSON value.
pub type Document = Map<String, Value>;

/// Deep-merge `patch` into `base`. Nested objects merge recursively,
/// arrays and scalars replace, explicit nulls overwrite.
pub fn deep_merge(base: &mut Document, patch: Document) {
    for (key, patch_value) in patch {
        match (base.get_mut(&key), patch_value) {
            (Some(Value::Object(base_obj)), Value::Object(patch_obj)) => {
                deep_merge(base_obj, patch_obj);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Shallow merge: top-level keys of `patch` replace those of `base`.
pub fn shallow_merge(base: &mut Document, patch: Document) {
    for (key, value) in patch {
        base.insert(key, value);
    }
}

/// Read a dot-separated path (`"address.city"`) out of a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a value at a dot-separated path, creating intermediate objects.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for segment in &segments[..segments.len() - 1] {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().unwrap();
    }
    current.insert(segments[segments.len() - 1].to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn deep_merge_merges_nested_objects() {
        let mut base = doc(json!({"a": 1, "nested": {"x": 1, "y": 2}}));
        deep_merge(&mut base, doc(json!({"nested": {"y": 3, "z": 4}})));
        assert_eq!(
            Value::Object(base),
            json!({"a": 1, "nested": {"x": 1, "y": 3, "z": 4}})
        );
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let mut base = doc(json!({"tags": ["a", "b"]}));
        deep_merge(&mut base, doc(json!({"tags": ["c"]})));
        assert_eq!(Value::Object(base), json!({"tags": ["c"]}));
    }

    #[test]
    fn shallow_merge_replaces_top_level() {
        let mut base = doc(json!({"nested": {"x": 1}, "a": 1}));
        shallow_merge(&mut base, doc(json!({"nested": {"y": 2}})));
        assert_eq!(
            Value::Object(base),
            json!({"nested": {"y": 2}, "a": 1})
        );
    }

    #[test]
    fn path_round_trip() {
        let mut base = doc(json!({}));
        set_path(&mut base, "address.city", json!("Lisbon"));
        assert_eq!(get_path(&base, "address.city"), Some(&json!("Lisbon")));
        assert_eq!(get_path(&base, "address.zip"), None);
    }
}
