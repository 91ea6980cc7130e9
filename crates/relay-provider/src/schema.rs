//! Tool input-schema normalization.
//!
//! Several backends reject schemas where an object has no `properties` map
//! or an array has no `items`. Every outgoing tool schema goes through
//! [`normalize_schema`] first.

use serde_json::{json, Map, Value};

/// Return a copy of `schema` that every backend accepts.
///
/// A missing or non-object schema becomes an empty-properties object schema.
/// The top level defaults to `"type": "object"`.
pub fn normalize_schema(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return empty_object_schema();
    };

    let mut normalized = Value::Object(map.clone());
    if let Value::Object(root) = &mut normalized {
        if !root.contains_key("type") {
            root.insert("type".to_string(), json!("object"));
        }
    }
    normalize_node(&mut normalized);
    normalized
}

/// `{"type": "object", "properties": {}}`
pub fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

fn normalize_node(node: &mut Value) {
    let Value::Object(map) = node else {
        return;
    };

    if has_type(map, "object") && !map.get("properties").is_some_and(Value::is_object) {
        map.insert("properties".to_string(), Value::Object(Map::new()));
    }
    if has_type(map, "array") && !map.contains_key("items") {
        map.insert("items".to_string(), json!({"type": "string"}));
    }

    for key in ["properties", "$defs", "definitions", "patternProperties"] {
        if let Some(Value::Object(children)) = map.get_mut(key) {
            for child in children.values_mut() {
                normalize_node(child);
            }
        }
    }

    match map.get_mut("items") {
        Some(Value::Array(items)) => items.iter_mut().for_each(normalize_node),
        Some(items) => normalize_node(items),
        None => {}
    }

    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(variants)) = map.get_mut(key) {
            variants.iter_mut().for_each(normalize_node);
        }
    }

    if let Some(additional) = map.get_mut("additionalProperties") {
        normalize_node(additional);
    }
}

fn has_type(map: &Map<String, Value>, wanted: &str) -> bool {
    match map.get("type") {
        Some(Value::String(t)) => t == wanted,
        Some(Value::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}
