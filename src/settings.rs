//! Dotted-path access to YAML settings documents
//! (`deployment.image.tag`, `pools.prod`).

use serde_yaml::{Mapping, Value};

pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(doc, |current, segment| current.get(segment))
}

/// Set `path` to `value`, creating intermediate mappings. Non-mapping
/// values in the way are replaced.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut current = doc;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        if !current.is_mapping() {
            *current = Value::Mapping(Mapping::new());
        }
        current = match current {
            Value::Mapping(map) => map
                .entry(Value::String(segment.to_string()))
                .or_insert(Value::Null),
            _ => unreachable!("replaced with a mapping above"),
        };
    }
    *current = value;
}

/// Parse a settings file; missing or empty content yields an empty mapping.
pub fn parse_document(text: Option<&str>) -> serde_yaml::Result<Value> {
    match text {
        Some(text) if !text.trim().is_empty() => serde_yaml::from_str(text),
        _ => Ok(Value::Mapping(Mapping::new())),
    }
}
