//! Document path projection
//!
//! Index paths are dotted field names (`"address.city"`). Projection walks
//! objects one segment at a time. When an array is reached mid-path, the
//! remaining path is projected over every element and the non-missing results
//! are collected into an array, so `"lines.sku"` over
//! `{"lines": [{"sku": "a"}, {"sku": "b"}]}` yields `["a", "b"]`.

use serde_json::Value;

/// Project the value at `path` out of `doc`
///
/// Returns `None` when the path does not resolve. `null` values are treated
/// as missing.
pub fn project(doc: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(doc.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    project_segments(doc, &segments)
}

fn project_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return match value {
            Value::Null => None,
            other => Some(other.clone()),
        };
    };

    match value {
        Value::Object(map) => project_segments(map.get(*head)?, rest),
        Value::Array(items) => {
            let projected: Vec<Value> = items
                .iter()
                .filter_map(|item| project_segments(item, segments))
                .collect();
            if projected.is_empty() {
                None
            } else {
                Some(Value::Array(projected))
            }
        }
        _ => None,
    }
}

/// Project each of `paths` out of `doc`, in order
///
/// Missing paths yield `null` so the output stays positionally aligned with
/// the requested paths.
pub fn project_all(doc: &Value, paths: &[String]) -> Vec<Value> {
    paths
        .iter()
        .map(|p| project(doc, p).unwrap_or(Value::Null))
        .collect()
}

/// Render a dotted path as a SQLite JSON path (`$."a"."b"`)
pub fn to_json_path(path: &str) -> String {
    let mut out = String::from("$");
    for segment in path.split('.') {
        out.push_str(".\"");
        out.push_str(&segment.replace('"', "\"\""));
        out.push('"');
    }
    out
}
