//! Composed manifest value and its renderings.

use serde::Serialize;
use serde_json::Value as Json;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("yaml render failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json render failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A freshly built manifest document. Owns no references back to the
/// resources or profiles it was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ComposedManifest(Json);

impl ComposedManifest {
    pub fn new(value: Json) -> Self { Self(value) }
    pub fn as_value(&self) -> &Json { &self.0 }
    pub fn into_value(self) -> Json { self.0 }

    /// JSON pointer lookup, e.g. `/spec/containers/0/name`.
    pub fn pointer(&self, ptr: &str) -> Option<&Json> { self.0.pointer(ptr) }

    /// YAML with keys in insertion order.
    pub fn to_yaml(&self) -> Result<String, RenderError> { Ok(serde_yaml::to_string(&self.0)?) }

    pub fn to_json_pretty(&self) -> Result<String, RenderError> { Ok(serde_json::to_string_pretty(&self.0)?) }

    /// Dotted paths of every inline error marker, in document order.
    pub fn error_markers(&self) -> Vec<String> {
        fn walk(v: &Json, path: &mut String, out: &mut Vec<String>) {
            match v {
                Json::Object(map) => {
                    if is_marker(map) {
                        out.push(path.clone());
                    }
                    for (k, vv) in map.iter() {
                        if is_marker(map) && (k == "error" || k == "raw") { continue; }
                        let len = path.len();
                        if !path.is_empty() { path.push('.'); }
                        path.push_str(k);
                        walk(vv, path, out);
                        path.truncate(len);
                    }
                }
                Json::Array(arr) => {
                    for (i, vv) in arr.iter().enumerate() {
                        let len = path.len();
                        path.push_str(&format!("[{}]", i));
                        walk(vv, path, out);
                        path.truncate(len);
                    }
                }
                _ => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.0, &mut String::new(), &mut out);
        out
    }
}

fn is_marker(map: &serde_json::Map<String, Json>) -> bool {
    map.get("error").map(|e| e.is_string()).unwrap_or(false)
}
