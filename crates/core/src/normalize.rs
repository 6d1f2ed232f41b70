//! Profile config normalization.
//!
//! Stored configs are either already structured or a string holding encoded
//! JSON. Everything downstream only ever sees the structured form.

use serde_json::Value;

/// A stored config string that failed to decode. Kept alongside the raw text
/// so the composer can render it visibly instead of dropping it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid profile config at line {line} column {column}: {message}")]
pub struct ConfigParseError {
    pub raw: String,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ConfigParseError {
    fn from_json(raw: &str, e: &serde_json::Error) -> Self {
        Self { raw: raw.to_string(), message: e.to_string(), line: e.line(), column: e.column() }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigParser {
    yaml_fallback: bool,
}

impl ConfigParser {
    /// Strict JSON decoding of string configs.
    pub fn strict() -> Self { Self { yaml_fallback: false } }

    /// Retry a string that is not valid JSON as YAML. Only mappings and
    /// sequences are accepted from the fallback, so free text still fails.
    pub fn with_yaml_fallback(mut self, on: bool) -> Self {
        self.yaml_fallback = on;
        self
    }

    pub fn yaml_fallback(&self) -> bool { self.yaml_fallback }

    /// Structured values pass through unchanged; strings are decoded.
    pub fn normalize(&self, raw: &Value) -> Result<Value, ConfigParseError> {
        match raw {
            Value::String(s) => self.decode(s),
            other => Ok(other.clone()),
        }
    }

    fn decode(&self, s: &str) -> Result<Value, ConfigParseError> {
        let err = match serde_json::from_str::<Value>(s) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if self.yaml_fallback {
            if let Ok(v) = serde_yaml::from_str::<Value>(s) {
                if v.is_object() || v.is_array() {
                    return Ok(v);
                }
            }
        }
        Err(ConfigParseError::from_json(s, &err))
    }
}
