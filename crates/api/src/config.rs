//! Engine configuration, read from `QUILT_*` environment variables.

use std::time::Duration;

use quilt_compose::{ComposerOptions, DEFAULT_IMAGE_PLACEHOLDER};
use quilt_core::ConfigParser;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `QUILT_IMAGE_PLACEHOLDER`
    pub image_placeholder: String,
    /// `QUILT_ERROR_RAW`
    pub include_raw: bool,
    /// `QUILT_YAML_FALLBACK`
    pub yaml_fallback: bool,
    /// `QUILT_FETCH_TIMEOUT_MS`; `0` disables the bound.
    pub fetch_timeout: Option<Duration>,
    /// `QUILT_MAX_EMBED_DEPTH`
    pub max_embed_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
            include_raw: true,
            yaml_fallback: false,
            fetch_timeout: Some(Duration::from_millis(10_000)),
            max_embed_depth: 4,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from any key lookup; unset keys keep their defaults, invalid
    /// values are logged and ignored.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get("QUILT_IMAGE_PLACEHOLDER").filter(|s| !s.is_empty()) {
            cfg.image_placeholder = v;
        }
        if let Some(b) = get("QUILT_ERROR_RAW").and_then(|v| parse_flag("QUILT_ERROR_RAW", &v)) {
            cfg.include_raw = b;
        }
        if let Some(b) = get("QUILT_YAML_FALLBACK").and_then(|v| parse_flag("QUILT_YAML_FALLBACK", &v)) {
            cfg.yaml_fallback = b;
        }
        if let Some(ms) = get("QUILT_FETCH_TIMEOUT_MS").and_then(|v| parse_num("QUILT_FETCH_TIMEOUT_MS", &v)) {
            cfg.fetch_timeout = if ms == 0 { None } else { Some(Duration::from_millis(ms)) };
        }
        if let Some(n) = get("QUILT_MAX_EMBED_DEPTH").and_then(|v| parse_num("QUILT_MAX_EMBED_DEPTH", &v)) {
            cfg.max_embed_depth = n as usize;
        }
        cfg
    }

    pub fn composer_options(&self) -> ComposerOptions {
        ComposerOptions { image_placeholder: self.image_placeholder.clone(), include_raw: self.include_raw }
    }

    pub fn parser(&self) -> ConfigParser { ConfigParser::strict().with_yaml_fallback(self.yaml_fallback) }
}

fn parse_flag(key: &str, v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %v, "invalid boolean; using default");
            None
        }
    }
}

fn parse_num(key: &str, v: &str) -> Option<u64> {
    match v.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(key, value = %v, "invalid number; using default");
            None
        }
    }
}
