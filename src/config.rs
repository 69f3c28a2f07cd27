//! Router configuration and shape validation.
//!
//! Config is deserialized once and treated as owned state inside the
//! router; `sync_with_helper` replaces the model block wholesale rather
//! than mutating it field by field, so every observer sees a consistent
//! snapshot.

use serde::{Deserialize, Serialize};

use crate::proxy::parse_proxy;

/// Full router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Master switch. Disabled routers refuse every request up front.
    #[serde(default)]
    pub enabled: bool,

    /// Ordered API keys. A session is pinned to one of these by a stable
    /// hash of its session id.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Chat-completions endpoint URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Primary model plus ordered fallback chain.
    #[serde(default)]
    pub models: ModelsConfig,

    /// Outbound proxy pool.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Per-call timeout budgets.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_keys: Vec::new(),
            endpoint: default_endpoint(),
            models: ModelsConfig::default(),
            proxy: ProxyConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

/// Primary model + ordered fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

/// Proxy pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Entries in `host:port` or `host:port:user:pass` form.
    #[serde(default)]
    pub list: Vec<String>,
    /// After all proxy attempts for a model fail, try once directly.
    #[serde(default)]
    pub fallback_to_direct: bool,
}

/// Per-call timeout budgets, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_ms: u64,
    #[serde(default = "default_quick_ms")]
    pub quick_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_ms: default_timeout_ms(),
            quick_ms: default_quick_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_quick_ms() -> u64 {
    8_000
}

/// Outcome of a shape check.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate configuration shape.
///
/// Enabled-with-no-keys is deliberately *not* an error here: it makes the
/// router "not ready" at runtime instead of failing construction.
pub fn validate(cfg: &RouterConfig) -> ConfigReport {
    let mut errors = Vec::new();

    if cfg.timeouts.default_ms == 0 {
        errors.push("timeouts.default_ms must be positive".to_string());
    }
    if cfg.timeouts.quick_ms == 0 {
        errors.push("timeouts.quick_ms must be positive".to_string());
    }
    if cfg.timeouts.quick_ms > cfg.timeouts.default_ms {
        errors.push(format!(
            "timeouts.quick_ms ({}) exceeds timeouts.default_ms ({})",
            cfg.timeouts.quick_ms, cfg.timeouts.default_ms
        ));
    }

    if url::Url::parse(&cfg.endpoint).is_err() {
        errors.push(format!("endpoint is not a valid URL: {}", cfg.endpoint));
    }

    for (i, key) in cfg.api_keys.iter().enumerate() {
        if key.trim().is_empty() {
            errors.push(format!("api_keys[{i}] is blank"));
        }
    }

    for (i, raw) in cfg.proxy.list.iter().enumerate() {
        if parse_proxy(raw).is_none() {
            errors.push(format!("proxy.list[{i}] is malformed: {raw}"));
        }
    }

    ConfigReport {
        valid: errors.is_empty(),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn enabled_config() -> RouterConfig {
        RouterConfig {
            enabled: true,
            api_keys: vec!["sk-test-1".into()],
            models: ModelsConfig {
                primary: "meta-llama/llama-3.3-70b".into(),
                fallbacks: vec!["qwen/qwen-2.5-72b".into()],
            },
            ..Default::default()
        }
    }

    #[test]
    fn default_config_validates() {
        let report = validate(&RouterConfig::default());
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn well_formed_config_validates() {
        assert!(validate(&enabled_config()).valid);
    }

    #[test]
    fn empty_keys_is_not_a_validation_error() {
        let mut cfg = enabled_config();
        cfg.api_keys.clear();
        assert!(validate(&cfg).valid);
    }

    #[test]
    fn inverted_timeouts_are_rejected() {
        let mut cfg = enabled_config();
        cfg.timeouts.quick_ms = 60_000;
        cfg.timeouts.default_ms = 5_000;
        let report = validate(&cfg);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn bad_endpoint_blank_key_and_bad_proxy_are_reported() {
        let mut cfg = enabled_config();
        cfg.endpoint = "not a url".into();
        cfg.api_keys.push("   ".into());
        cfg.proxy.list.push("host:port:user".into());
        let report = validate(&cfg);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
    }

    // An empty model list is a runtime concern, not a config defect: the
    // router reports it per-request once the health oracle has had its say.
    #[test]
    fn enabled_without_models_is_not_a_validation_error() {
        let mut cfg = enabled_config();
        cfg.models = ModelsConfig::default();
        assert!(validate(&cfg).valid);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: RouterConfig = serde_json::from_str(r#"{"enabled": true, "api_keys": ["k1"]}"#).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.timeouts.default_ms, 30_000);
        assert_eq!(cfg.timeouts.quick_ms, 8_000);
        assert!(!cfg.proxy.enabled);
    }
}
