use std::path::PathBuf;
use std::time::Duration;

use validator::{Validate, ValidationError};

use crate::monitor::MonitorConfig;

/// Upper bound for every timeout setting: one week.
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Backend connection and generation settings, loaded from environment
/// variables.
#[derive(Debug, Clone, Validate)]
#[validate(schema(function = "validate_timings"))]
pub struct ComfyUIConfig {
    /// HTTP base URL (default: `http://localhost:8188`).
    #[validate(url)]
    pub base_url: String,
    /// Push-channel URL including path (default: `ws://localhost:8188/ws`).
    #[validate(url)]
    pub ws_url: String,
    /// Path of the workflow template. Required.
    pub workflow_path: PathBuf,
    /// Per-HTTP-call timeout in seconds (default: `300`).
    #[validate(range(min = 1, max = MAX_TIMEOUT_SECS))]
    pub http_timeout_secs: u64,
    /// Deadline for one whole generation in seconds (default: `300`).
    #[validate(range(min = 1, max = MAX_TIMEOUT_SECS))]
    pub generation_timeout_secs: u64,
    /// Push-channel idle deadline in seconds (default: `30`).
    #[validate(range(min = 1, max = MAX_TIMEOUT_SECS))]
    pub idle_timeout_secs: u64,
    /// Heartbeat interval in seconds (default: `10`).
    #[validate(range(min = 1, max = MAX_TIMEOUT_SECS))]
    pub heartbeat_secs: u64,
    /// Global cap on concurrent generations, `0` for none (default: `0`).
    pub max_concurrent: usize,
}

/// Errors from loading configuration. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl ComfyUIConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                  |
    /// |------------------------------|--------------------------|
    /// | `COMFYUI_BASE_URL`           | `http://localhost:8188`  |
    /// | `COMFYUI_WS_URL`             | `ws://localhost:8188/ws` |
    /// | `COMFYUI_WORKFLOW_PATH`      | (required)               |
    /// | `COMFYUI_HTTP_TIMEOUT_SECS`  | `300`                    |
    /// | `GENERATION_TIMEOUT_SECS`    | `300`                    |
    /// | `MONITOR_IDLE_TIMEOUT_SECS`  | `30`                     |
    /// | `MONITOR_HEARTBEAT_SECS`     | `10`                     |
    /// | `MAX_CONCURRENT_GENERATIONS` | `0`                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let workflow_path = lookup("COMFYUI_WORKFLOW_PATH")
            .filter(|p| !p.trim().is_empty())
            .ok_or(ConfigError::Missing("COMFYUI_WORKFLOW_PATH"))?;

        let config = Self {
            base_url: get("COMFYUI_BASE_URL", "http://localhost:8188"),
            ws_url: get("COMFYUI_WS_URL", "ws://localhost:8188/ws"),
            workflow_path: PathBuf::from(workflow_path),
            http_timeout_secs: parse_number(&lookup, "COMFYUI_HTTP_TIMEOUT_SECS", 300)?,
            generation_timeout_secs: parse_number(&lookup, "GENERATION_TIMEOUT_SECS", 300)?,
            idle_timeout_secs: parse_number(&lookup, "MONITOR_IDLE_TIMEOUT_SECS", 30)?,
            heartbeat_secs: parse_number(&lookup, "MONITOR_HEARTBEAT_SECS", 10)?,
            max_concurrent: parse_number(&lookup, "MAX_CONCURRENT_GENERATIONS", 0)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn validate_timings(config: &ComfyUIConfig) -> Result<(), ValidationError> {
    if config.heartbeat_secs >= config.idle_timeout_secs {
        return Err(ValidationError::new("heartbeat_not_below_idle_timeout"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ComfyUIConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ComfyUIConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("COMFYUI_WORKFLOW_PATH", "workflow.json")]).unwrap();
        assert_eq!(config.base_url, "http://localhost:8188");
        assert_eq!(config.ws_url, "ws://localhost:8188/ws");
        assert_eq!(config.generation_timeout(), Duration::from_secs(300));
        assert_eq!(config.monitor().idle_timeout, Duration::from_secs(30));
        assert_eq!(config.monitor().heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.max_concurrent, 0);
    }

    #[test]
    fn workflow_path_is_required() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("COMFYUI_WORKFLOW_PATH")));
        assert_matches!(
            load(&[("COMFYUI_WORKFLOW_PATH", "  ")]),
            Err(ConfigError::Missing(_))
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("COMFYUI_WORKFLOW_PATH", "/etc/relay/workflow.json"),
            ("COMFYUI_BASE_URL", "http://gpu-box:8188"),
            ("COMFYUI_WS_URL", "wss://gpu-box/ws"),
            ("MAX_CONCURRENT_GENERATIONS", "4"),
            ("MONITOR_IDLE_TIMEOUT_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(config.base_url, "http://gpu-box:8188");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.idle_timeout_secs, 60);
    }

    #[test]
    fn non_numeric_value_is_rejected() {
        assert_matches!(
            load(&[("COMFYUI_WORKFLOW_PATH", "w.json"), ("GENERATION_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid { key: "GENERATION_TIMEOUT_SECS", .. })
        );
    }

    #[test]
    fn invalid_url_fails_validation() {
        assert_matches!(
            load(&[("COMFYUI_WORKFLOW_PATH", "w.json"), ("COMFYUI_BASE_URL", "not a url")]),
            Err(ConfigError::Validation(_))
        );
    }

    #[test]
    fn heartbeat_must_be_shorter_than_idle_timeout() {
        assert_matches!(
            load(&[
                ("COMFYUI_WORKFLOW_PATH", "w.json"),
                ("MONITOR_IDLE_TIMEOUT_SECS", "10"),
                ("MONITOR_HEARTBEAT_SECS", "10"),
            ]),
            Err(ConfigError::Validation(_))
        );
    }

    #[test]
    fn huge_timeout_fails_validation() {
        assert_matches!(
            load(&[
                ("COMFYUI_WORKFLOW_PATH", "w.json"),
                ("GENERATION_TIMEOUT_SECS", "18446744073709551615"),
            ]),
            Err(ConfigError::Validation(_))
        );
        let config = load(&[
            ("COMFYUI_WORKFLOW_PATH", "w.json"),
            ("GENERATION_TIMEOUT_SECS", "604800"),
        ])
        .unwrap();
        assert_eq!(config.generation_timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn zero_timeout_fails_validation() {
        assert_matches!(
            load(&[("COMFYUI_WORKFLOW_PATH", "w.json"), ("COMFYUI_HTTP_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Validation(_))
        );
    }
}
