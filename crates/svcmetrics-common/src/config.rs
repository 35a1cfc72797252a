use serde::Deserialize;

use crate::{
    error::{MetricsError, Result},
    naming::is_valid_metric_name,
};

pub const DEFAULT_EXPOSITION_PATH: &str = "/metrics";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub service_identity: String,
    #[serde(default = "default_exposition_path")]
    pub exposition_path: String,
    #[serde(default = "default_true")]
    pub include_runtime_metrics: bool,
    /// Reported through the build-info gauge.
    #[serde(default = "default_version")]
    pub version: String,
}

impl MetricsConfig {
    pub fn new(service_identity: impl Into<String>) -> Self {
        Self {
            enabled: true,
            service_identity: service_identity.into(),
            exposition_path: default_exposition_path(),
            include_runtime_metrics: true,
            version: default_version(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(String::new())
        }
    }

    /// Reads `SVCMETRICS_*` variables. Returns `None` when no service identity is set.
    pub fn from_env() -> Option<Self> {
        let service_identity = env_value("SVCMETRICS_SERVICE")?;
        let mut config = Self::new(service_identity);

        if let Some(enabled) = env_value("SVCMETRICS_ENABLED").and_then(|value| parse_flag(&value))
        {
            config.enabled = enabled;
        }
        if let Some(path) = env_value("SVCMETRICS_PATH") {
            config.exposition_path = path;
        }
        if let Some(runtime) =
            env_value("SVCMETRICS_RUNTIME_METRICS").and_then(|value| parse_flag(&value))
        {
            config.include_runtime_metrics = runtime;
        }
        if let Some(version) = env_value("SVCMETRICS_VERSION") {
            config.version = version;
        }

        Some(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.exposition_path.starts_with('/') {
            return Err(MetricsError::InvalidConfig(format!(
                "exposition path must start with '/': {}",
                self.exposition_path
            )));
        }

        if self.enabled && !is_valid_metric_name(&self.service_identity) {
            return Err(MetricsError::InvalidConfig(format!(
                "service identity is not a valid metric prefix: {:?}",
                self.service_identity
            )));
        }

        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

fn default_exposition_path() -> String {
    DEFAULT_EXPOSITION_PATH.to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_applies_defaults() {
        let config: MetricsConfig =
            serde_json::from_str(r#"{"service_identity":"orders"}"#).unwrap();

        assert!(config.enabled);
        assert!(config.include_runtime_metrics);
        assert_eq!(config.exposition_path, "/metrics");
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn validate_rejects_bad_identity_only_when_enabled() {
        assert!(MetricsConfig::new("orders-api").validate().is_err());
        assert!(MetricsConfig::new("orders_api").validate().is_ok());
        assert!(MetricsConfig::disabled().validate().is_ok());
    }

    #[test]
    fn validate_rejects_relative_path() {
        let mut config = MetricsConfig::new("orders");
        config.exposition_path = "metrics".to_string();
        assert!(matches!(config.validate(), Err(MetricsError::InvalidConfig(_))));
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
