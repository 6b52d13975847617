//! Metrics configuration

use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    ///
    /// When disabled, recording calls find no global instance and do nothing.
    #[serde(default)]
    pub enabled: bool,

    /// OTLP/HTTP endpoint metrics are pushed to
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

fn default_endpoint() -> String {
    "http://localhost:4318/v1/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn empty_config_is_disabled() {
        let config: MetricsConfig = ron::from_str("()").unwrap();
        assert_eq!(config, MetricsConfig::default());
        assert!(!config.enabled);
    }
}
