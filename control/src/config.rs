//! Configuration for the tunnelgate controller
//!
//! Defaults are production values; every field can be overridden from
//! `TUNNELGATE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Controller name GatewayClasses must reference to be owned by us
pub const CONTROLLER_NAME: &str = "tunnelgate.io/gateway-controller";

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Controller name (compared against GatewayClass.spec.controllerName)
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Namespace of the credential Secret when parametersRef has none
    #[serde(default = "default_parameters_namespace")]
    pub parameters_namespace: String,

    /// Tunnel provider API base URL
    #[serde(default = "default_provider_api_url")]
    pub provider_api_url: String,

    /// Connector image for the tunnel Deployment
    #[serde(default = "default_connector_image")]
    pub connector_image: String,

    /// Address the metrics/health endpoint binds to
    #[serde(default = "default_metrics_bind_addr")]
    pub metrics_bind_addr: String,

    /// Timeout configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Timeouts and requeue intervals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Deadline for every remote call, provider or Kubernetes (default: 10s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Periodic re-validation after a successful reconcile (default: 60s)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Fixed delay before retrying a failed reconcile (default: 60s)
    #[serde(default = "default_error_requeue")]
    pub error_requeue_secs: u64,
}

fn default_request_timeout() -> u64 {
    10
}

fn default_resync_interval() -> u64 {
    60
}

fn default_error_requeue() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            resync_interval_secs: default_resync_interval(),
            error_requeue_secs: default_error_requeue(),
        }
    }
}

impl TimeoutConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

fn default_controller_name() -> String {
    CONTROLLER_NAME.to_string()
}

fn default_parameters_namespace() -> String {
    "default".to_string()
}

fn default_provider_api_url() -> String {
    "https://api.cloudflare.com/client/v4/".to_string()
}

fn default_connector_image() -> String {
    "cloudflare/cloudflared:latest".to_string()
}

fn default_metrics_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            parameters_namespace: default_parameters_namespace(),
            provider_api_url: default_provider_api_url(),
            connector_image: default_connector_image(),
            metrics_bind_addr: default_metrics_bind_addr(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let mut config = Self::default();

        if let Ok(val) = env::var("TUNNELGATE_CONTROLLER_NAME") {
            config.controller_name = val;
        }
        if let Ok(val) = env::var("TUNNELGATE_PARAMETERS_NAMESPACE") {
            config.parameters_namespace = val;
        }
        if let Ok(val) = env::var("TUNNELGATE_PROVIDER_API_URL") {
            config.provider_api_url = val;
        }
        if let Ok(val) = env::var("TUNNELGATE_CONNECTOR_IMAGE") {
            config.connector_image = val;
        }
        if let Ok(val) = env::var("TUNNELGATE_METRICS_ADDR") {
            config.metrics_bind_addr = val;
        }

        config.timeouts.request_timeout_secs =
            parse_secs("TUNNELGATE_REQUEST_TIMEOUT_SECS", config.timeouts.request_timeout_secs)?;
        config.timeouts.resync_interval_secs =
            parse_secs("TUNNELGATE_RESYNC_SECS", config.timeouts.resync_interval_secs)?;
        config.timeouts.error_requeue_secs =
            parse_secs("TUNNELGATE_ERROR_REQUEUE_SECS", config.timeouts.error_requeue_secs)?;

        Ok(config)
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64, String> {
    match env::var(var) {
        Ok(val) => val
            .parse::<u64>()
            .map_err(|e| format!("Invalid {}={}: {}", var, val, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.controller_name, "tunnelgate.io/gateway-controller");
        assert_eq!(config.parameters_namespace, "default");
        assert!(config.provider_api_url.ends_with('/'));
    }

    #[test]
    fn test_timeout_defaults() {
        let config = ControllerConfig::default();

        assert_eq!(
            config.timeouts.request_timeout(),
            Duration::from_secs(10),
            "Remote calls must be bounded so a stuck provider can't starve workers"
        );
        assert_eq!(
            config.timeouts.error_requeue(),
            Duration::from_secs(60),
            "Failed reconciles retry on a fixed delay"
        );
        assert_eq!(config.timeouts.resync_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ControllerConfig =
            serde_json::from_str(r#"{"controller_name":"example.com/other"}"#).unwrap();
        assert_eq!(config.controller_name, "example.com/other");
        assert_eq!(config.timeouts.request_timeout_secs, 10);
        assert_eq!(config.connector_image, "cloudflare/cloudflared:latest");
    }
}
