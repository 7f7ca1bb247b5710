//! The configuration file schema.

use std::net::SocketAddr;
use std::time::Duration;

use argus_server::{AccessPolicy, AuthConfig, CorsConfig, ServerConfig};
use argus_sidecar::ProxyConfig;
use argus_tasks::PoolConfig;
use argus_telemetry::TelemetryConfig;
use argus_ws::HubConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Complete Argus configuration.
///
/// ```
/// use argus_config::ArgusConfig;
///
/// let config = ArgusConfig::default();
/// assert_eq!(config.server.bind, "0.0.0.0:8080");
/// assert_eq!(config.workers.threads, 4);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArgusConfig {
    /// Listener, static files and request limits.
    pub server: ServerConfig,
    /// Worker pool sizing.
    pub workers: WorkersConfig,
    /// Authentication.
    pub auth: AuthConfig,
    /// Cross-origin rules.
    pub cors: CorsConfig,
    /// Companion streaming service proxy.
    pub proxy: ProxyConfig,
    /// WebSocket hub.
    pub websocket: WebSocketConfig,
    /// Logging and metrics.
    pub telemetry: TelemetryConfig,
}

/// The `[workers]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Jobs that may wait in the queue before submitters block.
    pub queue_capacity: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            queue_capacity: 256,
        }
    }
}

impl WorkersConfig {
    /// The pool configuration for these settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .with_workers(self.threads)
            .with_queue_capacity(self.queue_capacity)
            .with_thread_name("argus-worker")
    }
}

/// The `[websocket]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    /// Clients silent for longer than this are dropped.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub cleanup_interval_secs: u64,
    /// How long to wait for the peer's close reply.
    pub close_timeout_secs: u64,
    /// Shutdown priority of each client.
    pub client_priority: i32,
    /// Query parameter carrying a caller-chosen client id.
    pub client_id_param: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let hub = HubConfig::default();
        Self {
            idle_timeout_secs: hub.idle_timeout.as_secs(),
            cleanup_interval_secs: 60,
            close_timeout_secs: hub.close_timeout.as_secs(),
            client_priority: hub.client_priority,
            client_id_param: hub.client_id_param,
        }
    }
}

impl WebSocketConfig {
    /// Interval of the idle sweep.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// The hub configuration for these settings.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            client_priority: self.client_priority,
            client_id_param: self.client_id_param.clone(),
        }
    }
}

impl ArgusConfig {
    /// The auth and CORS rules, as published to running servers.
    pub fn access_policy(&self) -> AccessPolicy {
        AccessPolicy::new(self.auth.clone(), self.cors.clone())
    }

    /// Checks values the types alone cannot.
    pub fn validate(&self) -> ConfigResult<()> {
        self.server
            .validate()
            .map_err(|e| ConfigError::validation_error(e.to_string()))?;

        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.bind",
                format!("invalid socket address: {}", self.server.bind),
            ));
        }

        if self.workers.threads == 0 {
            return Err(ConfigError::invalid_value("workers.threads", "must be greater than 0"));
        }
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "workers.queue_capacity",
                "must be greater than 0",
            ));
        }

        if self.auth.enabled && self.auth.password.is_empty() && self.auth.api_keys.is_empty() {
            return Err(ConfigError::validation_error(
                "auth.enabled requires auth.password or at least one auth.api_keys entry",
            ));
        }

        if self.cors.enabled
            && self.cors.allow_credentials
            && self.cors.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(ConfigError::invalid_value(
                "cors.allowed_origins",
                "'*' cannot be combined with allow_credentials",
            ));
        }

        if self.proxy.enabled {
            self.proxy
                .validate()
                .map_err(|e| ConfigError::invalid_value("proxy", e.to_string()))?;
        }

        if self.websocket.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "websocket.cleanup_interval_secs",
                "must be greater than 0",
            ));
        }

        if self.telemetry.metrics.enabled && self.telemetry.metrics.addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "telemetry.metrics.addr",
                format!("invalid socket address: {}", self.telemetry.metrics.addr),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ArgusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_websocket_defaults_follow_hub() {
        let hub = WebSocketConfig::default().hub_config();
        assert_eq!(hub.idle_timeout, Duration::from_secs(3600));
        assert_eq!(hub.client_id_param, "client_id");
        assert_eq!(WebSocketConfig::default().cleanup_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_auth_without_credentials_rejected() {
        let mut config = ArgusConfig::default();
        config.auth.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        config.auth.password = "secret".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ArgusConfig::default();
        config.workers.threads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_bad_bind_rejected() {
        let mut config = ArgusConfig::default();
        config.server.bind = "localhost".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_origin_with_credentials_rejected() {
        let mut config = ArgusConfig::default();
        config.cors.enabled = true;
        config.cors.allow_credentials = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_policy_copies_sections() {
        let mut config = ArgusConfig::default();
        config.cors.enabled = true;
        let policy = config.access_policy();
        assert!(policy.cors.enabled);
        assert_eq!(policy.auth, config.auth);
    }
}
