//! Server configuration types.
//!
//! [`ServerConfig`] holds the listener settings fixed at startup.
//! [`AccessPolicy`] holds the auth and CORS rules, which may be swapped at
//! runtime through a [`Versioned`](argus_core::Versioned) cell.
//!
//! # Example
//!
//! ```rust
//! use argus_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config: ServerConfig = toml::from_str(r#"
//!     bind = "127.0.0.1:9000"
//!     close_grace_ms = 100
//! "#).unwrap();
//!
//! assert_eq!(config.bind, "127.0.0.1:9000");
//! assert_eq!(config.close_grace(), Duration::from_millis(100));
//! assert_eq!(config.ws_path, "/api/ws");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;
use crate::cors::CorsConfig;
use crate::error::{ServerError, ServerResult};

/// Default HTTP bind address.
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Default WebSocket upgrade path.
pub const DEFAULT_WS_PATH: &str = "/api/ws";

/// Default request body limit (10 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:8080`.
    pub bind: String,
    /// Path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Directory served for static files. `None` disables static serving.
    pub static_root: Option<PathBuf>,
    /// Page `/` redirects to, when static serving is enabled.
    pub landing_page: Option<String>,
    /// File served for extension-less misses (single-page app routing).
    pub spa_index: Option<String>,
    /// How long one `poll_once` waits for a connection, in milliseconds.
    pub poll_interval_ms: u64,
    /// Time allowed for the request head to arrive, in seconds.
    pub header_read_timeout_secs: u64,
    /// Time allowed for the request body to arrive, in seconds.
    pub body_timeout_secs: u64,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Pause between close frames and the forced close, in milliseconds.
    pub close_grace_ms: u64,
    /// Final poll after the forced close, in milliseconds.
    pub settle_ms: u64,
    /// Upper bound for the whole coordinated shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            static_root: None,
            landing_page: Some("/index.html".to_string()),
            spa_index: None,
            poll_interval_ms: 50,
            header_read_timeout_secs: 10,
            body_timeout_secs: 30,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            close_grace_ms: 250,
            settle_ms: 50,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Header read timeout as a duration.
    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    /// Body read timeout as a duration.
    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs)
    }

    /// Close grace period as a duration.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Settle poll as a duration.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// Shutdown timeout as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validates the settings.
    pub fn validate(&self) -> ServerResult<()> {
        if self.bind.trim().is_empty() {
            return Err(ServerError::config("bind address must not be empty"));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ServerError::config(format!(
                "ws_path must start with '/', got '{}'",
                self.ws_path
            )));
        }
        if let Some(page) = &self.landing_page {
            if !page.starts_with('/') {
                return Err(ServerError::config(format!(
                    "landing_page must start with '/', got '{page}'"
                )));
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(ServerError::config("poll_interval_ms must be greater than 0"));
        }
        if self.max_body_bytes == 0 {
            return Err(ServerError::config("max_body_bytes must be greater than 0"));
        }
        if self.header_read_timeout_secs == 0 || self.body_timeout_secs == 0 {
            return Err(ServerError::config("request timeouts must be greater than 0"));
        }
        Ok(())
    }
}

/// Auth and CORS rules applied to each request.
///
/// A request takes one snapshot of the policy on arrival and uses it for its
/// whole lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Authentication rules.
    pub auth: AuthConfig,
    /// Cross-origin rules.
    pub cors: CorsConfig,
}

impl AccessPolicy {
    /// Creates a policy from its parts.
    pub fn new(auth: AuthConfig, cors: CorsConfig) -> Self {
        Self { auth, cors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.ws_path, "/api/ws");
        assert_eq!(config.close_grace(), Duration::from_millis(250));
        assert_eq!(config.landing_page.as_deref(), Some("/index.html"));
        assert!(config.static_root.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: ServerConfig =
            toml::from_str("static_root = \"/var/www\"\nspa_index = \"index.html\"").unwrap();
        assert_eq!(config.static_root, Some(PathBuf::from("/var/www")));
        assert_eq!(config.spa_index.as_deref(), Some("index.html"));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(toml::from_str::<ServerConfig>("listen = \"x\"").is_err());
    }

    #[test]
    fn test_validate() {
        let config = ServerConfig {
            ws_path: "ws".into(),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_body_bytes: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            landing_page: Some("index.html".into()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
