//! Proxy configuration.

use std::time::Duration;

use argus_tasks::DEFAULT_MAX_CONCURRENT;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Forwarding settings for the companion streaming service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Whether requests under `prefix` are forwarded at all.
    pub enabled: bool,
    /// Path prefix that selects proxied requests; stripped before forwarding.
    pub prefix: String,
    /// Base URL of the companion service.
    pub upstream_url: String,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds, including the body read.
    pub request_timeout_secs: u64,
    /// Concurrent forwarded requests; excess requests get 503 immediately.
    pub max_concurrent: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "/go2rtc/".to_string(),
            upstream_url: "http://127.0.0.1:1984".to_string(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl ProxyConfig {
    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validates the settings.
    pub fn validate(&self) -> ProxyResult<()> {
        if !self.prefix.starts_with('/') || !self.prefix.ends_with('/') || self.prefix.len() < 2 {
            return Err(ProxyError::config(format!(
                "proxy prefix must start and end with '/', got '{}'",
                self.prefix
            )));
        }
        if !(self.upstream_url.starts_with("http://") || self.upstream_url.starts_with("https://")) {
            return Err(ProxyError::config(format!(
                "upstream_url must be an http(s) URL, got '{}'",
                self.upstream_url
            )));
        }
        if self.max_concurrent == 0 {
            return Err(ProxyError::config("max_concurrent must be greater than 0"));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ProxyError::config("proxy timeouts must be greater than 0"));
        }
        Ok(())
    }
}
