//! Hub configuration.

use std::time::Duration;

/// Configuration for the [`Hub`](crate::Hub).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Clients silent for longer than this are dropped by
    /// [`Hub::cleanup_idle`](crate::Hub::cleanup_idle) (default: 1 hour).
    pub idle_timeout: Duration,
    /// How long a connection waits for the peer's close reply after sending
    /// its own close frame (default: 2 seconds).
    pub close_timeout: Duration,
    /// Shutdown priority of each client component (default: 40).
    pub client_priority: i32,
    /// Query parameter carrying a caller-chosen client id.
    pub client_id_param: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            close_timeout: Duration::from_secs(2),
            client_priority: 40,
            client_id_param: "client_id".to_string(),
        }
    }
}

impl HubConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the close handshake timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the shutdown priority of client components.
    pub fn client_priority(mut self, priority: i32) -> Self {
        self.client_priority = priority;
        self
    }

    /// Set the query parameter used for requested client ids.
    pub fn client_id_param(mut self, name: impl Into<String>) -> Self {
        self.client_id_param = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.idle_timeout, Duration::from_secs(3600));
        assert_eq!(config.client_priority, 40);
        assert_eq!(config.client_id_param, "client_id");
    }

    #[test]
    fn test_builder() {
        let config = HubConfig::new()
            .idle_timeout(Duration::from_secs(60))
            .close_timeout(Duration::from_millis(500))
            .client_priority(45);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.close_timeout, Duration::from_millis(500));
        assert_eq!(config.client_priority, 45);
    }
}
