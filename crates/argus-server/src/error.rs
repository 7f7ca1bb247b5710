//! Error types for the server crate.

use http::StatusCode;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while building, starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// A route could not be registered.
    #[error(transparent)]
    Route(#[from] argus_router::RouteError),

    /// The worker pool could not be created.
    #[error(transparent)]
    Pool(#[from] argus_tasks::PoolError),

    /// The companion proxy could not be created.
    #[error(transparent)]
    Proxy(#[from] argus_sidecar::ProxyError),

    /// The event loop thread or its runtime could not be started.
    #[error("Failed to start event loop: {0}")]
    Runtime(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Get the HTTP status code this error maps to when it surfaces in a
    /// response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Proxy(e) => e.status_code(),
            Self::Pool(e) if e.is_capacity() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_display() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:80".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().starts_with("Failed to bind 0.0.0.0:80"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ServerError::config("x").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ServerError::Pool(argus_tasks::PoolError::QueueFull(8)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServerError::Proxy(argus_sidecar::ProxyError::Saturated { max: 1 }).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
