//! Error types for the worker pool and admission limiter.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by [`WorkerPool`](crate::WorkerPool) and
/// [`AdmissionLimiter`](crate::AdmissionLimiter).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is shutting down and accepts no more jobs.
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The queue is at capacity.
    #[error("worker queue full, capacity {0}")]
    QueueFull(usize),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

impl PoolError {
    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Create a spawn failed error.
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed(reason.into())
    }

    /// Returns true for errors a caller should answer with 503.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::QueueFull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(PoolError::ShuttingDown.to_string(), "worker pool is shutting down");
        assert_eq!(PoolError::QueueFull(64).to_string(), "worker queue full, capacity 64");
        assert_eq!(
            PoolError::invalid_config("workers must be > 0").to_string(),
            "invalid configuration: workers must be > 0"
        );
    }

    #[test]
    fn test_is_capacity() {
        assert!(PoolError::ShuttingDown.is_capacity());
        assert!(PoolError::QueueFull(1).is_capacity());
        assert!(!PoolError::invalid_config("x").is_capacity());
        assert!(!PoolError::spawn_failed("x").is_capacity());
    }
}
