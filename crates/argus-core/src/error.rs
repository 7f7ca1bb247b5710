//! Error types for the core crate.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by core primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A component handle refers to a slot that was released or reused.
    #[error("stale component handle {index}:{generation}")]
    StaleHandle {
        /// Slot index of the handle.
        index: usize,
        /// Generation carried by the handle.
        generation: u64,
    },

    /// A component may only be released once it is stopped.
    #[error("component '{name}' is still {state}")]
    NotStopped {
        /// Component name.
        name: String,
        /// Current state, rendered.
        state: String,
    },

    /// A request body could not be decoded.
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// A response body could not be encoded.
    #[error("failed to encode response: {0}")]
    Encode(String),
}

impl CoreError {
    /// Create a new stale handle error.
    pub fn stale_handle(index: usize, generation: u64) -> Self {
        Self::StaleHandle { index, generation }
    }

    /// Create a new invalid body error.
    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self::InvalidBody(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_display() {
        let err = CoreError::stale_handle(3, 7);
        assert_eq!(err.to_string(), "stale component handle 3:7");
    }

    #[test]
    fn test_not_stopped_display() {
        let err = CoreError::NotStopped {
            name: "worker_pool".into(),
            state: "running".into(),
        };
        assert!(err.to_string().contains("worker_pool"));
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_invalid_body_display() {
        let err = CoreError::invalid_body("expected object");
        assert_eq!(err.to_string(), "invalid request body: expected object");
    }
}
