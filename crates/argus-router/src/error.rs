//! Route table errors.

use thiserror::Error;

/// Errors raised while building a route table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The pattern does not follow the segment grammar.
    #[error("invalid route pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// An earlier entry already matches every request the new entry would.
    #[error("route '{pattern}' is unreachable: shadowed by earlier route '{shadowed_by}'")]
    Shadowed {
        /// The unreachable pattern.
        pattern: String,
        /// The earlier pattern covering it.
        shadowed_by: String,
    },
}

impl RouteError {
    /// Create a new invalid pattern error.
    pub fn invalid_pattern(pattern: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_pattern_display() {
        let err = RouteError::invalid_pattern("/a/*/b", "'*' must be the last segment");
        assert_eq!(
            err.to_string(),
            "invalid route pattern '/a/*/b': '*' must be the last segment"
        );
    }

    #[test]
    fn test_shadowed_display() {
        let err = RouteError::Shadowed {
            pattern: "/api/x/y".into(),
            shadowed_by: "/api/x/#".into(),
        };
        assert!(err.to_string().contains("shadowed by earlier route '/api/x/#'"));
    }
}
