//! Errors raised while loading, validating or watching the configuration.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for this crate.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required file does not exist.
    #[error("no configuration at {path}")]
    FileNotFound {
        /// Requested path.
        path: PathBuf,
    },

    /// The file exists but could not be read.
    #[error("cannot read {path}")]
    ReadError {
        /// File being read.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// Malformed TOML.
    #[error("TOML syntax: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Malformed JSON, or a merged tree that does not fit the schema
    /// (unknown section, unknown key, wrong type).
    #[error("configuration does not match the schema: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A field holds a value the server cannot run with.
    #[error("{field}: {reason}")]
    InvalidValue {
        /// Dotted field path, e.g. `workers.threads`.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An `ARGUS__...` override could not be applied.
    #[error("environment override {var}: {reason}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A constraint spanning several fields does not hold.
    #[error("invalid configuration: {0}")]
    ValidationError(String),

    /// The watcher could not observe the file.
    #[error("cannot watch {path}: {reason}")]
    Watch {
        /// Watched directory or file.
        path: PathBuf,
        /// Reported by `notify`.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub(crate) fn read_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadError {
            path: path.into(),
            source,
        }
    }

    /// An [`InvalidValue`](Self::InvalidValue) for `field`.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn env_parse_error(var: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            reason: reason.into(),
        }
    }

    /// A [`ValidationError`](Self::ValidationError).
    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }

    pub(crate) fn watch(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Watch {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_culprit() {
        let err = ConfigError::file_not_found("/etc/argus/argus.toml");
        assert_eq!(err.to_string(), "no configuration at /etc/argus/argus.toml");

        let err = ConfigError::invalid_value("workers.threads", "must be greater than 0");
        assert_eq!(err.to_string(), "workers.threads: must be greater than 0");

        let err = ConfigError::env_parse_error("ARGUS__SERVER__MAX_BODY_BYTES", "expected a number");
        assert!(err.to_string().starts_with("environment override ARGUS__SERVER__MAX_BODY_BYTES"));
    }

    #[test]
    fn test_read_error_keeps_source() {
        use std::error::Error as _;
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConfigError::read_error("argus.toml", io);
        assert!(err.source().is_some());
    }
}
