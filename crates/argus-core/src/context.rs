//! Identifiers and caller identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for an accepted connection, using UUID v7.
///
/// Replies produced off the loop thread are keyed by this id; a reply
/// addressed to an id that is no longer registered is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a connection id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A unique identifier for each request, using UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new time-ordered request id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The authenticated caller of a request.
///
/// Produced by the server's auth policy and handed to handlers read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// No credentials were required for this path.
    #[default]
    Anonymous,
    /// Authenticated through a session token.
    Session {
        /// User the session belongs to.
        user: String,
    },
    /// Authenticated through a bearer token or API key.
    ApiKey {
        /// Non-secret identifier of the key.
        key_id: String,
    },
    /// Authenticated through legacy basic credentials.
    Basic {
        /// User name from the credentials.
        user: String,
    },
}

impl Principal {
    /// Returns a string suitable for logging. Never contains secrets.
    #[must_use]
    pub fn log_id(&self) -> String {
        match self {
            Self::Anonymous => "anonymous".to_string(),
            Self::Session { user } => format!("session:{user}"),
            Self::ApiKey { key_id } => format!("apikey:{key_id}"),
            Self::Basic { user } => format!("basic:{user}"),
        }
    }

    /// Returns `true` if the caller presented valid credentials.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }
}
