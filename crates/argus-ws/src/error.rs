//! Hub and handshake errors.

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Result alias for hub operations.
pub type WsResult<T> = Result<T, WsError>;

/// Failures of the upgrade handshake and of the hub.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WsError {
    /// The upgrade request is malformed.
    #[error("bad upgrade request: {reason}")]
    NotWebSocketRequest {
        /// Which header was missing or wrong.
        reason: String,
    },

    /// The hub is shut down.
    #[error("hub closed, no new clients accepted")]
    HubClosed,

    /// Inbound text that is not an envelope.
    #[error("malformed envelope: {0}")]
    InvalidEnvelope(String),

    /// A message addressed a topic nobody handles.
    #[error("no handler for topic {0:?}")]
    UnknownTopic(String),

    /// Serializing an outbound envelope failed.
    #[error("cannot encode envelope: {0}")]
    Encode(String),
}

impl WsError {
    /// A rejected upgrade request.
    pub fn not_websocket(reason: impl Into<String>) -> Self {
        Self::NotWebSocketRequest {
            reason: reason.into(),
        }
    }

    /// A malformed inbound message.
    pub fn invalid_envelope(reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope(reason.into())
    }

    /// Status answered when the upgrade cannot proceed.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotWebSocketRequest { .. } | Self::InvalidEnvelope(_) => StatusCode::BAD_REQUEST,
            Self::HubClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownTopic(_) => StatusCode::NOT_FOUND,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Close codes the hub sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// 1000, the client or an operator closed the session.
    Normal = 1000,
    /// 1001, sent to every client at shutdown and on idle expiry.
    GoingAway = 1001,
}

impl CloseCode {
    /// Numeric value on the wire.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::GoingAway => "going away",
        };
        write!(f, "{name} ({})", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_upgrade_is_bad_request() {
        let err = WsError::not_websocket("missing Sec-WebSocket-Key");
        assert!(err.to_string().contains("Sec-WebSocket-Key"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_closed_hub_is_unavailable() {
        assert_eq!(WsError::HubClosed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::GoingAway.as_u16(), 1001);
        assert_eq!(CloseCode::GoingAway.to_string(), "going away (1001)");
        assert_eq!(CloseCode::Normal.to_string(), "normal (1000)");
    }
}
