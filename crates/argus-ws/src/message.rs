//! The JSON envelope exchanged with browser clients.
//!
//! Every frame in either direction is a text frame carrying
//! `{"type": ..., "topic": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{WsError, WsResult};

/// Topic used for hub-generated control messages.
pub const SYSTEM_TOPIC: &str = "system";

/// A message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, e.g. `subscribe`, `event`, `welcome`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Topic the message belongs to.
    #[serde(default)]
    pub topic: String,
    /// Message body. Absent inbound payloads decode as `null`.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(kind: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            topic: topic.into(),
            payload,
        }
    }

    /// Create an `event` envelope, the usual server push.
    pub fn event(topic: impl Into<String>, payload: Value) -> Self {
        Self::new("event", topic, payload)
    }

    /// The greeting sent once a client is registered.
    pub fn welcome(client_id: &str) -> Self {
        Self::new("welcome", SYSTEM_TOPIC, json!({ "client_id": client_id }))
    }

    /// Acknowledges a subscription change.
    pub fn ack(message: &str, topic: &str) -> Self {
        Self::new("ack", SYSTEM_TOPIC, json!({ "message": message, "topic": topic }))
    }

    /// Reports a problem with an inbound frame. The connection stays open.
    pub fn error(message: &str) -> Self {
        Self::new("error", SYSTEM_TOPIC, json!({ "message": message }))
    }

    /// Decodes an inbound text frame.
    pub fn parse(text: &str) -> WsResult<Self> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|e| WsError::invalid_envelope(e.to_string()))?;
        if envelope.kind.trim().is_empty() {
            return Err(WsError::invalid_envelope("missing message type"));
        }
        Ok(envelope)
    }

    /// Encodes the envelope as a text frame body.
    pub fn to_text(&self) -> WsResult<String> {
        serde_json::to_string(self).map_err(|e| WsError::Encode(e.to_string()))
    }

    /// Topic named by a subscribe or unsubscribe request.
    ///
    /// Older clients put it in `payload.topic` instead of the envelope.
    pub fn requested_topic(&self) -> Option<&str> {
        if !self.topic.is_empty() {
            return Some(&self.topic);
        }
        self.payload
            .get("topic")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_shape() {
        let text = Envelope::welcome("cam-wall").to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "welcome", "topic": "system", "payload": {"client_id": "cam-wall"}})
        );
    }

    #[test]
    fn test_ack_shape() {
        let value = serde_json::to_value(Envelope::ack("Subscribed", "events")).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["topic"], "system");
        assert_eq!(value["payload"]["message"], "Subscribed");
        assert_eq!(value["payload"]["topic"], "events");
    }

    #[test]
    fn test_parse_without_payload() {
        let env = Envelope::parse(r#"{"type":"subscribe","topic":"events"}"#).unwrap();
        assert_eq!(env.kind, "subscribe");
        assert_eq!(env.topic, "events");
        assert!(env.payload.is_null());
    }

    #[test]
    fn test_parse_rejects_garbage_and_missing_type() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(WsError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"topic":"events"}"#),
            Err(WsError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":"  ","topic":"events"}"#),
            Err(WsError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_requested_topic_falls_back_to_payload() {
        let env = Envelope::parse(r#"{"type":"subscribe","payload":{"topic":"ptz"}}"#).unwrap();
        assert_eq!(env.requested_topic(), Some("ptz"));

        let env = Envelope::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(env.requested_topic(), None);
    }
}
