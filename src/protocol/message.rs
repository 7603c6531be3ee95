//! The relayed message and its wire format.
//!
//! # Format
//!
//! ```json
//! {
//!   "id": "m1",
//!   "type": "ELEMENT_SELECTED",
//!   "payload": { ... },
//!   "source": "tab-3",
//!   "target": "panel",
//!   "timestamp": 1700000000123
//! }
//! ```
//!
//! `target` is omitted for broadcasts. Every other field is required.

// ============================================================================
// Imports
// ============================================================================

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{ContextId, MessageId, now_millis};

use super::MessageType;

// ============================================================================
// Message
// ============================================================================

/// A typed, addressed message.
///
/// Never mutated after creation; forwarding clones it unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per message instance.
    pub id: MessageId,

    /// Kind of the message.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Kind-specific data.
    pub payload: Value,

    /// Context that created the message.
    pub source: ContextId,

    /// Addressed recipient, absent for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ContextId>,

    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Creates a new message with a generated id and the current time.
    #[inline]
    #[must_use]
    pub fn new(
        kind: MessageType,
        payload: Value,
        source: ContextId,
        target: Option<ContextId>,
    ) -> Self {
        Self::with_id(MessageId::generate(), kind, payload, source, target)
    }

    /// Creates a new message with a specific id.
    #[inline]
    #[must_use]
    pub fn with_id(
        id: MessageId,
        kind: MessageType,
        payload: Value,
        source: ContextId,
        target: Option<ContextId>,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            source,
            target,
            timestamp: now_millis(),
        }
    }

    /// Returns `true` if the message has no explicit target.
    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Returns `true` if `context` should handle this message locally.
    ///
    /// Broadcasts are for everyone; targeted messages only for the
    /// matching context.
    #[inline]
    #[must_use]
    pub fn is_for(&self, context: &ContextId) -> bool {
        self.target
            .as_ref()
            .is_none_or(|target| context.matches(target))
    }

    /// Deserializes the payload into a consumer type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if the payload has a different shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// Serializes the message to its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Json`] on malformed input or unknown kinds.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_omits_target() {
        let message = Message::new(MessageType::Ping, Value::Null, ContextId::Hub, None);
        let json = message.to_json().expect("serialize");

        assert!(json.contains("\"type\":\"PING\""));
        assert!(json.contains("\"source\":\"hub\""));
        assert!(!json.contains("target"));
    }

    #[test]
    fn test_targeted_message_parses() {
        let text = r##"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "ELEMENT_SELECTED",
            "payload": {"selector": "#main"},
            "source": "tab-3",
            "target": "panel",
            "timestamp": 1700000000123
        }"##;

        let message = Message::from_json(text).expect("parse");
        assert_eq!(message.kind, MessageType::ElementSelected);
        assert_eq!(message.source, ContextId::tab(3));
        assert_eq!(message.target, Some(ContextId::Panel));
        assert_eq!(message.timestamp, 1_700_000_000_123);
        assert_eq!(message.payload["selector"], "#main");
        assert!(!message.is_broadcast());
    }

    #[test]
    fn test_peer_chosen_id_parses() {
        let text = r#"{"id":"m1","type":"PING","payload":{},"source":"panel","timestamp":1}"#;

        let message = Message::from_json(text).expect("parse");
        assert_eq!(message.id.as_str(), "m1");
        assert!(message.to_json().expect("serialize").contains("\"id\":\"m1\""));

        let empty = r#"{"id":"","type":"PING","payload":{},"source":"panel","timestamp":1}"#;
        assert!(Message::from_json(empty).is_err());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let text = r#"{"id": "550e8400-e29b-41d4-a716-446655440000", "type": "PING", "payload": null, "timestamp": 1}"#;
        assert!(Message::from_json(text).is_err());
    }

    #[test]
    fn test_is_for() {
        let tab3 = ContextId::tab(3);
        let tab7 = ContextId::tab(7);

        let broadcast = Message::new(MessageType::Ping, Value::Null, ContextId::Hub, None);
        assert!(broadcast.is_for(&tab3));

        let targeted = Message::new(MessageType::Ping, Value::Null, ContextId::Hub, Some(tab7));
        assert!(targeted.is_for(&tab7));
        assert!(!targeted.is_for(&tab3));
        assert!(!targeted.is_for(&ContextId::Panel));
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Selected {
            selector: String,
        }

        let message = Message::new(
            MessageType::ElementSelected,
            json!({"selector": "h1"}),
            ContextId::tab(1),
            Some(ContextId::Panel),
        );

        let selected: Selected = message.payload_as().expect("payload");
        assert_eq!(selected.selector, "h1");
        assert!(message.payload_as::<Vec<u8>>().is_err());
    }
}
