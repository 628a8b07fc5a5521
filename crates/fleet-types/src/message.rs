//! # Message
//!
//! The transient value carried by the bus. Created once per publish and
//! cloned into every subscriber queue, so no two subscribers share a payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Process-unique, monotonically increasing message identifier.
pub type MessageId = u64;

/// A validated publication on one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    /// Publishing node. Set by the bus from the publisher's identity, never
    /// from the payload.
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(id: MessageId, topic: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            topic: topic.into(),
            source: source.into(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// Convenience accessor for a string field of the payload.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    /// Convenience accessor for an integer field of the payload.
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.payload.get(name).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clone_does_not_share_payload() {
        let original = Message::new(1, "speech.say", "brain", json!({ "text": "hi" }));
        let mut copy = original.clone();
        copy.payload["text"] = json!("changed");

        assert_eq!(original.str_field("text"), Some("hi"));
        assert_eq!(copy.str_field("text"), Some("changed"));
    }

    #[test]
    fn test_field_accessors() {
        let msg = Message::new(7, "t", "n", json!({ "priority": 10 }));
        assert_eq!(msg.i64_field("priority"), Some(10));
        assert_eq!(msg.str_field("priority"), None);
        assert_eq!(msg.id, 7);
    }
}
