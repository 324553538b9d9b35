//! Room event types.
//!
//! The [`RoomEvent`] struct is the event being evaluated against push rules,
//! and also the shape of the state events (memberships) the evaluator reads
//! display names from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of room membership state events.
pub const MEMBER_EVENT_TYPE: &str = "m.room.member";

/// An event posted into a room.
///
/// # Example
///
/// ```json
/// {
///   "event_id": "$abc:example.org",
///   "room_id": "!room:example.org",
///   "sender": "@alice:example.org",
///   "type": "m.room.message",
///   "content": { "msgtype": "m.text", "body": "hello" }
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RoomEvent {
    pub event_id: String,

    pub room_id: String,

    pub sender: String,

    /// Event type (e.g. "m.room.message", "m.room.member")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Present only on state events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    #[serde(default)]
    pub content: Value,
}

impl RoomEvent {
    /// Create a new non-state event
    pub fn new(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        event_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            event_type: event_type.into(),
            state_key: None,
            content,
        }
    }

    /// Turn this into a state event with the given state key
    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Key identifying the slot this event occupies in room state.
    pub fn state_slot(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.event_type.clone(), key.clone()))
    }

    /// Look up a string field by dotted path, e.g. `content.body` or `type`.
    ///
    /// Returns `None` when the path is missing or does not end on a string.
    pub fn field(&self, path: &str) -> Option<&str> {
        let mut parts = path.split('.');
        let top = parts.next()?;

        let mut value = match top {
            "event_id" => return Some(&self.event_id),
            "room_id" => return Some(&self.room_id),
            "sender" => return Some(&self.sender),
            "type" => return Some(&self.event_type),
            "state_key" => return self.state_key.as_deref(),
            "content" => &self.content,
            _ => return None,
        };

        for part in parts {
            value = value.get(part)?;
        }

        value.as_str()
    }

    /// The `displayname` of a membership event, if set and non-empty.
    pub fn display_name(&self) -> Option<&str> {
        if self.event_type != MEMBER_EVENT_TYPE {
            return None;
        }

        self.content
            .get("displayname")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_deserialize() {
        let json_str = r#"{
            "event_id": "$1",
            "room_id": "!room",
            "sender": "@alice:test",
            "type": "m.room.message",
            "content": {"body": "hi"}
        }"#;

        let event: RoomEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.event_type, "m.room.message");
        assert_eq!(event.content["body"], "hi");
        assert!(event.state_key.is_none());
        assert!(!event.is_state());
    }

    #[test]
    fn test_event_serialize_omits_state_key() {
        let event = RoomEvent::new("$1", "!room", "@alice:test", "m.room.message", json!({}));

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("\"type\""));
        assert!(!json_str.contains("state_key"));
    }

    #[test]
    fn test_field_lookup() {
        let event = RoomEvent::new(
            "$1",
            "!room",
            "@alice:test",
            "m.room.message",
            json!({"body": "hello", "info": {"mimetype": "text/plain"}, "size": 3}),
        );

        assert_eq!(event.field("type"), Some("m.room.message"));
        assert_eq!(event.field("content.body"), Some("hello"));
        assert_eq!(event.field("content.info.mimetype"), Some("text/plain"));
        assert_eq!(event.field("content.size"), None);
        assert_eq!(event.field("content.missing"), None);
        assert_eq!(event.field("state_key"), None);
        assert_eq!(event.field("unsigned"), None);
    }

    #[test]
    fn test_display_name() {
        let member = RoomEvent::new(
            "$m",
            "!room",
            "@bob:test",
            MEMBER_EVENT_TYPE,
            json!({"membership": "join", "displayname": "Bob"}),
        )
        .with_state_key("@bob:test");
        assert_eq!(member.display_name(), Some("Bob"));
        assert_eq!(
            member.state_slot(),
            Some((MEMBER_EVENT_TYPE.to_string(), "@bob:test".to_string()))
        );

        let empty = RoomEvent::new(
            "$m2",
            "!room",
            "@carol:test",
            MEMBER_EVENT_TYPE,
            json!({"membership": "join", "displayname": ""}),
        )
        .with_state_key("@carol:test");
        assert_eq!(empty.display_name(), None);

        let topic = RoomEvent::new("$t", "!room", "@bob:test", "m.room.topic", json!({"displayname": "x"}))
            .with_state_key("");
        assert_eq!(topic.display_name(), None);
    }
}
