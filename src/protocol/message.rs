//! Relay message types.
//!
//! Defines the envelope that flows between contexts, the closed set of
//! message type tags, and the name-announcement frame a client sends when
//! it connects.
//!
//! # Format
//!
//! ```json
//! {
//!   "id": "uuid",
//!   "type": "TAB_ACTIVATED",
//!   "payload": { "tabId": 12, "windowId": 3, "url": "...", "title": "..." },
//!   "source": "background",
//!   "target": "panel",
//!   "timestamp": 1764950000000
//! }
//! ```
//!
//! The `type` field travels as a raw string so that a newer peer can send
//! tags this build does not know; unrecognized tags are still delivered to
//! wildcard subscribers. `target` is omitted for broadcasts.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::identifiers::MessageId;

use super::Context;

// ============================================================================
// MessageType
// ============================================================================

/// The closed set of message type tags.
///
/// Adding a type means extending this enumeration; inbound tags outside the
/// set reach only wildcard subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Side panel finished initializing.
    PanelReady,
    /// Content script finished initializing.
    ContentReady,
    /// The active browser tab changed.
    TabActivated,
    /// Diagnostic round-trip message.
    TestMessage,
}

impl MessageType {
    /// Returns the wire tag for this message type.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PanelReady => "PANEL_READY",
            Self::ContentReady => "CONTENT_READY",
            Self::TabActivated => "TAB_ACTIVATED",
            Self::TestMessage => "TEST_MESSAGE",
        }
    }

    /// Parses a wire tag, returning `None` for tags outside the closed set.
    #[inline]
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "PANEL_READY" => Some(Self::PanelReady),
            "CONTENT_READY" => Some(Self::ContentReady),
            "TAB_ACTIVATED" => Some(Self::TabActivated),
            "TEST_MESSAGE" => Some(Self::TestMessage),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// An immutable message value relayed between contexts.
///
/// Messages are never mutated after creation; they flow by value across the
/// transport, serialized as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique per message, generated by the sender.
    pub id: MessageId,

    /// Raw type tag. Use [`Message::message_type`] for the typed view.
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque, type-specific payload.
    #[serde(default)]
    pub payload: Value,

    /// Context tag of the sender.
    pub source: Context,

    /// Optional recipient context. Absent means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Context>,

    /// Sender-local wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Creates a new message stamped with a fresh ID and the current time.
    #[must_use]
    pub fn new(
        kind: MessageType,
        payload: Value,
        source: Context,
        target: Option<Context>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            kind: kind.as_str().to_string(),
            payload,
            source,
            target,
            timestamp: now_ms(),
        }
    }

    /// Returns the typed message type, or `None` for an unrecognized tag.
    #[inline]
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_tag(&self.kind)
    }

    /// Returns `true` if this message should be delivered in `context`.
    ///
    /// A message with no target is a broadcast and is for everyone.
    #[inline]
    #[must_use]
    pub fn is_for(&self, context: Context) -> bool {
        self.target.is_none_or(|target| target == context)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Falls back to 0 should the system clock sit before the epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Announce
// ============================================================================

/// Name-announcement frame, sent by a client as its first frame.
///
/// The hub keys its connection table by the announced name. Names combine
/// the client's context tag and its creation time to disambiguate multiple
/// simultaneous clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    /// Unique connection name, e.g. `content-1764950000000`.
    pub name: String,
}

// ============================================================================
// TabInfo
// ============================================================================

/// Payload of a `TAB_ACTIVATED` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    /// Host-assigned tab ID.
    #[serde(rename = "tabId")]
    pub tab_id: u32,

    /// Host-assigned window ID.
    #[serde(rename = "windowId")]
    pub window_id: u32,

    /// URL of the activated tab.
    pub url: String,

    /// Title of the activated tab.
    pub title: String,
}

impl From<TabInfo> for Value {
    fn from(tab: TabInfo) -> Self {
        json!({
            "tabId": tab.tab_id,
            "windowId": tab.window_id,
            "url": tab.url,
            "title": tab.title,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let message = Message::new(
            MessageType::ContentReady,
            json!({ "url": "https://x" }),
            Context::Content,
            None,
        );
        let json = serde_json::to_string(&message).expect("serialize");

        assert!(json.contains("\"type\":\"CONTENT_READY\""));
        assert!(json.contains("\"source\":\"content\""));
        // Broadcasts omit the target field entirely.
        assert!(!json.contains("target"));
    }

    #[test]
    fn test_targeted_message_roundtrip() {
        let message = Message::new(
            MessageType::TestMessage,
            Value::Null,
            Context::Background,
            Some(Context::Panel),
        );
        let json = serde_json::to_string(&message).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(back.id, message.id);
        assert_eq!(back.target, Some(Context::Panel));
        assert_eq!(back.message_type(), Some(MessageType::TestMessage));
    }

    #[test]
    fn test_unknown_tag_has_no_typed_view() {
        let json_str = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "FUTURE_THING",
            "payload": { "x": 1 },
            "source": "panel",
            "timestamp": 1764950000000
        }"#;

        let message: Message = serde_json::from_str(json_str).expect("deserialize");
        assert_eq!(message.kind, "FUTURE_THING");
        assert_eq!(message.message_type(), None);
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let json_str = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "PANEL_READY",
            "source": "panel",
            "timestamp": 1764950000000
        }"#;

        let message: Message = serde_json::from_str(json_str).expect("deserialize");
        assert_eq!(message.payload, Value::Null);
    }

    #[test]
    fn test_is_for_targeting() {
        let broadcast = Message::new(
            MessageType::TestMessage,
            Value::Null,
            Context::Content,
            None,
        );
        assert!(broadcast.is_for(Context::Panel));
        assert!(broadcast.is_for(Context::Background));

        let targeted = Message::new(
            MessageType::TestMessage,
            Value::Null,
            Context::Content,
            Some(Context::Panel),
        );
        assert!(targeted.is_for(Context::Panel));
        assert!(!targeted.is_for(Context::Background));
    }

    #[test]
    fn test_message_type_tags() {
        for kind in [
            MessageType::PanelReady,
            MessageType::ContentReady,
            MessageType::TabActivated,
            MessageType::TestMessage,
        ] {
            assert_eq!(MessageType::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::from_tag("NOPE"), None);
    }

    #[test]
    fn test_tab_info_payload_keys() {
        let tab = TabInfo {
            tab_id: 12,
            window_id: 3,
            url: "https://example.com".to_string(),
            title: "Example".to_string(),
        };

        let payload = Value::from(tab);
        assert_eq!(payload.get("tabId").and_then(Value::as_u64), Some(12));
        assert_eq!(payload.get("windowId").and_then(Value::as_u64), Some(3));
        assert_eq!(
            payload.get("url").and_then(Value::as_str),
            Some("https://example.com")
        );
    }

    #[test]
    fn test_announce_roundtrip() {
        let announce = Announce {
            name: "content-1764950000000".to_string(),
        };
        let json = serde_json::to_string(&announce).expect("serialize");
        let back: Announce = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.name, announce.name);
    }
}
