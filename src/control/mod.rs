//! Control data channel codec
//!
//! Typed event envelopes carried as JSON text over the in-call data
//! channel. The `type` field selects the event; a type this peer does not
//! know is reported to the caller and the channel stays up, so a newer peer
//! can send events an older one ignores.
//!
//! - Remote desktop: `{"type":"remote-desktop","event":{"type":"mousemove","x":10,"y":20}}`
//! - Chat list sync: `{"type":"chat-list","userId":"u1","chatData":{"id":"r","participants":["u1","u2"]}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;

pub const REMOTE_DESKTOP: &str = "remote-desktop";
pub const CHAT_LIST: &str = "chat-list";

/// Control codec errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Well-formed envelope with a type this peer does not handle
    UnknownEventType(String),
    /// Not a JSON envelope, or a known type with a bad body
    Malformed(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::UnknownEventType(kind) => write!(f, "Unknown event type: {}", kind),
            ControlError::Malformed(msg) => write!(f, "Malformed control message: {}", msg),
        }
    }
}

impl Error for ControlError {}

/// Pointer action on the shared screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerAction {
    MouseMove,
    Click,
}

/// Remote-desktop input, in canvas coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDesktopEvent {
    #[serde(rename = "type")]
    pub action: PointerAction,
    pub x: f64,
    pub y: f64,
}

impl RemoteDesktopEvent {
    pub fn mouse_move(x: f64, y: f64) -> Self {
        Self {
            action: PointerAction::MouseMove,
            x,
            y,
        }
    }

    pub fn click(x: f64, y: f64) -> Self {
        Self {
            action: PointerAction::Click,
            x,
            y,
        }
    }
}

/// Summary of a chat room pushed to the other peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoomSummary {
    pub id: String,
    pub participants: Vec<String>,
    #[serde(rename = "lastMessage", default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

/// Decoded control event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    #[serde(rename = "remote-desktop")]
    RemoteDesktop { event: RemoteDesktopEvent },

    #[serde(rename = "chat-list")]
    ChatList {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "chatData")]
        chat_data: ChatRoomSummary,
    },
}

impl ControlEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ControlEvent::RemoteDesktop { .. } => REMOTE_DESKTOP,
            ControlEvent::ChatList { .. } => CHAT_LIST,
        }
    }

    pub fn remote_desktop(event: RemoteDesktopEvent) -> Self {
        ControlEvent::RemoteDesktop { event }
    }
}

/// Encoder/decoder for control channel text
pub struct ControlCodec;

impl ControlCodec {
    pub fn encode(event: &ControlEvent) -> Result<String, ControlError> {
        serde_json::to_string(event)
            .map_err(|e| ControlError::Malformed(format!("Failed to serialize {}: {}", event.event_type(), e)))
    }

    pub fn decode(text: &str) -> Result<ControlEvent, ControlError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ControlError::Malformed(format!("Invalid JSON: {}", e)))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ControlError::Malformed("missing \"type\" field".to_string()))?;

        match kind {
            REMOTE_DESKTOP | CHAT_LIST => serde_json::from_value(value.clone())
                .map_err(|e| ControlError::Malformed(format!("Invalid {} event: {}", kind, e))),
            other => Err(ControlError::UnknownEventType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_desktop_wire_format() {
        let text = ControlCodec::encode(&ControlEvent::remote_desktop(RemoteDesktopEvent::mouse_move(10.0, 20.5))).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "remote-desktop", "event": {"type": "mousemove", "x": 10.0, "y": 20.5}})
        );
    }

    #[test]
    fn test_decode_click() {
        let event = ControlCodec::decode(r#"{"type":"remote-desktop","event":{"type":"click","x":3,"y":4}}"#).unwrap();
        assert_eq!(event, ControlEvent::remote_desktop(RemoteDesktopEvent::click(3.0, 4.0)));
    }

    #[test]
    fn test_decode_chat_list() {
        let event = ControlCodec::decode(
            r#"{"type":"chat-list","userId":"u1","chatData":{"id":"room_u2","participants":["u1","u2"],"lastMessage":"hi"}}"#,
        )
        .unwrap();
        match event {
            ControlEvent::ChatList { user_id, chat_data } => {
                assert_eq!(user_id, "u1");
                assert_eq!(chat_data.participants.len(), 2);
                assert_eq!(chat_data.last_message.as_deref(), Some("hi"));
            }
            _ => panic!("Expected ChatList"),
        }
    }

    #[test]
    fn test_unknown_type_is_reported_not_malformed() {
        let err = ControlCodec::decode(r#"{"type":"whiteboard","strokes":[]}"#).unwrap_err();
        assert_eq!(err, ControlError::UnknownEventType("whiteboard".to_string()));
    }

    #[test]
    fn test_known_type_with_bad_body_is_malformed() {
        let err = ControlCodec::decode(r#"{"type":"remote-desktop","event":{"type":"scroll"}}"#).unwrap_err();
        assert!(matches!(err, ControlError::Malformed(_)));
    }

    #[test]
    fn test_non_json_is_malformed() {
        assert!(matches!(ControlCodec::decode("m,10,20"), Err(ControlError::Malformed(_))));
    }
}
