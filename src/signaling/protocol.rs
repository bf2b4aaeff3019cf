//! Relay wire protocol
//!
//! JSON text frames exchanged between [`super::WsRelayClient`] and the relay
//! server. Writes carry a sequence number answered by `ack` or `error`;
//! watches carry a client-chosen id echoed on every `value` frame.

use super::TransportError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    /// Write a value (client -> server)
    Put { seq: u64, path: String, value: Value },

    /// Delete a value (client -> server)
    Clear { seq: u64, path: String },

    /// Start watching a path (client -> server)
    Subscribe { id: u64, path: String },

    /// Stop watching (client -> server)
    Unsubscribe { id: u64 },

    /// Current value of a watched path (server -> client)
    Value {
        id: u64,
        path: String,
        #[serde(default)]
        value: Option<Value>,
    },

    /// Write accepted (server -> client)
    Ack { seq: u64 },

    /// Write rejected or frame not understood (server -> client)
    Error {
        #[serde(default)]
        seq: Option<u64>,
        message: String,
    },
}

impl RelayFrame {
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json)
            .map_err(|e| TransportError::SubscribeFailed(format!("Invalid relay frame: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self)
            .map_err(|e| TransportError::WriteRejected(format!("Failed to serialize frame: {}", e)))
    }

    pub fn error(seq: Option<u64>, message: impl Into<String>) -> Self {
        RelayFrame::Error {
            seq,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_put() {
        let frame = RelayFrame::from_json(
            r#"{"type":"put","seq":7,"path":"rooms/a_b/offers/a","value":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        match frame {
            RelayFrame::Put { seq, path, value } => {
                assert_eq!(seq, 7);
                assert_eq!(path, "rooms/a_b/offers/a");
                assert_eq!(value["type"], "offer");
            }
            _ => panic!("Expected Put"),
        }
    }

    #[test]
    fn test_value_without_payload_means_absent() {
        let frame = RelayFrame::from_json(r#"{"type":"value","id":3,"path":"p"}"#).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Value {
                id: 3,
                path: "p".to_string(),
                value: None
            }
        );
    }

    #[test]
    fn test_error_serialization() {
        let json = RelayFrame::error(Some(4), "permission denied").to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"type": "error", "seq": 4, "message": "permission denied"}));
    }

    #[test]
    fn test_unknown_frame_rejected() {
        assert!(RelayFrame::from_json(r#"{"type":"bogus"}"#).is_err());
    }
}
