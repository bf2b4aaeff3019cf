//! Negotiation payloads stored on the signaling transport

use super::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// One half of the offer/answer exchange. Never mutated once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    /// Negotiation epoch; bumped on every reconnect
    #[serde(default)]
    pub epoch: u32,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>, epoch: u32) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
            epoch,
        }
    }

    pub fn answer(sdp: impl Into<String>, epoch: u32) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
            epoch,
        }
    }

    pub fn to_value(&self) -> Result<Value, SessionError> {
        serde_json::to_value(self)
            .map_err(|e| SessionError::Endpoint(format!("Failed to serialize description: {}", e)))
    }

    /// Parse a stored value, checking it is of the expected kind
    pub fn from_value(value: Value, expected: SdpType) -> Result<Self, SessionError> {
        let desc: SessionDescription = serde_json::from_value(value)
            .map_err(|e| SessionError::Endpoint(format!("Invalid session description: {}", e)))?;
        if desc.sdp_type != expected {
            return Err(SessionError::Endpoint(format!(
                "Expected {:?} description, got {:?}",
                expected, desc.sdp_type
            )));
        }
        Ok(desc)
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateMessage {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// Epoch of the endpoint that gathered this candidate
    #[serde(default)]
    pub epoch: u32,
}

impl IceCandidateMessage {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mline_index,
            sdp_mid,
            epoch: 0,
        }
    }

    pub fn with_epoch(mut self, epoch: u32) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn to_value(&self) -> Result<Value, SessionError> {
        serde_json::to_value(self)
            .map_err(|e| SessionError::Endpoint(format!("Failed to serialize candidate: {}", e)))
    }

    pub fn from_value(value: Value) -> Result<Self, SessionError> {
        serde_json::from_value(value)
            .map_err(|e| SessionError::Endpoint(format!("Invalid ICE candidate: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_description_wire_shape() {
        let value = SessionDescription::offer("v=0", 2).to_value().unwrap();
        assert_eq!(value, json!({"type": "offer", "sdp": "v=0", "epoch": 2}));
    }

    #[test]
    fn test_description_without_epoch_defaults_to_zero() {
        let desc = SessionDescription::from_value(json!({"type": "answer", "sdp": "v=0"}), SdpType::Answer).unwrap();
        assert_eq!(desc.epoch, 0);
    }

    #[test]
    fn test_description_kind_mismatch() {
        let err = SessionDescription::from_value(json!({"type": "answer", "sdp": "v=0"}), SdpType::Offer);
        assert!(err.is_err());
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidateMessage::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMLineIndex": 0,
            "sdpMid": "0"
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.epoch, 0);
    }
}
