//! Peer session negotiation and lifecycle
//!
//! This module provides:
//! - Room and role derivation for a pair of peers
//! - The per-session offer/answer/candidate state machine
//! - Candidate buffering until the remote description is set
//! - Bounded reconnection with teardown and re-offer
//! - The session registry handed to the presentation layer

pub mod candidate_buffer;
pub mod description;
pub mod endpoint;
pub mod manager;
pub mod media;
pub mod peer;
pub mod room;
pub mod simulated;
pub mod state;

pub use candidate_buffer::{CandidateBuffer, SessionId};
pub use description::{IceCandidateMessage, SdpType, SessionDescription};
pub use endpoint::{EndpointEvent, EndpointEvents, EndpointFactory, MediaEndpoint};
pub use manager::{SessionEvent, SessionManager};
pub use media::{CallKind, LocalMedia, LocalTrack, MediaProvider, StaticMediaProvider, TrackKind, TrackSource};
pub use peer::{PeerSession, SessionCommand, SessionHandle};
pub use room::{PeerId, PeerIdentity, PeerRole, RoomId};
pub use state::{ConnectionState, RawConnectionState};

use crate::control::ControlError;
use crate::signaling::TransportError;
use std::error::Error;
use std::fmt;

/// Session-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The signaling store rejected a write
    TransportWrite(String),
    /// A signaling subscription failed
    TransportSubscribe(String),
    /// ICE gathering did not complete in time
    IceGatheringTimeout,
    /// Operation not allowed in the current state
    InvalidState(String),
    /// Control message of a type this peer does not know
    UnknownEventType(String),
    /// Camera/microphone could not be acquired
    MediaAcquisition(String),
    /// Media layer failure (SDP, ICE, tracks, data channel)
    Endpoint(String),
    /// Offer received by the peer that should be offering
    UnsolicitedOffer(String),
    /// Bad peer/room combination
    InvalidRoom(String),
    /// No session registered for the room
    SessionNotFound(String),
    /// The session task has stopped
    SessionGone,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TransportWrite(msg) => write!(f, "Signaling write failed: {}", msg),
            SessionError::TransportSubscribe(msg) => write!(f, "Signaling subscribe failed: {}", msg),
            SessionError::IceGatheringTimeout => write!(f, "ICE gathering timed out"),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SessionError::UnknownEventType(kind) => write!(f, "Unknown control event type: {}", kind),
            SessionError::MediaAcquisition(msg) => write!(f, "Media acquisition failed: {}", msg),
            SessionError::Endpoint(msg) => write!(f, "Endpoint error: {}", msg),
            SessionError::UnsolicitedOffer(msg) => write!(f, "Unsolicited offer: {}", msg),
            SessionError::InvalidRoom(msg) => write!(f, "Invalid room: {}", msg),
            SessionError::SessionNotFound(room) => write!(f, "Session not found: {}", room),
            SessionError::SessionGone => write!(f, "Session task has stopped"),
        }
    }
}

impl Error for SessionError {}

impl SessionError {
    /// Error raised by a signaling watch; every transport failure there is a
    /// subscribe failure, including a dropped connection
    pub fn subscription(err: TransportError) -> Self {
        match err {
            TransportError::SubscribeFailed(msg) => SessionError::TransportSubscribe(msg),
            other => SessionError::TransportSubscribe(other.to_string()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::SubscribeFailed(msg) => SessionError::TransportSubscribe(msg),
            other => SessionError::TransportWrite(other.to_string()),
        }
    }
}

impl From<ControlError> for SessionError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::UnknownEventType(kind) => SessionError::UnknownEventType(kind),
            ControlError::Malformed(msg) => SessionError::Endpoint(format!("Malformed control message: {}", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_disconnect_is_a_subscribe_error() {
        assert!(matches!(
            SessionError::subscription(TransportError::Disconnected),
            SessionError::TransportSubscribe(_)
        ));
        assert!(matches!(
            SessionError::from(TransportError::Disconnected),
            SessionError::TransportWrite(_)
        ));
    }
}
