//! Media endpoint seam
//!
//! The peer session drives one [`MediaEndpoint`] at a time and replaces it
//! on every reconnect.
//! Endpoints report asynchronous happenings (local candidates, connection
//! state, data channel traffic, remote tracks) through [`EndpointEvents`],
//! which feeds the owning session's command queue.

use super::description::{IceCandidateMessage, SessionDescription};
use super::media::{LocalMedia, LocalTrack, TrackKind};
use super::peer::SessionCommand;
use super::state::RawConnectionState;
use super::SessionError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something the media layer reports
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// A new local ICE candidate was gathered
    LocalCandidate(IceCandidateMessage),
    /// The peer connection changed state
    ConnectionState(RawConnectionState),
    /// The control data channel can carry messages
    ControlChannelOpen,
    /// The control data channel went away
    ControlChannelClosed,
    /// Text received on the control data channel
    ControlMessage(String),
    /// The remote side started sending a track
    RemoteTrack { id: String, kind: TrackKind },
}

/// Sink handed to an endpoint at creation.
///
/// Events are tagged with the endpoint's generation so the session can drop
/// whatever a torn-down endpoint still reports.
#[derive(Debug, Clone)]
pub struct EndpointEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl EndpointEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward `event` to the session. Returns false once the session is gone.
    pub fn emit(&self, event: EndpointEvent) -> bool {
        self.tx
            .send(SessionCommand::Endpoint {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Local media/data endpoint (one peer connection)
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Attach local tracks before the first description is created
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), SessionError>;

    /// Create the control data channel (offering side only)
    async fn open_control_channel(&self, label: &str) -> Result<(), SessionError>;

    /// Create an offer and apply it as the local description. Returns the SDP.
    async fn create_offer(&self) -> Result<String, SessionError>;

    /// Create an answer and apply it as the local description. Returns the SDP.
    async fn create_answer(&self) -> Result<String, SessionError>;

    /// Resolves once ICE gathering reaches its complete state
    async fn gathering_complete(&self);

    /// Local SDP including gathered candidates, if available
    async fn local_sdp(&self) -> Option<String>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateMessage) -> Result<(), SessionError>;

    /// Swap the outgoing video track without renegotiation
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), SessionError>;

    fn control_channel_open(&self) -> bool;

    async fn send_control(&self, text: String) -> Result<(), SessionError>;

    /// Close the data channel and the connection
    async fn close(&self) -> Result<(), SessionError>;
}

/// Builds a fresh endpoint for every (re)negotiation
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    async fn create(&self, events: EndpointEvents) -> Result<Arc<dyn MediaEndpoint>, SessionError>;
}
