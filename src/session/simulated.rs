//! In-process simulated endpoint
//!
//! Behaves like a peer connection without touching the network: it produces
//! SDP text, emits host candidates after each local description, refuses
//! candidates before a remote description exists, and reports `Connected`
//! once it holds a remote description and at least one remote candidate.
//! Every call is recorded so the negotiation can be inspected afterwards.

use super::description::{IceCandidateMessage, SdpType, SessionDescription};
use super::endpoint::{EndpointEvent, EndpointEvents, EndpointFactory, MediaEndpoint};
use super::media::{LocalMedia, LocalTrack, TrackKind};
use super::state::RawConnectionState;
use super::SessionError;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

const CONTROL_MARKER: &str = "a=x-control:";

/// Knobs shared by every endpoint a factory builds
#[derive(Debug, Clone)]
pub struct SimulatedOptions {
    /// Host candidates emitted after each local description
    pub candidates_per_description: usize,
    /// Report connected on its own once negotiation has converged
    pub auto_connect: bool,
    /// ICE gathering never completes
    pub stall_gathering: bool,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            candidates_per_description: 1,
            auto_connect: true,
            stall_gathering: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<LocalTrack>,
    applied_candidates: Vec<IceCandidateMessage>,
    replaced_tracks: Vec<LocalTrack>,
    channel_label: Option<String>,
    channel_open: bool,
    sent: Vec<String>,
    connected: bool,
    close_calls: usize,
}

pub struct SimulatedEndpoint {
    name: String,
    events: EndpointEvents,
    options: SimulatedOptions,
    state: Mutex<SimulatedState>,
}

impl SimulatedEndpoint {
    pub fn new(name: impl Into<String>, events: EndpointEvents, options: SimulatedOptions) -> Self {
        Self {
            name: name.into(),
            events,
            options,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    /// Inject a raw connection state, as the media layer would
    pub fn emit_state(&self, state: RawConnectionState) {
        self.events.emit(EndpointEvent::ConnectionState(state));
    }

    /// Inject any endpoint event
    pub fn emit(&self, event: EndpointEvent) {
        self.events.emit(event);
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidateMessage> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().tracks.clone()
    }

    pub fn replaced_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().replaced_tracks.clone()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    fn describe(&self, sdp_type: SdpType) -> Result<String, SessionError> {
        let mut state = self.state.lock();
        if state.close_calls > 0 {
            return Err(SessionError::Endpoint("endpoint closed".to_string()));
        }
        if sdp_type == SdpType::Answer && state.remote.is_none() {
            return Err(SessionError::Endpoint("cannot answer without a remote offer".to_string()));
        }
        let mut sdp = format!(
            "v=0\r\no={} {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.name,
            self.generation()
        );
        for track in &state.tracks {
            let media = match track.kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=msid:- {}\r\n", media, track.id));
        }
        if let Some(ref label) = state.channel_label {
            sdp.push_str(&format!("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n{}{}\r\n", CONTROL_MARKER, label));
        }
        state.local = Some(SessionDescription {
            sdp_type,
            sdp: sdp.clone(),
            epoch: 0,
        });
        drop(state);

        for n in 0..self.options.candidates_per_description {
            let candidate = IceCandidateMessage::new(
                format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", n + 1, 50000 + n),
                Some("0".to_string()),
                Some(0),
            );
            self.events.emit(EndpointEvent::LocalCandidate(candidate));
        }
        Ok(sdp)
    }

    fn maybe_connect(&self) {
        if !self.options.auto_connect {
            return;
        }
        let open_channel = {
            let mut state = self.state.lock();
            let ready = state.local.is_some()
                && state.remote.is_some()
                && !state.applied_candidates.is_empty()
                && !state.connected
                && state.close_calls == 0;
            if !ready {
                return;
            }
            state.connected = true;
            if state.channel_label.is_some() {
                state.channel_open = true;
            }
            state.channel_open
        };
        debug!("simulated endpoint {} connected", self.name);
        self.events.emit(EndpointEvent::ConnectionState(RawConnectionState::Connecting));
        self.events.emit(EndpointEvent::ConnectionState(RawConnectionState::Connected));
        if open_channel {
            self.events.emit(EndpointEvent::ControlChannelOpen);
        }
    }
}

#[async_trait]
impl MediaEndpoint for SimulatedEndpoint {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), SessionError> {
        self.state.lock().tracks.extend(media.tracks.iter().cloned());
        Ok(())
    }

    async fn open_control_channel(&self, label: &str) -> Result<(), SessionError> {
        self.state.lock().channel_label = Some(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, SessionError> {
        self.describe(SdpType::Offer)
    }

    async fn create_answer(&self) -> Result<String, SessionError> {
        let sdp = self.describe(SdpType::Answer)?;
        self.maybe_connect();
        Ok(sdp)
    }

    async fn gathering_complete(&self) {
        if self.options.stall_gathering {
            futures::future::pending::<()>().await;
        }
    }

    async fn local_sdp(&self) -> Option<String> {
        self.state.lock().local.as_ref().map(|d| d.sdp.clone())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.remote.is_some() {
                return Err(SessionError::Endpoint("remote description already set".to_string()));
            }
            if let Some(line) = desc.sdp.lines().find(|l| l.starts_with(CONTROL_MARKER)) {
                state.channel_label = Some(line[CONTROL_MARKER.len()..].to_string());
            }
            state.remote = Some(desc.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateMessage) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            if state.remote.is_none() {
                return Err(SessionError::Endpoint(
                    "candidate added before remote description".to_string(),
                ));
            }
            state.applied_candidates.push(candidate.clone());
        }
        self.maybe_connect();
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if state.close_calls > 0 {
            return Err(SessionError::Endpoint("endpoint closed".to_string()));
        }
        state.replaced_tracks.push(track.clone());
        Ok(())
    }

    fn control_channel_open(&self) -> bool {
        self.state.lock().channel_open
    }

    async fn send_control(&self, text: String) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if !state.channel_open {
            return Err(SessionError::Endpoint("control channel not open".to_string()));
        }
        state.sent.push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        state.close_calls += 1;
        state.channel_open = false;
        state.connected = false;
        Ok(())
    }
}

/// Factory keeping every endpoint it built, newest last
#[derive(Default)]
pub struct SimulatedEndpointFactory {
    name: String,
    options: SimulatedOptions,
    created: Mutex<Vec<Arc<SimulatedEndpoint>>>,
}

impl SimulatedEndpointFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, SimulatedOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: SimulatedOptions) -> Self {
        Self {
            name: name.into(),
            options,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn endpoints(&self) -> Vec<Arc<SimulatedEndpoint>> {
        self.created.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<SimulatedEndpoint>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl EndpointFactory for SimulatedEndpointFactory {
    async fn create(&self, events: EndpointEvents) -> Result<Arc<dyn MediaEndpoint>, SessionError> {
        let endpoint = Arc::new(SimulatedEndpoint::new(self.name.clone(), events, self.options.clone()));
        self.created.lock().push(endpoint.clone());
        Ok(endpoint)
    }
}
