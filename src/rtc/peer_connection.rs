//! WebRTC PeerConnection endpoint
//!
//! Wraps one RTCPeerConnection as a [`MediaEndpoint`]. Handlers registered
//! on the connection forward candidates, state changes, control channel
//! traffic and remote tracks to the owning session.

use super::media_track;
use crate::config::WebRTCConfig;
use crate::session::{
    EndpointEvent, EndpointEvents, EndpointFactory, IceCandidateMessage, LocalMedia, LocalTrack, MediaEndpoint,
    RawConnectionState, SdpType, SessionDescription, SessionError, TrackKind,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<RTCPeerConnectionState> for RawConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => RawConnectionState::New,
            RTCPeerConnectionState::Connecting => RawConnectionState::Connecting,
            RTCPeerConnectionState::Connected => RawConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => RawConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => RawConnectionState::Failed,
            RTCPeerConnectionState::Closed => RawConnectionState::Closed,
        }
    }
}

/// Builds one RTCPeerConnection per negotiation
pub struct RtcEndpointFactory {
    config: WebRTCConfig,
}

impl RtcEndpointFactory {
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::Endpoint(format!("Failed to register codecs: {}", e)))?;

        // Interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::Endpoint(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.config.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl EndpointFactory for RtcEndpointFactory {
    async fn create(&self, events: EndpointEvents) -> Result<Arc<dyn MediaEndpoint>, SessionError> {
        let peer_connection = self.create_peer_connection().await?;
        Ok(Arc::new(RtcEndpoint::new(peer_connection, events)))
    }
}

pub struct RtcEndpoint {
    peer_connection: Arc<RTCPeerConnection>,
    events: EndpointEvents,
    control: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    control_open: Arc<AtomicBool>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl RtcEndpoint {
    pub fn new(peer_connection: Arc<RTCPeerConnection>, events: EndpointEvents) -> Self {
        let endpoint = Self {
            peer_connection,
            events,
            control: Arc::new(Mutex::new(None)),
            control_open: Arc::new(AtomicBool::new(false)),
            video_sender: Mutex::new(None),
            gathering: tokio::sync::Mutex::new(None),
        };
        endpoint.install_handlers();
        endpoint
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    fn install_handlers(&self) {
        let events = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("ICE gathering finished");
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            events.emit(EndpointEvent::LocalCandidate(IceCandidateMessage::new(
                                init.candidate,
                                init.sdp_mid,
                                init.sdp_mline_index,
                            )));
                        }
                        Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                info!("Peer connection state: {}", state);
                events.emit(EndpointEvent::ConnectionState(state.into()));
                Box::pin(async {})
            }));

        // The answering side receives the control channel from the offerer
        let events = self.events.clone();
        let control = self.control.clone();
        let control_open = self.control_open.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                info!("Remote data channel '{}' ({})", channel.label(), channel.id());
                wire_control_channel(&channel, events.clone(), control_open.clone());
                *control.lock() = Some(channel);
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                events.emit(EndpointEvent::RemoteTrack { id: track.id(), kind });
                Box::pin(async {})
            },
        ));
    }

    async fn describe_local(&self, sdp_type: SdpType) -> Result<String, SessionError> {
        let description = match sdp_type {
            SdpType::Offer => self.peer_connection.create_offer(None).await,
            SdpType::Answer => self.peer_connection.create_answer(None).await,
        }
        .map_err(|e| SessionError::Endpoint(format!("Failed to create {:?}: {}", sdp_type, e)))?;

        // Must be taken before the local description starts gathering
        let gather_complete = self.peer_connection.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gather_complete);

        self.peer_connection
            .set_local_description(description.clone())
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to set local description: {}", e)))?;

        Ok(description.sdp)
    }
}

fn wire_control_channel(channel: &Arc<RTCDataChannel>, events: EndpointEvents, open: Arc<AtomicBool>) {
    let (on_open_events, on_open_flag) = (events.clone(), open.clone());
    channel.on_open(Box::new(move || {
        on_open_flag.store(true, Ordering::SeqCst);
        on_open_events.emit(EndpointEvent::ControlChannelOpen);
        Box::pin(async {})
    }));

    let (on_close_events, on_close_flag) = (events.clone(), open);
    channel.on_close(Box::new(move || {
        on_close_flag.store(false, Ordering::SeqCst);
        on_close_events.emit(EndpointEvent::ControlChannelClosed);
        Box::pin(async {})
    }));

    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    events.emit(EndpointEvent::ControlMessage(text));
                }
                Err(e) => warn!("Dropping non UTF-8 control message: {}", e),
            }
        } else {
            debug!("Dropping binary control message ({} bytes)", msg.data.len());
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<(), SessionError> {
        for track in &media.tracks {
            let local = media_track::sample_track(track);
            let sender = self
                .peer_connection
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| SessionError::Endpoint(format!("Failed to add track {}: {}", track.id, e)))?;

            // Drain RTCP so the interceptors keep running
            let rtcp_sender = sender.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtcp_sender.read(&mut buf).await.is_ok() {}
            });

            if track.kind == TrackKind::Video {
                *self.video_sender.lock() = Some(sender);
            }
            debug!("Added local {:?} track {}", track.kind, track.id);
        }
        Ok(())
    }

    async fn open_control_channel(&self, label: &str) -> Result<(), SessionError> {
        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let channel = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to create data channel: {}", e)))?;
        wire_control_channel(&channel, self.events.clone(), self.control_open.clone());
        *self.control.lock() = Some(channel);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, SessionError> {
        self.describe_local(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<String, SessionError> {
        self.describe_local(SdpType::Answer).await
    }

    async fn gathering_complete(&self) {
        let receiver = self.gathering.lock().await.take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
        }
    }

    async fn local_sdp(&self) -> Option<String> {
        self.peer_connection.local_description().await.map(|d| d.sdp)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        let remote = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        }
        .map_err(|e| SessionError::Endpoint(format!("Invalid SDP {:?}: {}", desc.sdp_type, e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateMessage) -> Result<(), SessionError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), SessionError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Endpoint("no outgoing video sender".to_string()))?;
        let local = media_track::sample_track(track);
        sender
            .replace_track(Some(local as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to replace video track: {}", e)))
    }

    fn control_channel_open(&self) -> bool {
        self.control_open.load(Ordering::SeqCst)
    }

    async fn send_control(&self, text: String) -> Result<(), SessionError> {
        let channel = self
            .control
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Endpoint("no control channel".to_string()))?;
        channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Endpoint(format!("Failed to send control message: {}", e)))
    }

    async fn close(&self) -> Result<(), SessionError> {
        let channel = self.control.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("Control channel close: {}", e);
            }
        }
        self.control_open.store(false, Ordering::SeqCst);
        self.peer_connection
            .close()
            .await
            .map_err(|e| SessionError::Endpoint(format!("Failed to close connection: {}", e)))
    }
}
