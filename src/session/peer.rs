//! Peer session state machine
//!
//! One `PeerSession` negotiates one room. It runs as a single task that
//! consumes a queue of [`SessionCommand`]s: signaling values forwarded from
//! subscriptions, endpoint events, reconnect timers and caller requests.
//! Everything that touches session state goes through that queue, so the
//! session itself needs no locking.
//!
//! Negotiation is split into epochs. Epoch 0 is the first offer; every
//! reconnect by the offering peer publishes an offer of the next epoch, and
//! descriptions or candidates of older epochs are ignored.

use super::candidate_buffer::{CandidateBuffer, Enqueued, SessionId};
use super::description::{IceCandidateMessage, SdpType, SessionDescription};
use super::endpoint::{EndpointEvent, EndpointEvents, EndpointFactory, MediaEndpoint};
use super::manager::SessionEvent;
use super::media::{LocalMedia, LocalTrack};
use super::room::{PeerId, PeerRole, RoomId};
use super::state::{ConnectionState, RawConnectionState};
use super::SessionError;
use crate::config::SessionConfig;
use crate::control::{ControlCodec, ControlError, ControlEvent};
use crate::signaling::{ChangeCallback, RoomPaths, SignalingTransport, Subscription, TransportError};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

/// Which remote path a signaling value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    Offer,
    Answer,
    Candidate,
}

/// Work item for a session task
#[derive(Debug)]
pub enum SessionCommand {
    Start {
        media: LocalMedia,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    /// Raw value observed on one of the remote peer's paths
    Remote { kind: RemoteKind, value: Value },
    /// Offer routed by the session manager
    RemoteOffer(SessionDescription),
    SignalingError(TransportError),
    Endpoint { generation: u64, event: EndpointEvent },
    /// Reconnect after a loss seen at `epoch`
    Reconnect { attempt: u32, epoch: u32 },
    ReconnectDeadline { attempt: u32 },
    ReplaceVideoTrack {
        track: LocalTrack,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SendControl {
        event: ControlEvent,
        reply: oneshot::Sender<bool>,
    },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
    Close { reply: oneshot::Sender<()> },
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room: RoomId,
    pub role: PeerRole,
    pub state: ConnectionState,
    pub epoch: u32,
    pub reconnect_attempts: u32,
    pub has_local_description: bool,
    pub has_remote_description: bool,
    pub pending_candidates: usize,
    pub local_tracks: Vec<LocalTrack>,
    pub control_channel_open: bool,
}

pub struct PeerSession {
    room: RoomId,
    local_id: PeerId,
    remote_id: PeerId,
    role: PeerRole,
    paths: RoomPaths,
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    endpoints: Arc<dyn EndpointFactory>,
    inbox: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,

    state: ConnectionState,
    epoch: u32,
    generation: u64,
    endpoint: Option<Arc<dyn MediaEndpoint>>,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    early_offer: Option<SessionDescription>,
    candidates: CandidateBuffer,
    local_media: Option<LocalMedia>,
    /// Video tracks swapped out by `replace_outgoing_video_track`
    replaced_tracks: Vec<LocalTrack>,
    reconnect_attempts: u32,
    loss_reported: bool,
    subscriptions: Vec<Subscription>,
    timers: Vec<JoinHandle<()>>,
    closing: Arc<Notify>,
}

impl PeerSession {
    /// Create an idle session for `local_id` in `room`.
    ///
    /// Returns the session together with the receiving end of its command
    /// queue; pass both to [`PeerSession::spawn`].
    pub fn new(
        room: RoomId,
        local_id: PeerId,
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        endpoints: Arc<dyn EndpointFactory>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionCommand>), SessionError> {
        let role = room.role_of(&local_id)?;
        let remote_id = room.counterpart(&local_id)?.clone();
        let (inbox, rx) = mpsc::unbounded_channel();

        let session = Self {
            paths: RoomPaths::new(&room),
            room,
            local_id,
            remote_id,
            role,
            config,
            transport,
            endpoints,
            inbox,
            events,
            state: ConnectionState::Idle,
            epoch: 0,
            generation: 0,
            endpoint: None,
            local_desc: None,
            remote_desc: None,
            early_offer: None,
            candidates: CandidateBuffer::new(),
            local_media: None,
            replaced_tracks: Vec::new(),
            reconnect_attempts: 0,
            loss_reported: false,
            subscriptions: Vec::new(),
            timers: Vec::new(),
            closing: Arc::new(Notify::new()),
        };
        Ok((session, rx))
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            room: self.room.clone(),
            local_id: self.local_id.clone(),
            role: self.role,
            tx: self.inbox.clone(),
            closing: self.closing.clone(),
        }
    }

    /// Run the session on its own task
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<SessionCommand>) -> SessionHandle {
        let handle = self.handle();
        tokio::spawn(self.run(rx));
        handle
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = rx.recv().await {
            if !self.handle_command(command).await {
                break;
            }
        }
        debug!("Session {} task finished", self.room);
    }

    /// Process one command. Returns false once the session has closed.
    pub async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Start { media, reply } => {
                let result = self.start(media).await;
                let _ = reply.send(result);
            }
            SessionCommand::Remote { kind, value } => self.on_remote_value(kind, value).await,
            SessionCommand::RemoteOffer(offer) => self.accept_remote_offer(offer).await,
            SessionCommand::SignalingError(err) => self.on_signaling_error(err),
            SessionCommand::Endpoint { generation, event } => self.on_endpoint_event(generation, event).await,
            SessionCommand::Reconnect { attempt, epoch } => self.on_reconnect(attempt, epoch).await,
            SessionCommand::ReconnectDeadline { attempt } => self.on_reconnect_deadline(attempt),
            SessionCommand::ReplaceVideoTrack { track, reply } => {
                let result = self.replace_outgoing_video_track(track).await;
                let _ = reply.send(result);
            }
            SessionCommand::SendControl { event, reply } => {
                let sent = self.send_control_event(&event).await;
                let _ = reply.send(sent);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Close { reply } => {
                self.close().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room: self.room.clone(),
            role: self.role,
            state: self.state,
            epoch: self.epoch,
            reconnect_attempts: self.reconnect_attempts,
            has_local_description: self.local_desc.is_some(),
            has_remote_description: self.remote_desc.is_some(),
            pending_candidates: self.candidates.pending(&self.session_id()),
            local_tracks: self
                .local_media
                .as_ref()
                .map(|m| m.tracks.clone())
                .unwrap_or_default(),
            control_channel_open: self
                .endpoint
                .as_ref()
                .map(|e| e.control_channel_open())
                .unwrap_or(false),
        }
    }

    /// Begin negotiating with `media` attached.
    ///
    /// The offering peer publishes its offer once ICE gathering completes;
    /// the answering peer watches for the remote offer.
    pub async fn start(&mut self, media: LocalMedia) -> Result<(), SessionError> {
        if self.state != ConnectionState::Idle {
            return Err(SessionError::InvalidState(format!(
                "cannot start session in state {}",
                self.state
            )));
        }

        info!(
            "Session {} starting as {} with {} local track(s)",
            self.room,
            self.role,
            media.tracks.len()
        );
        self.local_media = Some(media);
        self.set_state(ConnectionState::Negotiating);

        let result = match self.role {
            PeerRole::Offerer => self.start_offerer().await,
            PeerRole::Answerer => self.start_answerer().await,
        };
        match result {
            Err(SessionError::SessionGone) => debug!("Session {} start interrupted by close", self.room),
            Err(ref e) => self.fail(e.clone()),
            Ok(()) => {}
        }
        result
    }

    async fn start_offerer(&mut self) -> Result<(), SessionError> {
        self.publish_offer().await?;
        self.watch_remote(RemoteKind::Answer).await;
        self.watch_remote(RemoteKind::Candidate).await;
        Ok(())
    }

    async fn start_answerer(&mut self) -> Result<(), SessionError> {
        self.ensure_endpoint().await?;
        self.watch_remote(RemoteKind::Offer).await;
        self.watch_remote(RemoteKind::Candidate).await;
        if let Some(offer) = self.early_offer.take() {
            self.on_remote_offer(offer).await?;
        }
        Ok(())
    }

    /// Apply the remote offer and publish an answer
    pub async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        if self.role == PeerRole::Offerer {
            return Err(SessionError::UnsolicitedOffer(format!(
                "{} is the offering peer in room {}",
                self.local_id, self.room
            )));
        }

        match self.state {
            ConnectionState::Closed | ConnectionState::Failed => {
                debug!("Session {} ignoring offer in state {}", self.room, self.state);
                return Ok(());
            }
            ConnectionState::Idle => {
                debug!("Session {} holding offer until started", self.room);
                self.early_offer = Some(offer);
                return Ok(());
            }
            _ => {}
        }

        if offer.epoch < self.epoch || (offer.epoch == self.epoch && self.remote_desc.is_some()) {
            debug!(
                "Session {} ignoring offer of epoch {} (current epoch {})",
                self.room, offer.epoch, self.epoch
            );
            return Ok(());
        }

        if offer.epoch > self.epoch {
            info!(
                "Session {} renegotiating: offer epoch {} replaces epoch {}",
                self.room, offer.epoch, self.epoch
            );
            self.teardown_endpoint().await;
            self.begin_epoch(offer.epoch);
        }
        if self.state == ConnectionState::Connected {
            self.set_state(ConnectionState::Negotiating);
        }

        let endpoint = self.ensure_endpoint().await?;
        endpoint.set_remote_description(&offer).await?;
        self.remote_desc = Some(offer);
        self.candidates.mark_ready(&self.session_id());
        self.apply_buffered_candidates().await;

        let sdp = endpoint.create_answer().await?;
        let answer = SessionDescription::answer(sdp, self.epoch);
        let path = self.paths.answer(&self.local_id);
        self.transport.put(&path, answer.to_value()?).await?;
        info!("Session {} published answer (epoch {})", self.room, self.epoch);
        self.local_desc = Some(answer);
        Ok(())
    }

    /// Apply the remote answer to the outstanding offer
    pub async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if self.role == PeerRole::Answerer {
            return Err(SessionError::InvalidState(format!(
                "{} is the answering peer in room {}",
                self.local_id, self.room
            )));
        }
        if self.state.is_terminal() || self.state == ConnectionState::Idle {
            debug!("Session {} ignoring answer in state {}", self.room, self.state);
            return Ok(());
        }
        if answer.epoch != self.epoch || self.remote_desc.is_some() {
            debug!(
                "Session {} ignoring answer of epoch {} (current epoch {})",
                self.room, answer.epoch, self.epoch
            );
            return Ok(());
        }
        if self.local_desc.is_none() {
            debug!("Session {} ignoring answer before its offer was published", self.room);
            return Ok(());
        }

        let endpoint = self.current_endpoint()?;
        endpoint.set_remote_description(&answer).await?;
        self.remote_desc = Some(answer);
        self.candidates.mark_ready(&self.session_id());
        info!("Session {} applied answer (epoch {})", self.room, self.epoch);
        self.apply_buffered_candidates().await;
        Ok(())
    }

    /// Publish a candidate gathered by the local endpoint
    pub async fn on_local_ice_candidate(&mut self, mut candidate: IceCandidateMessage) {
        if self.state == ConnectionState::Closed {
            return;
        }
        candidate.epoch = self.epoch;
        let value = match candidate.to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!("Session {} dropping local candidate: {}", self.room, e);
                return;
            }
        };
        let path = self.paths.candidates(&self.local_id);
        if let Err(e) = self.transport.put(&path, value).await {
            warn!("Session {} failed to publish ICE candidate: {}", self.room, e);
            self.report(e.into());
        }
    }

    /// Apply a remote candidate now, or hold it until its remote
    /// description is set
    pub async fn on_remote_ice_candidate(&mut self, candidate: IceCandidateMessage) {
        if candidate.epoch < self.epoch {
            debug!(
                "Session {} dropping candidate of stale epoch {}",
                self.room, candidate.epoch
            );
            return;
        }
        let id = SessionId::new(self.room.clone(), candidate.epoch);
        match self.candidates.enqueue(&id, candidate) {
            Enqueued::Ready => self.apply_buffered_candidates().await,
            Enqueued::Buffered => debug!(
                "Session {} buffered remote candidate ({} pending)",
                id,
                self.candidates.pending(&id)
            ),
            Enqueued::Discarded => {}
        }
    }

    /// Fold a raw peer connection state into the session state
    pub fn on_connection_state_change(&mut self, raw: RawConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        debug!("Session {} peer connection state: {:?}", self.room, raw);

        match raw {
            RawConnectionState::Connected => {
                self.loss_reported = false;
                if self.state != ConnectionState::Connected {
                    if self.reconnect_attempts > 0 {
                        info!(
                            "Session {} reconnected after {} attempt(s)",
                            self.room, self.reconnect_attempts
                        );
                    }
                    self.reconnect_attempts = 0;
                    self.set_state(ConnectionState::Connected);
                }
            }
            raw if raw.is_lost() => {
                // Disconnected followed by Failed is one loss
                if self.loss_reported {
                    return;
                }
                self.loss_reported = true;
                self.on_connection_lost();
            }
            _ => {}
        }
    }

    /// Swap the outgoing video track (camera/screen) on a live call
    pub async fn replace_outgoing_video_track(&mut self, track: LocalTrack) -> Result<(), SessionError> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::InvalidState(format!(
                "cannot replace video track while {}",
                self.state
            )));
        }
        let endpoint = self.current_endpoint()?;
        endpoint.replace_video_track(&track).await?;
        info!("Session {} outgoing video now {:?} ({})", self.room, track.source, track.id);
        if let Some(ref mut media) = self.local_media {
            if let Some(previous) = media.replace_video(track) {
                self.replaced_tracks.push(previous);
            }
        }
        Ok(())
    }

    /// Send `event` on the control channel. Returns false when it was dropped.
    pub async fn send_control_event(&self, event: &ControlEvent) -> bool {
        let endpoint = match self.endpoint {
            Some(ref endpoint) if self.state != ConnectionState::Closed && endpoint.control_channel_open() => {
                endpoint.clone()
            }
            _ => {
                debug!(
                    "Session {} dropping {} event: control channel not open",
                    self.room,
                    event.event_type()
                );
                return false;
            }
        };

        let text = match ControlCodec::encode(event) {
            Ok(text) => text,
            Err(e) => {
                warn!("Session {} {}", self.room, e);
                return false;
            }
        };
        match endpoint.send_control(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Session {} failed to send control event: {}", self.room, e);
                false
            }
        }
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("Session {} closing (was {})", self.room, self.state);
        self.set_state(ConnectionState::Closed);

        for timer in self.timers.drain(..) {
            timer.abort();
        }
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        if let Some(ref media) = self.local_media {
            media.stop_all();
        }
        for track in self.replaced_tracks.drain(..) {
            track.stop();
        }
        self.teardown_endpoint().await;
        self.candidates.close_room(&self.room);

        for path in self.paths.owned_by(&self.local_id) {
            if let Err(e) = self.transport.clear(&path).await {
                warn!("Session {} failed to clear {}: {}", self.room, path, e);
            }
        }
    }

    fn session_id(&self) -> SessionId {
        SessionId::new(self.room.clone(), self.epoch)
    }

    fn current_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>, SessionError> {
        self.endpoint
            .clone()
            .ok_or_else(|| SessionError::InvalidState(format!("session {} has no endpoint", self.room)))
    }

    async fn ensure_endpoint(&mut self) -> Result<Arc<dyn MediaEndpoint>, SessionError> {
        if let Some(ref endpoint) = self.endpoint {
            return Ok(endpoint.clone());
        }

        self.generation += 1;
        self.loss_reported = false;
        let events = EndpointEvents::new(self.generation, self.inbox.clone());
        let endpoint = self.endpoints.create(events).await?;
        self.endpoint = Some(endpoint.clone());

        if let Some(ref media) = self.local_media {
            endpoint.add_local_media(media).await?;
        }
        if self.role == PeerRole::Offerer {
            endpoint
                .open_control_channel(&self.config.control_channel_label)
                .await?;
        }
        debug!(
            "Session {} created endpoint #{} for epoch {}",
            self.room, self.generation, self.epoch
        );
        Ok(endpoint)
    }

    async fn teardown_endpoint(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(e) = endpoint.close().await {
                warn!("Session {} failed to close endpoint: {}", self.room, e);
            }
        }
    }

    fn begin_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
        self.local_desc = None;
        self.remote_desc = None;
        self.candidates.retire_before(&self.room, epoch);
    }

    async fn publish_offer(&mut self) -> Result<(), SessionError> {
        let endpoint = self.ensure_endpoint().await?;
        let sdp = endpoint.create_offer().await?;

        let gathering = tokio::time::timeout(self.config.ice_gathering_timeout(), endpoint.gathering_complete());
        tokio::select! {
            gathered = gathering => {
                if gathered.is_err() {
                    warn!(
                        "Session {} ICE gathering did not complete within {:?}",
                        self.room,
                        self.config.ice_gathering_timeout()
                    );
                    return Err(SessionError::IceGatheringTimeout);
                }
            }
            _ = self.closing.notified() => {
                debug!("Session {} close requested during ICE gathering", self.room);
                return Err(SessionError::SessionGone);
            }
        }

        let sdp = endpoint.local_sdp().await.unwrap_or(sdp);
        let offer = SessionDescription::offer(sdp, self.epoch);
        let path = self.paths.offer(&self.local_id);
        self.transport.put(&path, offer.to_value()?).await?;
        info!("Session {} published offer (epoch {})", self.room, self.epoch);
        self.local_desc = Some(offer);
        Ok(())
    }

    async fn watch_remote(&mut self, kind: RemoteKind) {
        let path = match kind {
            RemoteKind::Offer => self.paths.offer(&self.remote_id),
            RemoteKind::Answer => self.paths.answer(&self.remote_id),
            RemoteKind::Candidate => self.paths.candidates(&self.remote_id),
        };
        let inbox = self.inbox.clone();
        let on_change: ChangeCallback = Box::new(move |update| {
            let command = match update {
                Ok(Some(value)) => SessionCommand::Remote { kind, value },
                Ok(None) => return,
                Err(err) => SessionCommand::SignalingError(err),
            };
            let _ = inbox.send(command);
        });
        let subscription = self.transport.subscribe(&path, on_change).await;
        debug!("Session {} watching {}", self.room, path);
        self.subscriptions.push(subscription);
    }

    async fn on_remote_value(&mut self, kind: RemoteKind, value: Value) {
        if self.state == ConnectionState::Closed {
            return;
        }
        match kind {
            RemoteKind::Offer => match SessionDescription::from_value(value, SdpType::Offer) {
                Ok(offer) => self.accept_remote_offer(offer).await,
                Err(e) => self.reject_value(e),
            },
            RemoteKind::Answer => match SessionDescription::from_value(value, SdpType::Answer) {
                Ok(answer) => {
                    if let Err(e) = self.on_remote_answer(answer).await {
                        self.negotiation_failed(e);
                    }
                }
                Err(e) => self.reject_value(e),
            },
            RemoteKind::Candidate => match IceCandidateMessage::from_value(value) {
                Ok(candidate) => self.on_remote_ice_candidate(candidate).await,
                Err(e) => self.reject_value(e),
            },
        }
    }

    async fn accept_remote_offer(&mut self, offer: SessionDescription) {
        match self.on_remote_offer(offer).await {
            Ok(()) => {}
            Err(e @ SessionError::UnsolicitedOffer(_)) | Err(e @ SessionError::InvalidState(_)) => {
                warn!("Session {} rejected offer: {}", self.room, e);
                self.report(e);
            }
            Err(e) => self.negotiation_failed(e),
        }
    }

    fn reject_value(&self, err: SessionError) {
        warn!("Session {} ignoring signaling value: {}", self.room, err);
        self.report(err);
    }

    async fn apply_buffered_candidates(&mut self) {
        let endpoint = match self.endpoint {
            Some(ref endpoint) => endpoint.clone(),
            None => return,
        };
        let pending = self.candidates.drain_if_ready(&self.session_id());
        if !pending.is_empty() {
            debug!("Session {} applying {} remote candidate(s)", self.room, pending.len());
        }
        for candidate in pending {
            if let Err(e) = endpoint.add_ice_candidate(&candidate).await {
                warn!("Session {} failed to add ICE candidate: {}", self.room, e);
            }
        }
    }

    async fn on_endpoint_event(&mut self, generation: u64, event: EndpointEvent) {
        if generation != self.generation || self.endpoint.is_none() {
            debug!(
                "Session {} ignoring event from retired endpoint #{}: {:?}",
                self.room, generation, event
            );
            return;
        }

        match event {
            EndpointEvent::LocalCandidate(candidate) => self.on_local_ice_candidate(candidate).await,
            EndpointEvent::ConnectionState(raw) => self.on_connection_state_change(raw),
            EndpointEvent::ControlChannelOpen => {
                info!("Session {} control channel open", self.room);
                self.emit(SessionEvent::ControlChannel {
                    room: self.room.clone(),
                    open: true,
                });
            }
            EndpointEvent::ControlChannelClosed => {
                info!("Session {} control channel closed", self.room);
                self.emit(SessionEvent::ControlChannel {
                    room: self.room.clone(),
                    open: false,
                });
            }
            EndpointEvent::ControlMessage(text) => self.on_control_message(&text),
            EndpointEvent::RemoteTrack { id, kind } => {
                info!("Session {} remote {:?} track {}", self.room, kind, id);
                self.emit(SessionEvent::RemoteTrack {
                    room: self.room.clone(),
                    id,
                    kind,
                });
            }
        }
    }

    fn on_control_message(&self, text: &str) {
        match ControlCodec::decode(text) {
            Ok(event) => {
                debug!("Session {} control event {}", self.room, event.event_type());
                self.emit(SessionEvent::Control {
                    room: self.room.clone(),
                    event,
                });
            }
            Err(ControlError::UnknownEventType(kind)) => {
                warn!("Session {} unknown control event type: {}", self.room, kind);
                self.report(SessionError::UnknownEventType(kind));
            }
            Err(e) => {
                warn!("Session {} {}", self.room, e);
                self.report(e.into());
            }
        }
    }

    fn on_connection_lost(&mut self) {
        self.reconnect_attempts += 1;
        let max = self.config.max_reconnect_attempts;
        if self.reconnect_attempts > max {
            error!(
                "Session {} connection lost, giving up after {} reconnect attempt(s)",
                self.room, max
            );
            self.enter_failed();
            return;
        }

        warn!(
            "Session {} connection lost, reconnect attempt {}/{} in {:?}",
            self.room,
            self.reconnect_attempts,
            max,
            self.config.reconnect_delay()
        );
        self.set_state(ConnectionState::Reconnecting);
        let attempt = self.reconnect_attempts;
        let epoch = self.epoch;
        self.schedule(self.config.reconnect_delay(), SessionCommand::Reconnect { attempt, epoch });
    }

    async fn on_reconnect(&mut self, attempt: u32, lost_epoch: u32) {
        if self.state != ConnectionState::Reconnecting || attempt != self.reconnect_attempts {
            debug!("Session {} skipping superseded reconnect attempt {}", self.room, attempt);
            return;
        }
        self.schedule(
            self.config.reconnect_timeout(),
            SessionCommand::ReconnectDeadline { attempt },
        );
        if self.epoch != lost_epoch {
            // The remote offerer already renegotiated; keep its endpoint
            info!(
                "Session {} already renegotiating at epoch {} (lost at {})",
                self.room, self.epoch, lost_epoch
            );
            return;
        }

        info!("Session {} reconnecting (attempt {})", self.room, attempt);
        self.teardown_endpoint().await;

        match self.role {
            PeerRole::Offerer => {
                let next = self.epoch + 1;
                self.begin_epoch(next);
                if let Err(e) = self.publish_offer().await {
                    self.negotiation_failed(e);
                }
            }
            PeerRole::Answerer => {
                debug!(
                    "Session {} waiting for an offer newer than epoch {}",
                    self.room, self.epoch
                );
            }
        }
    }

    fn on_reconnect_deadline(&mut self, attempt: u32) {
        if self.state == ConnectionState::Reconnecting && attempt == self.reconnect_attempts {
            warn!(
                "Session {} did not reconnect within {:?}",
                self.room,
                self.config.reconnect_timeout()
            );
            self.on_connection_lost();
        }
    }

    fn on_signaling_error(&mut self, err: TransportError) {
        let err = SessionError::subscription(err);
        match self.state {
            ConnectionState::Negotiating | ConnectionState::Reconnecting => {
                warn!("Session {} lost a signaling watch while {}: {}", self.room, self.state, err);
                self.negotiation_failed(err);
            }
            _ => {
                warn!("Session {} signaling error: {}", self.room, err);
                self.report(err);
            }
        }
    }

    fn negotiation_failed(&mut self, err: SessionError) {
        if err == SessionError::SessionGone {
            return;
        }
        if self.state == ConnectionState::Reconnecting {
            warn!("Session {} reconnect negotiation failed: {}", self.room, err);
            self.report(err);
            self.on_connection_lost();
        } else if !self.state.is_terminal() {
            self.fail(err);
        }
    }

    fn fail(&mut self, err: SessionError) {
        error!("Session {} failed: {}", self.room, err);
        self.report(err);
        self.enter_failed();
    }

    fn enter_failed(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.set_state(ConnectionState::Failed);
    }

    fn schedule(&mut self, delay: Duration, command: SessionCommand) {
        self.timers.retain(|timer| !timer.is_finished());
        let inbox = self.inbox.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(command);
        }));
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Session {} state: {} -> {}", self.room, self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged {
            room: self.room.clone(),
            state,
        });
    }

    fn report(&self, error: SessionError) {
        self.emit(SessionEvent::Error {
            room: self.room.clone(),
            error,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

/// Cloneable handle to a running session task
#[derive(Debug, Clone)]
pub struct SessionHandle {
    room: RoomId,
    local_id: PeerId,
    role: PeerRole,
    tx: mpsc::UnboundedSender<SessionCommand>,
    closing: Arc<Notify>,
}

impl SessionHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// True once the session task has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    pub async fn start(&self, media: LocalMedia) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Start { media, reply }).await?
    }

    /// Hand an offer observed elsewhere to the session
    pub fn deliver_offer(&self, offer: SessionDescription) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::RemoteOffer(offer))
            .map_err(|_| SessionError::SessionGone)
    }

    pub async fn replace_outgoing_video_track(&self, track: LocalTrack) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::ReplaceVideoTrack { track, reply })
            .await?
    }

    pub async fn send_control_event(&self, event: ControlEvent) -> bool {
        self.request(|reply| SessionCommand::SendControl { event, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Current state; a session whose task has ended reports Closed
    pub async fn state(&self) -> ConnectionState {
        self.snapshot()
            .await
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Close the session, interrupting a pending ICE gathering wait
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.closing.notify_one();
        let _ = self.request(|reply| SessionCommand::Close { reply }).await;
    }
}
