//! Session registry
//!
//! One session per room. The manager creates sessions on demand, routes
//! incoming offers to them and fans every session's events out to the
//! presentation layer through a broadcast channel.

use super::description::{SdpType, SessionDescription};
use super::endpoint::EndpointFactory;
use super::media::{CallKind, MediaProvider, TrackKind};
use super::peer::{PeerSession, SessionHandle};
use super::room::{PeerId, PeerRole, RoomId};
use super::state::ConnectionState;
use super::SessionError;
use crate::config::SessionConfig;
use crate::control::ControlEvent;
use crate::signaling::{ChangeCallback, RoomPaths, SignalingTransport, Subscription};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

const EVENT_CAPACITY: usize = 256;

/// Something the presentation layer may want to react to
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged { room: RoomId, state: ConnectionState },
    /// The remote peer published an offer for a room this peer answers
    IncomingOffer { room: RoomId, from: PeerId },
    ControlChannel { room: RoomId, open: bool },
    RemoteTrack { room: RoomId, id: String, kind: TrackKind },
    Control { room: RoomId, event: ControlEvent },
    Error { room: RoomId, error: SessionError },
}

impl SessionEvent {
    pub fn room(&self) -> &RoomId {
        match self {
            SessionEvent::StateChanged { room, .. }
            | SessionEvent::IncomingOffer { room, .. }
            | SessionEvent::ControlChannel { room, .. }
            | SessionEvent::RemoteTrack { room, .. }
            | SessionEvent::Control { room, .. }
            | SessionEvent::Error { room, .. } => room,
        }
    }
}

/// Session manager
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<RoomId, SessionHandle>>>,
    config: SessionConfig,
    transport: Arc<dyn SignalingTransport>,
    endpoints: Arc<dyn EndpointFactory>,
    media: Arc<dyn MediaProvider>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        endpoints: Arc<dyn EndpointFactory>,
        media: Arc<dyn MediaProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
            transport,
            endpoints,
            media,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Existing live session for `room`, or a new idle one
    pub async fn open_session(&self, room: &RoomId, local: &PeerId) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(room) {
            if !handle.is_closed() {
                if handle.local_id() != local {
                    return Err(SessionError::InvalidRoom(format!(
                        "room {} is already open for {}",
                        room,
                        handle.local_id()
                    )));
                }
                return Ok(handle.clone());
            }
            debug!("Replacing ended session for room {}", room);
        }

        let (session, rx) = PeerSession::new(
            room.clone(),
            local.clone(),
            self.config.clone(),
            self.transport.clone(),
            self.endpoints.clone(),
            self.events.clone(),
        )?;
        let handle = session.spawn(rx);
        info!("Opened session {} as {} ({})", room, local, handle.role());
        sessions.insert(room.clone(), handle.clone());
        Ok(handle)
    }

    /// Close and deregister the session of `room`
    pub async fn close_session(&self, room: &RoomId) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(room)
            .ok_or_else(|| SessionError::SessionNotFound(room.to_string()))?;
        handle.close().await;
        info!("Closed session {}", room);
        Ok(())
    }

    pub async fn get_session(&self, room: &RoomId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(room)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    /// Acquire local media, then open and start the session of `room`.
    ///
    /// Media is acquired first so a refused camera/microphone leaves no
    /// trace in the signaling store.
    pub async fn start_call(
        &self,
        room: &RoomId,
        local: &PeerId,
        kind: CallKind,
    ) -> Result<SessionHandle, SessionError> {
        let media = self.media.acquire(kind).map_err(|e| {
            warn!("Cannot start {:?} call in room {}: {}", kind, room, e);
            e
        })?;
        let handle = self.open_session(room, local).await?;
        handle.start(media).await?;
        Ok(handle)
    }

    /// Route an offer to the session of `room`, creating it if needed
    pub async fn on_incoming_offer(
        &self,
        room: &RoomId,
        local: &PeerId,
        offer: SessionDescription,
    ) -> Result<SessionHandle, SessionError> {
        if room.role_of(local)? == PeerRole::Offerer {
            let err = SessionError::UnsolicitedOffer(format!("{} offers in room {}", local, room));
            warn!("{}", err);
            let _ = self.events.send(SessionEvent::Error {
                room: room.clone(),
                error: err.clone(),
            });
            return Err(err);
        }

        let from = room.counterpart(local)?.clone();
        let handle = self.open_session(room, local).await?;
        handle.deliver_offer(offer)?;
        let _ = self.events.send(SessionEvent::IncomingOffer {
            room: room.clone(),
            from,
        });
        Ok(handle)
    }

    /// Watch the remote peer's offer path of `room` and route every offer
    /// through [`SessionManager::on_incoming_offer`]. Dropping the returned
    /// subscription stops the watch.
    pub async fn watch_incoming_offers(&self, room: &RoomId, local: &PeerId) -> Result<Subscription, SessionError> {
        let remote = room.counterpart(local)?.clone();
        let path = RoomPaths::new(room).offer(&remote);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let events = self.events.clone();
        let watched_room = room.clone();
        let on_change: ChangeCallback = Box::new(move |update| match update {
            Ok(Some(value)) => {
                let _ = tx.send(value);
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Offer watch for room {} failed: {}", watched_room, err);
                let _ = events.send(SessionEvent::Error {
                    room: watched_room.clone(),
                    error: SessionError::subscription(err),
                });
            }
        });
        let subscription = self.transport.subscribe(&path, on_change).await;

        let manager = self.clone();
        let room = room.clone();
        let local = local.clone();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                let offer = match SessionDescription::from_value(value, SdpType::Offer) {
                    Ok(offer) => offer,
                    Err(e) => {
                        warn!("Ignoring offer in room {}: {}", room, e);
                        continue;
                    }
                };
                if let Err(e) = manager.on_incoming_offer(&room, &local, offer).await {
                    warn!("Failed to route offer in room {}: {}", room, e);
                }
            }
            debug!("Offer watch for room {} ended", room);
        });

        info!("Watching {} for incoming offers", path);
        Ok(subscription)
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::media::StaticMediaProvider;
    use crate::session::simulated::SimulatedEndpointFactory;
    use crate::signaling::memory::MemoryRelay;

    fn manager(relay: &MemoryRelay, media: StaticMediaProvider) -> SessionManager {
        SessionManager::new(
            SessionConfig::default(),
            Arc::new(relay.clone()),
            Arc::new(SimulatedEndpointFactory::new("test")),
            Arc::new(media),
        )
    }

    fn room() -> RoomId {
        RoomId::for_pair(&PeerId::from("alice"), &PeerId::from("bob")).unwrap()
    }

    #[tokio::test]
    async fn test_open_session_is_per_room() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::new());
        let alice = PeerId::from("alice");

        let first = mgr.open_session(&room(), &alice).await.unwrap();
        let second = mgr.open_session(&room(), &alice).await.unwrap();
        assert_eq!(mgr.session_count().await, 1);
        assert_eq!(first.role(), PeerRole::Offerer);
        assert_eq!(second.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_close_session_deregisters() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::new());
        let handle = mgr.open_session(&room(), &PeerId::from("alice")).await.unwrap();

        mgr.close_session(&room()).await.unwrap();
        assert_eq!(mgr.session_count().await, 0);
        assert!(mgr.get_session(&room()).await.is_none());
        assert_eq!(handle.state().await, ConnectionState::Closed);

        let err = mgr.close_session(&room()).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_denied_media_aborts_before_signaling() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::denied());
        let err = mgr
            .start_call(&room(), &PeerId::from("alice"), CallKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MediaAcquisition(_)));
        assert_eq!(mgr.session_count().await, 0);
        assert!(relay.keys().is_empty());
    }

    #[tokio::test]
    async fn test_offer_to_offering_peer_is_reported() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::new());
        let mut events = mgr.subscribe_events();

        let err = mgr
            .on_incoming_offer(&room(), &PeerId::from("alice"), SessionDescription::offer("v=0", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnsolicitedOffer(_)));
        assert_eq!(mgr.session_count().await, 0);
        match events.recv().await.unwrap() {
            SessionEvent::Error { error, .. } => assert_eq!(error, err),
            other => panic!("Expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_incoming_offer_creates_answering_session() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::new());
        let bob = PeerId::from("bob");

        let handle = mgr
            .on_incoming_offer(&room(), &bob, SessionDescription::offer("v=0", 0))
            .await
            .unwrap();
        assert_eq!(handle.role(), PeerRole::Answerer);
        assert_eq!(mgr.session_count().await, 1);
        assert_eq!(handle.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_room_is_bound_to_its_local_peer() {
        let relay = MemoryRelay::new();
        let mgr = manager(&relay, StaticMediaProvider::new());
        mgr.open_session(&room(), &PeerId::from("alice")).await.unwrap();
        let err = mgr.open_session(&room(), &PeerId::from("bob")).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoom(_)));
    }
}
