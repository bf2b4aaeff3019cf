//! End-to-end negotiation between two session managers sharing one relay

use pairlink_core::control::{ControlEvent, RemoteDesktopEvent};
use pairlink_core::session::simulated::SimulatedEndpointFactory;
use pairlink_core::session::{
    CallKind, ConnectionState, EndpointEvent, LocalTrack, PeerId, PeerRole, RoomId, SessionError, SessionEvent,
    SessionHandle, SessionManager, StaticMediaProvider, TrackSource,
};
use pairlink_core::signaling::MemoryRelay;
use pairlink_core::SessionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    id: PeerId,
    manager: SessionManager,
    endpoints: Arc<SimulatedEndpointFactory>,
}

impl Peer {
    fn new(name: &str, relay: &MemoryRelay) -> Self {
        Self::with_media(name, relay, StaticMediaProvider::new())
    }

    fn with_media(name: &str, relay: &MemoryRelay, media: StaticMediaProvider) -> Self {
        let endpoints = Arc::new(SimulatedEndpointFactory::new(name));
        let manager = SessionManager::new(
            SessionConfig::default(),
            Arc::new(relay.clone()),
            endpoints.clone(),
            Arc::new(media),
        );
        Self {
            id: PeerId::from(name),
            manager,
            endpoints,
        }
    }
}

async fn wait_for(handle: &SessionHandle, wanted: ConnectionState) {
    let poll = async {
        while handle.state().await != wanted {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll)
        .await
        .unwrap_or_else(|_| panic!("{} never reached {}", handle.room(), wanted));
}

async fn next_control(events: &mut broadcast::Receiver<SessionEvent>) -> ControlEvent {
    let wait = async {
        loop {
            if let Ok(SessionEvent::Control { event, .. }) = events.recv().await {
                return event;
            }
        }
    };
    tokio::time::timeout(WAIT, wait).await.expect("no control event")
}

fn deliver_last_sent(from: &Peer, to: &Peer) {
    let text = from
        .endpoints
        .latest()
        .and_then(|e| e.sent_messages().pop())
        .expect("nothing sent");
    to.endpoints
        .latest()
        .expect("no endpoint")
        .emit(EndpointEvent::ControlMessage(text));
}

#[test]
fn test_roles_are_complementary() {
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");
    assert_eq!(PeerRole::for_pair(&a, &b), PeerRole::Offerer);
    assert_eq!(PeerRole::for_pair(&b, &a), PeerRole::Answerer);
    assert_eq!(RoomId::for_pair(&a, &b).unwrap(), RoomId::for_pair(&b, &a).unwrap());
}

#[tokio::test]
async fn test_call_connects_and_carries_control_events() {
    let relay = MemoryRelay::new();
    let alice = Peer::new("alice", &relay);
    let bob = Peer::new("bob", &relay);
    let room = RoomId::for_pair(&alice.id, &bob.id).unwrap();

    let mut alice_events = alice.manager.subscribe_events();
    let mut bob_events = bob.manager.subscribe_events();

    let caller = alice.manager.start_call(&room, &alice.id, CallKind::Video).await.unwrap();
    let callee = bob.manager.start_call(&room, &bob.id, CallKind::Video).await.unwrap();
    wait_for(&caller, ConnectionState::Connected).await;
    wait_for(&callee, ConnectionState::Connected).await;

    let snapshot = caller.snapshot().await.unwrap();
    assert_eq!(snapshot.role, PeerRole::Offerer);
    assert!(snapshot.has_local_description && snapshot.has_remote_description);
    assert_eq!(snapshot.pending_candidates, 0);
    assert!(snapshot.control_channel_open);

    let click = ControlEvent::remote_desktop(RemoteDesktopEvent::click(4.0, 2.0));
    assert!(caller.send_control_event(click.clone()).await);
    deliver_last_sent(&alice, &bob);
    assert_eq!(next_control(&mut bob_events).await, click);

    let moved = ControlEvent::remote_desktop(RemoteDesktopEvent::mouse_move(1.0, 1.0));
    assert!(callee.send_control_event(moved.clone()).await);
    deliver_last_sent(&bob, &alice);
    assert_eq!(next_control(&mut alice_events).await, moved);

    alice.manager.shutdown().await;
    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_answerer_started_first_still_connects() {
    let relay = MemoryRelay::new();
    let alice = Peer::new("alice", &relay);
    let bob = Peer::new("bob", &relay);
    let room = RoomId::for_pair(&alice.id, &bob.id).unwrap();

    let callee = bob.manager.start_call(&room, &bob.id, CallKind::Audio).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(callee.state().await, ConnectionState::Negotiating);

    let caller = alice.manager.start_call(&room, &alice.id, CallKind::Audio).await.unwrap();
    wait_for(&caller, ConnectionState::Connected).await;
    wait_for(&callee, ConnectionState::Connected).await;
}

#[tokio::test]
async fn test_screen_share_swap_and_closed_rejection() {
    let relay = MemoryRelay::new();
    let alice = Peer::new("alice", &relay);
    let bob = Peer::new("bob", &relay);
    let room = RoomId::for_pair(&alice.id, &bob.id).unwrap();

    let caller = alice.manager.start_call(&room, &alice.id, CallKind::Video).await.unwrap();
    let callee = bob.manager.start_call(&room, &bob.id, CallKind::Video).await.unwrap();
    wait_for(&caller, ConnectionState::Connected).await;
    wait_for(&callee, ConnectionState::Connected).await;

    caller.replace_outgoing_video_track(LocalTrack::screen()).await.unwrap();
    let endpoint = alice.endpoints.latest().unwrap();
    assert_eq!(endpoint.replaced_tracks().len(), 1);
    assert_eq!(endpoint.replaced_tracks()[0].source, TrackSource::Screen);

    caller.close().await;
    caller.close().await;
    assert_eq!(endpoint.close_calls(), 1);
    assert_eq!(caller.state().await, ConnectionState::Closed);

    let err = caller.replace_outgoing_video_track(LocalTrack::camera()).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidState(_) | SessionError::SessionGone));
    assert_eq!(endpoint.replaced_tracks().len(), 1);

    bob.manager.shutdown().await;
}

#[tokio::test]
async fn test_refused_media_leaves_no_signaling() {
    let relay = MemoryRelay::new();
    let alice = Peer::with_media("alice", &relay, StaticMediaProvider::denied());
    let room = RoomId::for_pair(&alice.id, &PeerId::from("bob")).unwrap();

    let err = alice.manager.start_call(&room, &alice.id, CallKind::Video).await.unwrap_err();
    assert!(matches!(err, SessionError::MediaAcquisition(_)));
    assert!(relay.keys().is_empty());
    assert_eq!(alice.manager.session_count().await, 0);
}

#[tokio::test]
async fn test_closing_clears_own_paths() {
    let relay = MemoryRelay::new();
    let alice = Peer::new("alice", &relay);
    let bob = Peer::new("bob", &relay);
    let room = RoomId::for_pair(&alice.id, &bob.id).unwrap();

    alice.manager.start_call(&room, &alice.id, CallKind::Video).await.unwrap();
    let callee = bob.manager.start_call(&room, &bob.id, CallKind::Video).await.unwrap();
    wait_for(&callee, ConnectionState::Connected).await;
    assert!(relay.keys().iter().any(|k| k.ends_with("/alice")));

    alice.manager.close_session(&room).await.unwrap();
    assert!(!relay.keys().iter().any(|k| k.ends_with("/alice")));
    assert!(matches!(
        alice.manager.close_session(&room).await,
        Err(SessionError::SessionNotFound(_))
    ));

    bob.manager.shutdown().await;
}
