//! Relay server and WebSocket client talking over a real socket

use pairlink_core::invite::{CallInvitations, IncomingInvite, InviteOutcome, TransportSignalBus};
use pairlink_core::session::simulated::SimulatedEndpointFactory;
use pairlink_core::session::{CallKind, ConnectionState, PeerId, RoomId, SessionHandle, SessionManager, StaticMediaProvider};
use pairlink_core::signaling::relay_server::serve;
use pairlink_core::signaling::{ChangeCallback, MemoryRelay, SignalingTransport, TransportError, WsRelayClient};
use pairlink_core::SessionConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (MemoryRelay, String) {
    let relay = MemoryRelay::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/relay", listener.local_addr().unwrap());
    let served = relay.clone();
    tokio::spawn(async move {
        let _ = serve(listener, served, "/relay").await;
    });
    (relay, url)
}

async fn connect(url: &str) -> Arc<WsRelayClient> {
    Arc::new(WsRelayClient::connect(url).await.unwrap())
}

/// Let the relay register subscriptions sent just before
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn forward(tx: mpsc::UnboundedSender<Result<Option<Value>, TransportError>>) -> ChangeCallback {
    Box::new(move |update| {
        let _ = tx.send(update);
    })
}

#[tokio::test]
async fn test_put_subscribe_clear_round_trip() {
    let (relay, url) = start_relay().await;
    let writer = connect(&url).await;
    let reader = connect(&url).await;

    writer.put("rooms/a_b/offers/a", json!({"sdp": "v=0"})).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = reader.subscribe("rooms/a_b/offers/a", forward(tx)).await;
    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, Ok(Some(json!({"sdp": "v=0"}))));

    writer.put("rooms/a_b/offers/a", json!({"sdp": "v=1"})).await.unwrap();
    let second = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, Ok(Some(json!({"sdp": "v=1"}))));

    writer.clear("rooms/a_b/offers/a").await.unwrap();
    let cleared = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(cleared, Ok(None));
    assert!(relay.get("rooms/a_b/offers/a").is_none());
}

#[tokio::test]
async fn test_denied_write_is_reported() {
    let (relay, url) = start_relay().await;
    relay.deny_writes("rooms/locked");
    let client = connect(&url).await;

    let err = client.put("rooms/locked/offers/a", json!(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::WriteRejected(_)));
    assert!(relay.keys().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_releases_server_watch() {
    let (relay, url) = start_relay().await;
    let client = connect(&url).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let sub = client.subscribe("signals/incoming-call", forward(tx)).await;
    settle().await;
    assert_eq!(relay.watcher_count("signals/incoming-call"), 1);

    sub.unsubscribe();
    settle().await;
    assert_eq!(relay.watcher_count("signals/incoming-call"), 0);
}

#[tokio::test]
async fn test_invitation_over_relay() {
    let (_relay, url) = start_relay().await;
    let alice_client = connect(&url).await;
    let bob_client = connect(&url).await;
    let alice = CallInvitations::new(PeerId::from("alice"), Arc::new(TransportSignalBus::new(alice_client)));
    let bob = CallInvitations::new(PeerId::from("bob"), Arc::new(TransportSignalBus::new(bob_client)));

    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingInvite>();
    let _ringing = bob
        .on_incoming_invite(move |invite| {
            let _ = tx.send(invite);
        })
        .await;
    settle().await;

    let pending = alice.invite(&PeerId::from("bob"), CallKind::Audio).await.unwrap();
    settle().await;
    let invite = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(invite.from, PeerId::from("alice"));
    assert_eq!(invite.kind, CallKind::Audio);

    let room = bob.accept(&invite).await.unwrap();
    assert_eq!(room.as_str(), "alice_bob");
    assert_eq!(pending.await_response(WAIT).await, InviteOutcome::Accepted);
}

async fn wait_connected(handle: &SessionHandle) {
    let poll = async {
        while handle.state().await != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT, poll).await.expect("session never connected");
}

#[tokio::test]
async fn test_call_negotiates_through_relay_server() {
    let (_relay, url) = start_relay().await;
    let manager = |name: &str, client: Arc<WsRelayClient>| {
        SessionManager::new(
            SessionConfig::default(),
            client,
            Arc::new(SimulatedEndpointFactory::new(name)),
            Arc::new(StaticMediaProvider::new()),
        )
    };
    let alice_manager = manager("alice", connect(&url).await);
    let bob_manager = manager("bob", connect(&url).await);
    let alice = PeerId::from("alice");
    let bob = PeerId::from("bob");
    let room = RoomId::for_pair(&alice, &bob).unwrap();

    let callee = bob_manager.start_call(&room, &bob, CallKind::Video).await.unwrap();
    settle().await;
    let caller = alice_manager.start_call(&room, &alice, CallKind::Video).await.unwrap();

    wait_connected(&caller).await;
    wait_connected(&callee).await;
    assert_eq!(caller.snapshot().await.unwrap().epoch, 0);

    alice_manager.shutdown().await;
    bob_manager.shutdown().await;
}
