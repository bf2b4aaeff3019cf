//! pairlink - Main entry point
//!
//! Runs the signaling relay, a single peer, or a self-contained loopback call.

mod args;

use args::{Args, Mode};
use clap::Parser;
use log::{debug, error, info, warn};
use pairlink_core::config::Config;
use pairlink_core::control::{ControlEvent, RemoteDesktopEvent};
use pairlink_core::invite::{CallInvitations, IncomingInvite, InviteOutcome, MemorySignalBus, TransportSignalBus};
use pairlink_core::session::simulated::SimulatedEndpointFactory;
use pairlink_core::session::{
    CallKind, ConnectionState, EndpointEvent, EndpointFactory, LocalTrack, PeerId, RoomId, SessionEvent,
    SessionHandle, SessionManager, StaticMediaProvider,
};
use pairlink_core::signaling::relay_server::run_relay_server;
use pairlink_core::signaling::{MemoryRelay, SignalingTransport, WsRelayClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

const LOOPBACK_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so the configured level applies
    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::default(),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("PAIRLINK_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("pairlink v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = loaded {
        warn!("Failed to load config from {:?}: {}; using defaults", args.config, e);
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    match args.mode {
        Mode::Relay => run_relay(config).await,
        Mode::Peer => run_peer(&args, config).await,
        Mode::Loopback => run_loopback(config).await,
    }
}

async fn run_relay(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    tokio::select! {
        result = run_relay_server(&config.relay, relay) => result,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}

#[cfg(feature = "webrtc-endpoint")]
fn endpoint_factory(config: &Config, _name: &str) -> Arc<dyn EndpointFactory> {
    Arc::new(pairlink_core::rtc::RtcEndpointFactory::new(config.webrtc.clone()))
}

#[cfg(not(feature = "webrtc-endpoint"))]
fn endpoint_factory(_config: &Config, name: &str) -> Arc<dyn EndpointFactory> {
    warn!("Built without webrtc-endpoint; media runs on simulated endpoints");
    Arc::new(SimulatedEndpointFactory::new(name))
}

async fn run_peer(args: &Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let local = PeerId::new(args.local_id.clone().ok_or("--local-id is required in peer mode")?);
    let remote = PeerId::new(args.remote_id.clone().ok_or("--remote-id is required in peer mode")?);
    let room = RoomId::for_pair(&local, &remote)?;
    let kind = if args.audio_only { CallKind::Audio } else { CallKind::Video };

    let url = config.relay.client_url();
    info!("Connecting to relay {}", url);
    let transport: Arc<dyn SignalingTransport> = Arc::new(WsRelayClient::connect(&url).await?);

    let manager = SessionManager::new(
        config.session.clone(),
        transport.clone(),
        endpoint_factory(&config, local.as_str()),
        Arc::new(StaticMediaProvider::new()),
    );
    let invitations = CallInvitations::new(local.clone(), Arc::new(TransportSignalBus::new(transport)));
    let mut events = manager.subscribe_events();

    if args.invite {
        info!("Calling {} in room {}", remote, room);
        let pending = invitations.invite(&remote, kind).await?;
        match pending.await_response(config.invite.timeout()).await {
            InviteOutcome::Accepted => {
                manager.start_call(&room, &local, kind).await?;
            }
            outcome => {
                info!("Call to {} not established: {:?}", remote, outcome);
                return Ok(());
            }
        }
    } else {
        info!("Waiting for a call from {}", remote);
        let (tx, mut rx) = mpsc::unbounded_channel::<IncomingInvite>();
        let _ringing = invitations
            .on_incoming_invite(move |invite| {
                let _ = tx.send(invite);
            })
            .await;
        let _offers = manager.watch_incoming_offers(&room, &local).await?;

        let invite = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(invite) if invite.from == remote => break invite,
                    Some(invite) => info!("Ignoring call from {}", invite.from),
                    None => return Ok(()),
                },
                _ = signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    return Ok(());
                }
            }
        };

        let room = invitations.accept(&invite).await?;
        info!("Accepted {:?} call from {}", invite.kind, invite.from);
        manager.start_call(&room, &local, invite.kind).await?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if log_event(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Session events lagged, dropped {}", n),
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Hanging up");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// Log a session event. Returns true once the call is over.
fn log_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::StateChanged { room, state } => {
            info!("Room {} is {}", room, state);
            state.is_terminal()
        }
        SessionEvent::IncomingOffer { room, from } => {
            debug!("Offer from {} in room {}", from, room);
            false
        }
        SessionEvent::ControlChannel { room, open } => {
            info!("Control channel in room {} {}", room, if *open { "open" } else { "closed" });
            false
        }
        SessionEvent::RemoteTrack { room, id, kind } => {
            info!("Remote {:?} track {} in room {}", kind, id, room);
            false
        }
        SessionEvent::Control { room, event } => {
            info!("Control event {} in room {}: {:?}", event.event_type(), room, event);
            false
        }
        SessionEvent::Error { room, error } => {
            warn!("Room {}: {}", room, error);
            false
        }
    }
}

async fn wait_for_state(
    handle: &SessionHandle,
    wanted: ConnectionState,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let poll = async {
        loop {
            let state = handle.state().await;
            if state == wanted {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(format!("room {} ended in {}", handle.room(), state));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(format!("room {} not {} after {:?}", handle.room(), wanted, timeout).into()),
    }
}

async fn next_control_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
) -> Result<ControlEvent, Box<dyn std::error::Error>> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Control { event, .. }) => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err("session events closed"),
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err("no control event received".into()),
    }
}

/// Forward the last control message `from` sent into `to`.
///
/// Simulated endpoints have no wire between them.
fn bridge_last_control(from: &SimulatedEndpointFactory, to: &SimulatedEndpointFactory) -> bool {
    let (Some(sender), Some(receiver)) = (from.latest(), to.latest()) else {
        return false;
    };
    match sender.sent_messages().pop() {
        Some(text) => {
            receiver.emit(EndpointEvent::ControlMessage(text));
            true
        }
        None => false,
    }
}

/// Two peers in one process: invitation, negotiation, a control event each
/// way and a screen-share switch, over an in-memory relay.
async fn run_loopback(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    let bus = MemorySignalBus::new();
    let alice = PeerId::from("alice");
    let bob = PeerId::from("bob");
    let room = RoomId::for_pair(&alice, &bob)?;

    let alice_endpoints = Arc::new(SimulatedEndpointFactory::new("alice"));
    let bob_endpoints = Arc::new(SimulatedEndpointFactory::new("bob"));
    let caller = SessionManager::new(
        config.session.clone(),
        Arc::new(relay.clone()),
        alice_endpoints.clone(),
        Arc::new(StaticMediaProvider::new()),
    );
    let callee = SessionManager::new(
        config.session.clone(),
        Arc::new(relay.clone()),
        bob_endpoints.clone(),
        Arc::new(StaticMediaProvider::new()),
    );
    let caller_invites = CallInvitations::new(alice.clone(), Arc::new(bus.clone()));
    let callee_invites = CallInvitations::new(bob.clone(), Arc::new(bus.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel::<IncomingInvite>();
    let _ringing = callee_invites
        .on_incoming_invite(move |invite| {
            let _ = tx.send(invite);
        })
        .await;

    let pending = caller_invites.invite(&bob, CallKind::Video).await?;
    let invite = rx.recv().await.ok_or("invitation lost")?;
    callee_invites.accept(&invite).await?;
    let outcome = pending.await_response(config.invite.timeout()).await;
    if outcome != InviteOutcome::Accepted {
        return Err(format!("invitation ended as {:?}", outcome).into());
    }
    info!("{} accepted the call from {}", bob, alice);

    let mut callee_events = callee.subscribe_events();
    let mut caller_events = caller.subscribe_events();
    let caller_session = caller.start_call(&room, &alice, CallKind::Video).await?;
    let callee_session = callee.start_call(&room, &bob, invite.kind).await?;

    wait_for_state(&caller_session, ConnectionState::Connected, LOOPBACK_CONNECT_TIMEOUT).await?;
    wait_for_state(&callee_session, ConnectionState::Connected, LOOPBACK_CONNECT_TIMEOUT).await?;
    info!("Room {} connected", room);

    if caller_session
        .send_control_event(ControlEvent::remote_desktop(RemoteDesktopEvent::click(0.5, 0.5)))
        .await
        && bridge_last_control(&alice_endpoints, &bob_endpoints)
    {
        let event = next_control_event(&mut callee_events, LOOPBACK_CONNECT_TIMEOUT).await?;
        info!("{} received {:?}", bob, event);
    }
    if callee_session
        .send_control_event(ControlEvent::remote_desktop(RemoteDesktopEvent::mouse_move(0.1, 0.9)))
        .await
        && bridge_last_control(&bob_endpoints, &alice_endpoints)
    {
        let event = next_control_event(&mut caller_events, LOOPBACK_CONNECT_TIMEOUT).await?;
        info!("{} received {:?}", alice, event);
    }

    caller_session.replace_outgoing_video_track(LocalTrack::screen()).await?;
    info!("{} switched to screen sharing", alice);

    let snapshot = caller_session.snapshot().await?;
    info!("{} session: {:?}", alice, snapshot);

    caller.shutdown().await;
    callee.shutdown().await;
    info!("Loopback call finished");
    Ok(())
}
