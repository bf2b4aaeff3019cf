//! Call invitations
//!
//! Before any media is negotiated the caller rings the callee over a
//! [`SignalBus`]:
//!
//! - `incoming-call {from, to, type}`: caller asks callee to join
//! - `call-accepted {from, to}`: callee agreed; both sides start their session
//! - `call-rejected {from, to}`: callee declined
//! - `call-cancelled {from, to}`: caller gave up, or nobody answered in time

pub mod bus;

pub use bus::{MemorySignalBus, SignalBus, SignalHandler, TransportSignalBus};

use crate::session::{CallKind, PeerId, RoomId};
use crate::signaling::Subscription;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const INCOMING_CALL: &str = "incoming-call";
pub const CALL_ACCEPTED: &str = "call-accepted";
pub const CALL_REJECTED: &str = "call-rejected";
pub const CALL_CANCELLED: &str = "call-cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteError {
    /// The bus could not deliver the event
    Bus(String),
    /// Payload could not be encoded
    Malformed(String),
    /// Caller and callee are the same peer
    InvalidPeer(String),
}

impl fmt::Display for InviteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InviteError::Bus(msg) => write!(f, "Signal bus error: {}", msg),
            InviteError::Malformed(msg) => write!(f, "Malformed invitation: {}", msg),
            InviteError::InvalidPeer(msg) => write!(f, "Invalid peer: {}", msg),
        }
    }
}

impl Error for InviteError {}

/// `incoming-call` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(rename = "type", default)]
    pub kind: CallKind,
}

/// Payload of accepted/rejected/cancelled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReply {
    pub from: PeerId,
    pub to: PeerId,
}

/// What the callee is told about a ringing call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingInvite {
    pub from: PeerId,
    pub kind: CallKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteOutcome {
    Accepted,
    Rejected,
    Cancelled,
    /// Nobody answered in time
    Expired,
}

/// Invitation endpoint of one local peer
#[derive(Clone)]
pub struct CallInvitations {
    local: PeerId,
    bus: Arc<dyn SignalBus>,
}

impl CallInvitations {
    pub fn new(local: PeerId, bus: Arc<dyn SignalBus>) -> Self {
        Self { local, bus }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Ring `to`. The returned invite already listens for the answer.
    pub async fn invite(&self, to: &PeerId, kind: CallKind) -> Result<PendingInvite, InviteError> {
        if *to == self.local {
            return Err(InviteError::InvalidPeer(format!("{} cannot call itself", to)));
        }
        let pending = self.listen(to).await;
        let request = CallRequest {
            from: self.local.clone(),
            to: to.clone(),
            kind,
        };
        self.bus.emit(INCOMING_CALL, encode(&request)?).await?;
        info!("Invited {} to a {:?} call", to, kind);
        Ok(pending)
    }

    /// Wait for `to` to answer an invitation published earlier
    pub async fn await_response(&self, to: &PeerId, timeout: Duration) -> InviteOutcome {
        self.listen(to).await.await_response(timeout).await
    }

    /// Call `handler` for every invitation addressed to this peer
    pub async fn on_incoming_invite(&self, handler: impl Fn(IncomingInvite) + Send + Sync + 'static) -> Subscription {
        let local = self.local.clone();
        self.bus
            .on(
                INCOMING_CALL,
                Box::new(move |payload| match serde_json::from_value::<CallRequest>(payload) {
                    Ok(request) if request.to == local => handler(IncomingInvite {
                        from: request.from,
                        kind: request.kind,
                    }),
                    Ok(_) => {}
                    Err(e) => warn!("Ignoring malformed {}: {}", INCOMING_CALL, e),
                }),
            )
            .await
    }

    /// Call `handler` with the caller's id when a call to this peer is
    /// withdrawn before being answered
    pub async fn on_cancelled(&self, handler: impl Fn(PeerId) + Send + Sync + 'static) -> Subscription {
        let local = self.local.clone();
        self.bus
            .on(
                CALL_CANCELLED,
                Box::new(move |payload| {
                    if let Ok(reply) = serde_json::from_value::<CallReply>(payload) {
                        if reply.to == local {
                            handler(reply.from);
                        }
                    }
                }),
            )
            .await
    }

    /// Accept `invite`; returns the room both peers negotiate in
    pub async fn accept(&self, invite: &IncomingInvite) -> Result<RoomId, InviteError> {
        let room = RoomId::for_pair(&self.local, &invite.from)
            .map_err(|e| InviteError::InvalidPeer(e.to_string()))?;
        self.reply(CALL_ACCEPTED, &invite.from).await?;
        info!("Accepted call from {} in room {}", invite.from, room);
        Ok(room)
    }

    pub async fn reject(&self, invite: &IncomingInvite) -> Result<(), InviteError> {
        self.reply(CALL_REJECTED, &invite.from).await?;
        info!("Rejected call from {}", invite.from);
        Ok(())
    }

    /// Withdraw an invitation to `to`
    pub async fn cancel(&self, to: &PeerId) -> Result<(), InviteError> {
        self.reply(CALL_CANCELLED, to).await?;
        info!("Cancelled call to {}", to);
        Ok(())
    }

    async fn reply(&self, event: &str, to: &PeerId) -> Result<(), InviteError> {
        let reply = CallReply {
            from: self.local.clone(),
            to: to.clone(),
        };
        self.bus.emit(event, encode(&reply)?).await
    }

    async fn listen(&self, to: &PeerId) -> PendingInvite {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::with_capacity(3);

        // Answers come from the callee; cancellations from this peer
        let watched = [
            (CALL_ACCEPTED, InviteOutcome::Accepted, to.clone(), self.local.clone()),
            (CALL_REJECTED, InviteOutcome::Rejected, to.clone(), self.local.clone()),
            (CALL_CANCELLED, InviteOutcome::Cancelled, self.local.clone(), to.clone()),
        ];
        for (event, outcome, from, dest) in watched {
            let tx = tx.clone();
            let handler: SignalHandler = Box::new(move |payload| {
                if let Ok(reply) = serde_json::from_value::<CallReply>(payload) {
                    if reply.from == from && reply.to == dest {
                        let _ = tx.send(outcome);
                    }
                }
            });
            subscriptions.push(self.bus.on(event, handler).await);
        }

        PendingInvite {
            local: self.local.clone(),
            to: to.clone(),
            bus: self.bus.clone(),
            outcomes: rx,
            _subscriptions: subscriptions,
        }
    }
}

/// An invitation waiting for its answer
pub struct PendingInvite {
    local: PeerId,
    to: PeerId,
    bus: Arc<dyn SignalBus>,
    outcomes: mpsc::UnboundedReceiver<InviteOutcome>,
    _subscriptions: Vec<Subscription>,
}

impl PendingInvite {
    pub fn callee(&self) -> &PeerId {
        &self.to
    }

    /// Resolve with the callee's answer, or expire after `timeout`.
    ///
    /// On expiry `call-cancelled` is published so the callee stops ringing.
    pub async fn await_response(mut self, timeout: Duration) -> InviteOutcome {
        match tokio::time::timeout(timeout, self.outcomes.recv()).await {
            Ok(Some(outcome)) => {
                debug!("Call to {} resolved: {:?}", self.to, outcome);
                outcome
            }
            Ok(None) => InviteOutcome::Cancelled,
            Err(_) => {
                info!("Call to {} not answered within {:?}", self.to, timeout);
                let reply = CallReply {
                    from: self.local.clone(),
                    to: self.to.clone(),
                };
                match encode(&reply) {
                    Ok(payload) => {
                        if let Err(e) = self.bus.emit(CALL_CANCELLED, payload).await {
                            warn!("Failed to withdraw expired call to {}: {}", self.to, e);
                        }
                    }
                    Err(e) => warn!("{}", e),
                }
                InviteOutcome::Expired
            }
        }
    }
}

fn encode<T: Serialize>(payload: &T) -> Result<Value, InviteError> {
    serde_json::to_value(payload).map_err(|e| InviteError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn peers(bus: &MemorySignalBus) -> (CallInvitations, CallInvitations) {
        (
            CallInvitations::new(PeerId::from("alice"), Arc::new(bus.clone())),
            CallInvitations::new(PeerId::from("bob"), Arc::new(bus.clone())),
        )
    }

    #[tokio::test]
    async fn test_invite_reaches_only_the_callee() {
        let bus = MemorySignalBus::new();
        let (alice, bob) = peers(&bus);
        let carol = CallInvitations::new(PeerId::from("carol"), Arc::new(bus.clone()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _bob_sub = bob.on_incoming_invite(move |invite| sink.lock().push(invite)).await;
        let carol_seen = Arc::new(Mutex::new(0));
        let carol_sink = carol_seen.clone();
        let _carol_sub = carol.on_incoming_invite(move |_| *carol_sink.lock() += 1).await;

        let _pending = alice.invite(&PeerId::from("bob"), CallKind::Audio).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![IncomingInvite {
                from: PeerId::from("alice"),
                kind: CallKind::Audio,
            }]
        );
        assert_eq!(*carol_seen.lock(), 0);
    }

    #[tokio::test]
    async fn test_accept_resolves_pending_invite() {
        let bus = MemorySignalBus::new();
        let (alice, bob) = peers(&bus);

        let pending = alice.invite(&PeerId::from("bob"), CallKind::Video).await.unwrap();
        let invite = IncomingInvite {
            from: PeerId::from("alice"),
            kind: CallKind::Video,
        };
        let room = bob.accept(&invite).await.unwrap();

        assert_eq!(room.as_str(), "alice_bob");
        assert_eq!(pending.await_response(Duration::from_secs(1)).await, InviteOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_reject_resolves_pending_invite() {
        let bus = MemorySignalBus::new();
        let (alice, bob) = peers(&bus);

        let pending = alice.invite(&PeerId::from("bob"), CallKind::Video).await.unwrap();
        bob.reject(&IncomingInvite {
            from: PeerId::from("alice"),
            kind: CallKind::Video,
        })
        .await
        .unwrap();
        assert_eq!(pending.await_response(Duration::from_secs(1)).await, InviteOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_unanswered_invite_expires_and_withdraws() {
        let bus = MemorySignalBus::new();
        let (alice, bob) = peers(&bus);

        let withdrawn = Arc::new(Mutex::new(Vec::new()));
        let sink = withdrawn.clone();
        let _sub = bob.on_cancelled(move |from| sink.lock().push(from)).await;

        let pending = alice.invite(&PeerId::from("bob"), CallKind::Video).await.unwrap();
        let outcome = pending.await_response(Duration::from_millis(20)).await;

        assert_eq!(outcome, InviteOutcome::Expired);
        assert_eq!(*withdrawn.lock(), vec![PeerId::from("alice")]);
        assert_eq!(bus.listener_count(CALL_ACCEPTED), 0);
    }

    #[tokio::test]
    async fn test_calling_yourself_is_rejected() {
        let bus = MemorySignalBus::new();
        let (alice, _) = peers(&bus);
        let err = alice.invite(&PeerId::from("alice"), CallKind::Video).await.err();
        assert!(matches!(err, Some(InviteError::InvalidPeer(_))));
    }

    #[test]
    fn test_request_wire_format() {
        let request = CallRequest {
            from: PeerId::from("alice"),
            to: PeerId::from("bob"),
            kind: CallKind::Video,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"from": "alice", "to": "bob", "type": "video"})
        );
        let legacy: CallRequest = serde_json::from_value(json!({"from": "a", "to": "b", "type": "call"})).unwrap();
        assert_eq!(legacy.kind, CallKind::Video);
    }
}
