//! pairlink - peer session negotiation core
//!
//! Negotiates one-to-one WebRTC calls over a shared key-value relay: room
//! and role derivation, offer/answer/candidate exchange, bounded
//! reconnection, a JSON control channel and call invitations.

pub mod config;
pub mod control;
pub mod invite;
#[cfg(feature = "webrtc-endpoint")]
pub mod rtc;
pub mod session;
pub mod signaling;

// Re-exports
pub use config::{Config, SessionConfig, WebRTCConfig};
pub use control::{ControlCodec, ControlEvent};
pub use invite::{CallInvitations, InviteOutcome};
pub use session::{ConnectionState, PeerId, PeerRole, RoomId, SessionError, SessionEvent, SessionHandle, SessionManager};
pub use signaling::{MemoryRelay, SignalingTransport, WsRelayClient};
