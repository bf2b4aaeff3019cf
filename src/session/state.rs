//! Session lifecycle states

use serde::Serialize;
use std::fmt;

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Constructed, not started
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Transport reports connected
    Connected,
    /// Transport dropped, a reconnect is scheduled or running
    Reconnecting,
    /// Reconnect attempts exhausted (terminal)
    Failed,
    /// Torn down by the caller (terminal)
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Connection state as reported by the media layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl RawConnectionState {
    /// Whether this raw state means the path to the peer is lost
    pub fn is_lost(self) -> bool {
        matches!(self, RawConnectionState::Disconnected | RawConnectionState::Failed)
    }
}
