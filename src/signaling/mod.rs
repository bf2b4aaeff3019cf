//! Signaling transport
//!
//! Wraps a shared key-value store with change notification. Peer sessions
//! publish offers, answers and ICE candidates under `rooms/<roomId>/...`
//! and watch the counterpart's paths.
//!
//! - [`memory::MemoryRelay`]: in-process store
//! - [`ws_client::WsRelayClient`]: client for the relay server
//! - [`relay_server`]: axum WebSocket endpoint exposing a `MemoryRelay`

pub mod memory;
pub mod protocol;
pub mod relay_server;
pub mod ws_client;

pub use memory::MemoryRelay;
pub use ws_client::WsRelayClient;

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;

use crate::session::room::{PeerId, RoomId};

/// Callback invoked with the current value of a watched path.
///
/// `Ok(None)` means the path is absent (never written, or cleared).
pub type ChangeCallback = Box<dyn Fn(Result<Option<Value>, TransportError>) + Send + Sync>;

/// Signaling transport errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The store rejected a write (permission, quota, bad path)
    WriteRejected(String),
    /// A subscription could not be established or broke
    SubscribeFailed(String),
    /// The connection to the store is gone
    Disconnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WriteRejected(msg) => write!(f, "Write rejected: {}", msg),
            TransportError::SubscribeFailed(msg) => write!(f, "Subscribe failed: {}", msg),
            TransportError::Disconnected => write!(f, "Signaling transport disconnected"),
        }
    }
}

impl Error for TransportError {}

/// Key-value store with change notification
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Write `value` at `path`, replacing whatever was there.
    async fn put(&self, path: &str, value: Value) -> Result<(), TransportError>;

    /// Watch `path`.
    ///
    /// `on_change` runs once with the current value and again after every
    /// change until the returned [`Subscription`] is cancelled. Failures are
    /// handed to `on_change` as `Err`, never returned here.
    async fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Subscription;

    /// Delete the value at `path`.
    async fn clear(&self, path: &str) -> Result<(), TransportError>;
}

/// Handle to an active watch. Cancelled on `unsubscribe()` or drop, once.
pub struct Subscription {
    path: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(path: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            path: path.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel (the watch never started)
    pub fn inert(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cancel: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Signaling paths of one room
#[derive(Debug, Clone)]
pub struct RoomPaths {
    base: String,
}

impl RoomPaths {
    pub fn new(room: &RoomId) -> Self {
        Self {
            base: format!("rooms/{}", room),
        }
    }

    pub fn offer(&self, peer: &PeerId) -> String {
        format!("{}/offers/{}", self.base, peer)
    }

    pub fn answer(&self, peer: &PeerId) -> String {
        format!("{}/answers/{}", self.base, peer)
    }

    pub fn candidates(&self, peer: &PeerId) -> String {
        format!("{}/candidates/{}", self.base, peer)
    }

    /// Every path `peer` writes to
    pub fn owned_by(&self, peer: &PeerId) -> [String; 3] {
        [self.offer(peer), self.answer(peer), self.candidates(peer)]
    }
}
