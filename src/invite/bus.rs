//! Named-event bus carrying call invitations
//!
//! Two implementations: an in-process bus for tests and single-process
//! demos, and one that rides on a [`SignalingTransport`] by writing each
//! event to `signals/{event}`.

use super::InviteError;
use crate::signaling::{ChangeCallback, SignalingTransport, Subscription};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type SignalHandler = Box<dyn Fn(Value) + Send + Sync>;

#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Publish `payload` under `event`
    async fn emit(&self, event: &str, payload: Value) -> Result<(), InviteError>;

    /// Receive every later `event` until the subscription is dropped
    async fn on(&self, event: &str, handler: SignalHandler) -> Subscription;
}

type Handlers = HashMap<String, Vec<(u64, Arc<SignalHandler>)>>;

/// In-process bus
#[derive(Clone, Default)]
pub struct MemorySignalBus {
    handlers: Arc<Mutex<Handlers>>,
    next_id: Arc<AtomicU64>,
}

impl MemorySignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map(|l| l.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SignalBus for MemorySignalBus {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), InviteError> {
        let handlers: Vec<Arc<SignalHandler>> = self
            .handlers
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        debug!("signal {} -> {} listener(s)", event, handlers.len());
        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        let handlers = Arc::downgrade(&self.handlers);
        let owned_event = event.to_string();
        Subscription::new(event, move || {
            if let Some(handlers) = handlers.upgrade() {
                let mut handlers = handlers.lock();
                if let Some(list) = handlers.get_mut(&owned_event) {
                    list.retain(|(handler_id, _)| *handler_id != id);
                    if list.is_empty() {
                        handlers.remove(&owned_event);
                    }
                }
            }
        })
    }
}

/// Bus stored in the signaling transport.
///
/// Every emission is wrapped with a fresh id so repeating an identical
/// payload still reads as a change. The value already stored when a handler
/// subscribes is an old event and is skipped.
pub struct TransportSignalBus {
    transport: Arc<dyn SignalingTransport>,
}

impl TransportSignalBus {
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self { transport }
    }

    pub fn path(event: &str) -> String {
        format!("signals/{}", event)
    }
}

#[async_trait]
impl SignalBus for TransportSignalBus {
    async fn emit(&self, event: &str, payload: Value) -> Result<(), InviteError> {
        let envelope = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "payload": payload,
        });
        self.transport
            .put(&Self::path(event), envelope)
            .await
            .map_err(|e| InviteError::Bus(format!("Failed to emit {}: {}", event, e)))
    }

    async fn on(&self, event: &str, handler: SignalHandler) -> Subscription {
        let seen_snapshot = AtomicBool::new(false);
        let owned_event = event.to_string();
        let on_change: ChangeCallback = Box::new(move |update| {
            if !seen_snapshot.swap(true, Ordering::SeqCst) {
                return;
            }
            match update {
                Ok(Some(envelope)) => match envelope.get("payload") {
                    Some(payload) => handler(payload.clone()),
                    None => warn!("signal {} without payload", owned_event),
                },
                Ok(None) => {}
                Err(e) => warn!("signal {} subscription failed: {}", owned_event, e),
            }
        });
        self.transport.subscribe(&Self::path(event), on_change).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::memory::MemoryRelay;

    fn collector() -> (Arc<Mutex<Vec<Value>>>, SignalHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |v| sink.lock().push(v)))
    }

    #[tokio::test]
    async fn test_memory_bus_unsubscribe() {
        let bus = MemorySignalBus::new();
        let (seen, handler) = collector();
        let sub = bus.on("ping", handler).await;
        bus.emit("ping", json!(1)).await.unwrap();
        sub.unsubscribe();
        bus.emit("ping", json!(2)).await.unwrap();
        assert_eq!(*seen.lock(), vec![json!(1)]);
        assert_eq!(bus.listener_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_transport_bus_skips_stored_event() {
        let relay = MemoryRelay::new();
        let bus = TransportSignalBus::new(Arc::new(relay.clone()));
        bus.emit("ping", json!("old")).await.unwrap();

        let (seen, handler) = collector();
        let _sub = bus.on("ping", handler).await;
        bus.emit("ping", json!("new")).await.unwrap();
        bus.emit("ping", json!("new")).await.unwrap();

        assert_eq!(*seen.lock(), vec![json!("new"), json!("new")]);
        assert!(relay.get("signals/ping").is_some());
    }
}
