//! Relay client
//!
//! Implements [`SignalingTransport`] against a relay server. One reader task
//! dispatches `value` frames to watchers and resolves pending writes; one
//! writer task owns the socket sink.

use super::protocol::RelayFrame;
use super::{ChangeCallback, SignalingTransport, Subscription, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

/// How long a write waits for the server's ack
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingWrites = HashMap<u64, oneshot::Sender<Result<(), TransportError>>>;

#[derive(Default)]
struct ClientShared {
    pending: Mutex<PendingWrites>,
    watches: Mutex<HashMap<u64, Arc<ChangeCallback>>>,
    connected: AtomicBool,
    next_seq: AtomicU64,
    next_watch: AtomicU64,
}

/// WebSocket client for the relay server
pub struct WsRelayClient {
    url: String,
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<ClientShared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsRelayClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8787/relay`)
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("Failed to connect to {}: {}", url, e)))?;
        info!("Connected to relay at {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(ClientShared::default());
        shared.connected.store(true, Ordering::SeqCst);

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match RelayFrame::from_json(&text) {
                        Ok(frame) => dispatch_frame(&reader_shared, frame),
                        Err(e) => warn!("Dropping relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            on_disconnect(&reader_shared);
        });

        Ok(Self {
            url: url.to_string(),
            outbound,
            shared,
            reader,
            writer,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let json = frame.to_json()?;
        self.outbound
            .send(json)
            .map_err(|_| TransportError::Disconnected)
    }

    async fn write(&self, make_frame: impl FnOnce(u64) -> RelayFrame) -> Result<(), TransportError> {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(seq, tx);

        if let Err(e) = self.send(&make_frame(seq)) {
            self.shared.pending.lock().remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(WRITE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().remove(&seq);
                Err(TransportError::WriteRejected(format!(
                    "no ack from relay after {:?}",
                    WRITE_TIMEOUT
                )))
            }
        }
    }
}

fn dispatch_frame(shared: &ClientShared, frame: RelayFrame) {
    match frame {
        RelayFrame::Value { id, value, .. } => {
            let watcher = shared.watches.lock().get(&id).cloned();
            match watcher {
                Some(watcher) => watcher(Ok(value)),
                None => debug!("Value for cancelled watch {}", id),
            }
        }
        RelayFrame::Ack { seq } => {
            if let Some(tx) = shared.pending.lock().remove(&seq) {
                let _ = tx.send(Ok(()));
            }
        }
        RelayFrame::Error { seq: Some(seq), message } => {
            if let Some(tx) = shared.pending.lock().remove(&seq) {
                let _ = tx.send(Err(TransportError::WriteRejected(message)));
            }
        }
        RelayFrame::Error { seq: None, message } => {
            warn!("Relay reported error: {}", message);
        }
        other => debug!("Ignoring client-bound frame {:?}", other),
    }
}

fn on_disconnect(shared: &ClientShared) {
    shared.connected.store(false, Ordering::SeqCst);
    let pending: Vec<_> = shared.pending.lock().drain().collect();
    for (_, tx) in pending {
        let _ = tx.send(Err(TransportError::Disconnected));
    }
    let watchers: Vec<_> = shared.watches.lock().values().cloned().collect();
    for watcher in watchers {
        watcher(Err(TransportError::Disconnected));
    }
    info!("Relay connection closed");
}

#[async_trait]
impl SignalingTransport for WsRelayClient {
    async fn put(&self, path: &str, value: Value) -> Result<(), TransportError> {
        let path = path.to_string();
        self.write(move |seq| RelayFrame::Put { seq, path, value }).await
    }

    async fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Subscription {
        let id = self.shared.next_watch.fetch_add(1, Ordering::Relaxed);
        self.shared.watches.lock().insert(id, Arc::new(on_change));

        let frame = RelayFrame::Subscribe {
            id,
            path: path.to_string(),
        };
        if let Err(e) = self.send(&frame) {
            let watcher = self.shared.watches.lock().remove(&id);
            if let Some(watcher) = watcher {
                watcher(Err(TransportError::SubscribeFailed(e.to_string())));
            }
            return Subscription::inert(path);
        }

        let shared = Arc::downgrade(&self.shared);
        let outbound = self.outbound.clone();
        Subscription::new(path, move || {
            if let Some(shared) = shared.upgrade() {
                shared.watches.lock().remove(&id);
            }
            if let Ok(json) = (RelayFrame::Unsubscribe { id }).to_json() {
                let _ = outbound.send(json);
            }
        })
    }

    async fn clear(&self, path: &str) -> Result<(), TransportError> {
        let path = path.to_string();
        self.write(move |seq| RelayFrame::Clear { seq, path }).await
    }
}

impl Drop for WsRelayClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
