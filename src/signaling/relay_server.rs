//! Relay server
//!
//! Exposes a [`MemoryRelay`] over WebSocket so peers on different machines
//! share one signaling store. Each connection keeps its own set of watches;
//! they are all cancelled when the socket closes.

use super::memory::MemoryRelay;
use super::protocol::RelayFrame;
use super::{ChangeCallback, Subscription};
use crate::config::RelayConfig;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Bind the configured address and serve until the listener fails
pub async fn run_relay_server(
    config: &RelayConfig,
    relay: MemoryRelay,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Relay server listening on ws://{}{}", addr, config.path);
    serve(listener, relay, &config.path).await
}

/// Serve relay connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    relay: MemoryRelay,
    path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    axum::serve(listener, router(relay, path))
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

pub fn router(relay: MemoryRelay, path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(path, get(relay_ws_handler))
        .with_state(relay)
}

async fn health_handler(State(relay): State<MemoryRelay>) -> String {
    json!({
        "status": "healthy",
        "paths": relay.keys().len(),
        "watchers": relay.total_watchers(),
        "version": env!("CARGO_PKG_VERSION"),
    })
    .to_string()
}

async fn relay_ws_handler(ws: WebSocketUpgrade, State(relay): State<MemoryRelay>) -> Response {
    ws.on_upgrade(move |socket| handle_relay_connection(socket, relay))
}

/// Handle one relay WebSocket connection
async fn handle_relay_connection(socket: WebSocket, relay: MemoryRelay) {
    info!("New relay connection established");
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut watches: HashMap<u64, Subscription> = HashMap::new();

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match RelayFrame::from_json(text.as_str()) {
                Ok(frame) => handle_frame(frame, &relay, &mut watches, &tx),
                Err(e) => {
                    warn!("Invalid relay frame: {}", e);
                    send_frame(&tx, &RelayFrame::error(None, e.to_string()));
                }
            },
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame on relay connection");
            }
            Ok(Message::Close(_)) => {
                info!("Relay connection closed");
                break;
            }
            Err(e) => {
                error!("Relay WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    let released = watches.len();
    watches.clear();
    send_task.abort();
    info!("Relay connection handler finished ({} watches released)", released);
}

fn handle_frame(
    frame: RelayFrame,
    relay: &MemoryRelay,
    watches: &mut HashMap<u64, Subscription>,
    tx: &mpsc::UnboundedSender<String>,
) {
    match frame {
        RelayFrame::Put { seq, path, value } => {
            let reply = match relay.put_value(&path, value) {
                Ok(()) => RelayFrame::Ack { seq },
                Err(e) => RelayFrame::error(Some(seq), e.to_string()),
            };
            send_frame(tx, &reply);
        }
        RelayFrame::Clear { seq, path } => {
            let reply = match relay.clear_value(&path) {
                Ok(()) => RelayFrame::Ack { seq },
                Err(e) => RelayFrame::error(Some(seq), e.to_string()),
            };
            send_frame(tx, &reply);
        }
        RelayFrame::Subscribe { id, path } => {
            let out = tx.clone();
            let watched = path.clone();
            let on_change: ChangeCallback = Box::new(move |update| {
                let frame = match update {
                    Ok(value) => RelayFrame::Value {
                        id,
                        path: watched.clone(),
                        value,
                    },
                    Err(e) => RelayFrame::error(None, e.to_string()),
                };
                send_frame(&out, &frame);
            });
            let subscription = relay.watch(&path, on_change);
            if watches.insert(id, subscription).is_some() {
                debug!("Relay watch {} replaced", id);
            }
        }
        RelayFrame::Unsubscribe { id } => {
            if watches.remove(&id).is_none() {
                debug!("Unsubscribe for unknown watch {}", id);
            }
        }
        other => {
            warn!("Unexpected frame from client: {:?}", other);
            send_frame(tx, &RelayFrame::error(None, "unexpected frame"));
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<String>, frame: &RelayFrame) {
    match frame.to_json() {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => error!("Failed to encode relay frame: {}", e),
    }
}
