//! In-process key-value relay
//!
//! Values live in a map behind a mutex. Watchers are called synchronously
//! from the writer's context after the lock is released, so callbacks may
//! freely call back into the relay.

use super::{ChangeCallback, SignalingTransport, Subscription, TransportError};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Watcher = Arc<ChangeCallback>;

#[derive(Default)]
struct RelayState {
    values: HashMap<String, Value>,
    watchers: HashMap<String, Vec<(u64, Watcher)>>,
    denied_prefixes: Vec<String>,
}

/// Shared in-memory signaling store
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value at `path`
    pub fn get(&self, path: &str) -> Option<Value> {
        self.state.lock().values.get(path).cloned()
    }

    /// Number of live watchers on `path`
    pub fn watcher_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .watchers
            .get(path)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Number of live watchers on all paths
    pub fn total_watchers(&self) -> usize {
        self.state.lock().watchers.values().map(|w| w.len()).sum()
    }

    /// Paths holding a value, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().values.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reject writes and clears under `prefix` (models store permission rules)
    pub fn deny_writes(&self, prefix: impl Into<String>) {
        self.state.lock().denied_prefixes.push(prefix.into());
    }

    /// Synchronous write used by both the async trait and the relay server
    pub fn put_value(&self, path: &str, value: Value) -> Result<(), TransportError> {
        let watchers = {
            let mut state = self.state.lock();
            check_writable(&state, path)?;
            state.values.insert(path.to_string(), value.clone());
            snapshot_watchers(&state, path)
        };
        debug!("relay put {} ({} watchers)", path, watchers.len());
        for watcher in watchers {
            watcher(Ok(Some(value.clone())));
        }
        Ok(())
    }

    pub fn clear_value(&self, path: &str) -> Result<(), TransportError> {
        let watchers = {
            let mut state = self.state.lock();
            check_writable(&state, path)?;
            if state.values.remove(path).is_none() {
                return Ok(());
            }
            snapshot_watchers(&state, path)
        };
        debug!("relay clear {} ({} watchers)", path, watchers.len());
        for watcher in watchers {
            watcher(Ok(None));
        }
        Ok(())
    }

    /// Register a watcher and deliver the current value to it
    pub fn watch(&self, path: &str, on_change: ChangeCallback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let watcher: Watcher = Arc::new(on_change);
        let current = {
            let mut state = self.state.lock();
            state
                .watchers
                .entry(path.to_string())
                .or_default()
                .push((id, watcher.clone()));
            state.values.get(path).cloned()
        };
        watcher(Ok(current));

        let state = Arc::downgrade(&self.state);
        let owned_path = path.to_string();
        Subscription::new(path, move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut state = state.lock();
            if let Some(list) = state.watchers.get_mut(&owned_path) {
                list.retain(|(watcher_id, _)| *watcher_id != id);
                if list.is_empty() {
                    state.watchers.remove(&owned_path);
                }
            } else {
                warn!("relay watcher {} on {} already gone", id, owned_path);
            }
        })
    }
}

fn check_writable(state: &RelayState, path: &str) -> Result<(), TransportError> {
    if path.is_empty() {
        return Err(TransportError::WriteRejected("empty path".to_string()));
    }
    if let Some(prefix) = state.denied_prefixes.iter().find(|p| path.starts_with(p.as_str())) {
        return Err(TransportError::WriteRejected(format!(
            "permission denied for {} (rule {})",
            path, prefix
        )));
    }
    Ok(())
}

fn snapshot_watchers(state: &RelayState, path: &str) -> Vec<Watcher> {
    state
        .watchers
        .get(path)
        .map(|list| list.iter().map(|(_, w)| w.clone()).collect())
        .unwrap_or_default()
}

#[async_trait]
impl SignalingTransport for MemoryRelay {
    async fn put(&self, path: &str, value: Value) -> Result<(), TransportError> {
        self.put_value(path, value)
    }

    async fn subscribe(&self, path: &str, on_change: ChangeCallback) -> Subscription {
        self.watch(path, on_change)
    }

    async fn clear(&self, path: &str) -> Result<(), TransportError> {
        self.clear_value(path)
    }
}
