//! Fan-out hub for dashboard subscribers.
//!
//! Producers (the push endpoint, the file reconciler, the upstream poller)
//! hand the hub a message kind and a JSON payload; the hub serializes the
//! envelope once and forwards it to every connected subscriber. Delivery is
//! best-effort: a subscriber whose queue is full misses that message, and a
//! subscriber whose channel is closed is dropped from the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// Outbound queue depth per subscriber. Slow consumers drop messages rather
/// than stalling the producers.
const SUBSCRIBER_QUEUE: usize = 64;

#[derive(Default)]
pub struct Hub {
    counter: AtomicU64,
    subscribers: RwLock<HashMap<u64, mpsc::Sender<String>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its id plus the receiving end of
    /// its queue.
    pub async fn connect(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers.write().await.insert(id, tx);
        debug!(event = "hub_connect", conn_id = id);
        (id, rx)
    }

    /// Removes a subscriber. Safe to call more than once.
    pub async fn disconnect(&self, id: u64) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!(event = "hub_disconnect", conn_id = id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Queues a message for one subscriber. Returns false when the
    /// subscriber is gone or its queue is full.
    pub async fn send_to(&self, id: u64, message: String) -> bool {
        let subscribers = self.subscribers.read().await;
        match subscribers.get(&id) {
            Some(tx) => tx.try_send(message).is_ok(),
            None => false,
        }
    }

    /// Broadcasts `{"type": kind, "data": data}` to all subscribers.
    pub async fn broadcast(&self, kind: &str, data: Value) {
        let envelope = json!({ "type": kind, "data": data });
        self.broadcast_raw(envelope.to_string()).await;
    }

    /// Broadcasts an already-serialized message.
    pub async fn broadcast_raw(&self, message: String) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, tx) in subscribers.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(event = "hub_queue_full", conn_id = *id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
                debug!(event = "hub_reap", conn_id = id);
            }
        }
    }
}
