//! Connection registry
//!
//! Every WebSocket gets a UUID and an outbound queue on registration. The
//! keepalive loop pings all connections each round; one that has not answered
//! the previous ping by the next round is terminated and unregistered.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

struct ConnectionEntry {
    sender: OutboundSender,
    alive: AtomicBool,
    terminate: Arc<Notify>,
}

/// Handle returned by [`ConnectionRegistry::register`]
pub struct ConnectionLease {
    pub id: Uuid,
    /// Notified when the registry gives up on the peer
    pub terminate: Arc<Notify>,
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            None
        }
    }
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, sender: OutboundSender) -> ConnectionLease {
        let id = Uuid::new_v4();
        let terminate = Arc::new(Notify::new());

        self.connections.write().await.insert(
            id,
            ConnectionEntry {
                sender,
                alive: AtomicBool::new(true),
                terminate: terminate.clone(),
            },
        );

        tracing::debug!("Connection {} registered", id);
        ConnectionLease { id, terminate }
    }

    pub async fn unregister(&self, id: Uuid) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            tracing::debug!("Connection {} unregistered", id);
        }
        removed
    }

    pub async fn get(&self, id: Uuid) -> Option<OutboundSender> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|entry| entry.sender.clone())
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn connection_ids(&self) -> Vec<Uuid> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Record a pong (or any sign of life) from the peer
    pub async fn mark_alive(&self, id: Uuid) {
        if let Some(entry) = self.connections.read().await.get(&id) {
            entry.alive.store(true, Ordering::SeqCst);
        }
    }

    pub async fn send_to<T: Serialize>(&self, id: Uuid, message: &T) -> bool {
        let Some(json) = encode(message) else {
            return false;
        };

        let connections = self.connections.read().await;
        match connections.get(&id) {
            Some(entry) => {
                if let Err(e) = entry.sender.send(Outbound::Text(json)) {
                    tracing::error!("Failed to send message to {}: {}", id, e);
                    return false;
                }
                true
            }
            None => {
                tracing::warn!("Send to unknown connection {}", id);
                false
            }
        }
    }

    /// Send to each of `targets` that is still registered; returns how many were reached
    pub async fn broadcast_to<T: Serialize>(&self, targets: &[Uuid], message: &T) -> usize {
        let Some(json) = encode(message) else {
            return 0;
        };

        let connections = self.connections.read().await;
        targets
            .iter()
            .filter_map(|id| connections.get(id))
            .filter(|entry| entry.sender.send(Outbound::Text(json.clone())).is_ok())
            .count()
    }

    pub async fn broadcast_all<T: Serialize>(&self, message: &T) -> usize {
        let Some(json) = encode(message) else {
            return 0;
        };

        let connections = self.connections.read().await;
        tracing::debug!("Broadcasting to {} connections", connections.len());
        connections
            .values()
            .filter(|entry| entry.sender.send(Outbound::Text(json.clone())).is_ok())
            .count()
    }

    /// One keepalive round; returns the connections that were terminated
    pub async fn keepalive_round(&self) -> Vec<Uuid> {
        let mut connections = self.connections.write().await;

        let dead: Vec<Uuid> = connections
            .iter()
            .filter(|(_, entry)| !entry.alive.swap(false, Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            if let Some(entry) = connections.remove(id) {
                tracing::info!("Connection {} missed its keepalive, terminating", id);
                let _ = entry.sender.send(Outbound::Close);
                entry.terminate.notify_one();
            }
        }

        for entry in connections.values() {
            let _ = entry.sender.send(Outbound::Ping);
        }

        dead
    }

    /// Run [`keepalive_round`](Self::keepalive_round) every `interval` until the registry is dropped
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.keepalive_round().await;
            }
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn broadcast_to_reaches_only_live_targets() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _a = registry.register(tx_a).await;
        let b = registry.register(tx_b).await;

        let reached = registry
            .broadcast_to(&[b.id, Uuid::new_v4()], &json!({"type": "hello"}))
            .await;

        assert_eq!(reached, 1);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(
            drain(&mut rx_b),
            vec![Outbound::Text(r#"{"type":"hello"}"#.to_string())]
        );
    }

    #[tokio::test]
    async fn send_to_unknown_connection_reports_failure() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to(Uuid::new_v4(), &json!({})).await);
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_on_second_keepalive_round() {
        let registry = ConnectionRegistry::new();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, mut rx_dead) = mpsc::unbounded_channel();
        let live = registry.register(tx_live).await;
        let dead = registry.register(tx_dead).await;

        assert!(registry.keepalive_round().await.is_empty());
        assert_eq!(drain(&mut rx_dead), vec![Outbound::Ping]);
        assert_eq!(drain(&mut rx_live), vec![Outbound::Ping]);

        registry.mark_alive(live.id).await;
        let terminated = registry.keepalive_round().await;

        assert_eq!(terminated, vec![dead.id]);
        assert_eq!(drain(&mut rx_dead), vec![Outbound::Close]);
        assert_eq!(drain(&mut rx_live), vec![Outbound::Ping]);
        assert_eq!(registry.connection_ids().await, vec![live.id]);

        // The terminate permit is stored even though nobody was waiting yet
        tokio::time::timeout(Duration::from_millis(100), dead.terminate.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let lease = registry.register(tx).await;

        assert!(registry.unregister(lease.id).await);
        assert!(!registry.unregister(lease.id).await);
        assert!(registry.is_empty().await);
        assert!(registry.get(lease.id).await.is_none());
    }
}
