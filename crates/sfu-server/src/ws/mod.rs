//! WebSocket signaling endpoint

pub mod connections;
pub mod dispatcher;
pub mod handler;

use crate::sfu::{ManagerEvent, SessionManager};
use connections::ConnectionRegistry;
use sfu_protocol::{NotificationType, ResponseEnvelope, SessionClosedNotification};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Forward session lifecycle events to every connected peer
pub fn spawn_event_relay(
    manager: &SessionManager,
    connections: Arc<ConnectionRegistry>,
) -> JoinHandle<()> {
    let mut events = manager.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::SessionClosed { id, reason }) => {
                    let payload = match serde_json::to_value(SessionClosedNotification {
                        session_id: id,
                        reason,
                    }) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!("Failed to serialize notification: {}", e);
                            continue;
                        }
                    };
                    let notification =
                        ResponseEnvelope::notification(NotificationType::SessionClosed, payload);
                    connections.broadcast_all(&notification).await;
                }
                Ok(ManagerEvent::SessionCreated { id, name }) => {
                    tracing::debug!("Relay saw session {} ({}) created", id, name);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event relay lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
