//! Correlated request/response channel
//!
//! Every request gets a fresh UUID and a pending entry. Frames are handed to
//! the writer through a [`SerialTaskQueue`], so they leave in call order while
//! replies may come back in any order. A request that gets no reply within
//! the timeout fails with [`ClientError::Timeout`]; a reply arriving after
//! that is dropped.

use crate::error::{ClientError, Result};
use crate::queue::SerialTaskQueue;
use serde_json::Value;
use sfu_protocol::{MessageType, RequestEnvelope, ResponseEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type Reply = Result<Value>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ChannelInner {
    /// Taken on close so the writer sees the end of the stream
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    queue: SerialTaskQueue,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    notifications: Mutex<Option<mpsc::UnboundedSender<ResponseEnvelope>>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl ChannelInner {
    fn reject(&self, uuid: &str, error: ClientError) {
        if let Some(tx) = lock(&self.pending).remove(uuid) {
            let _ = tx.send(Err(error));
        }
    }
}

/// Removes a request's pending entry when the awaiting future finishes or is dropped
struct PendingGuard<'a> {
    inner: &'a ChannelInner,
    uuid: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(self.uuid);
    }
}

#[derive(Clone)]
pub struct RequestChannel {
    inner: Arc<ChannelInner>,
}

impl RequestChannel {
    /// `outbound` receives serialized frames in the order requests were made
    pub fn new(outbound: mpsc::UnboundedSender<String>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                outbound: Mutex::new(Some(outbound)),
                queue: SerialTaskQueue::new(),
                pending: Mutex::new(HashMap::new()),
                notifications: Mutex::new(None),
                timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Receive frames that carry no correlation id (server push). Replaces any
    /// earlier subscriber.
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<ResponseEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inner.notifications) = Some(tx);
        rx
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn send_request(
        &self,
        session_id: Option<&str>,
        message_type: MessageType,
        payload: Value,
    ) -> Result<Value> {
        let Some(outbound) = lock(&self.inner.outbound).clone() else {
            return Err(ClientError::ConnectionClosed);
        };

        let uuid = Uuid::new_v4().to_string();
        let envelope = RequestEnvelope {
            id: session_id.map(String::from),
            uuid: Some(uuid.clone()),
            message_type: message_type.as_str().to_string(),
            payload,
        };
        let frame = serde_json::to_string(&envelope)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(uuid.clone(), tx);
        let _pending = PendingGuard {
            inner: &self.inner,
            uuid: &uuid,
        };

        let channel: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        let request_id = uuid.clone();
        self.inner.queue.enqueue(async move {
            if outbound.send(frame).is_err() {
                if let Some(channel) = channel.upgrade() {
                    channel.reject(&request_id, ClientError::ConnectionClosed);
                }
                return Err(ClientError::ConnectionClosed);
            }
            Ok(())
        });

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                tracing::warn!("Request {} ({}) timed out", message_type, uuid);
                Err(ClientError::Timeout {
                    message_type: message_type.as_str().to_string(),
                    uuid: uuid.clone(),
                })
            }
        }
    }

    /// Route one inbound text frame to its pending request
    pub fn handle_incoming(&self, text: &str) {
        let envelope: ResponseEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                return;
            }
        };

        let Some(uuid) = envelope.uuid.clone() else {
            let subscriber = lock(&self.inner.notifications).clone();
            match subscriber {
                Some(tx) => {
                    if tx.send(envelope).is_err() {
                        tracing::debug!("Notification subscriber gone");
                    }
                }
                None => tracing::debug!("Dropping {} notification", envelope.message_type),
            }
            return;
        };

        let Some(tx) = lock(&self.inner.pending).remove(&uuid) else {
            tracing::warn!(
                "Dropping {} reply for unknown or expired request {}",
                envelope.message_type,
                uuid
            );
            return;
        };

        let reply = match envelope.error {
            Some(error) => Err(ClientError::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(envelope.payload.unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
    }

    /// Fail every outstanding request and stop accepting new ones
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.inner.outbound).take();
        let dropped = self.inner.queue.clear();
        let pending: Vec<_> = lock(&self.inner.pending).drain().collect();
        tracing::debug!(
            "Channel closed: {} queued, {} pending requests rejected",
            dropped,
            pending.len()
        );
        for (_, tx) in pending {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(frame: &str) -> RequestEnvelope {
        serde_json::from_str(frame).unwrap()
    }

    fn reply(uuid: &str, message_type: &str, payload: Value) -> String {
        json!({ "uuid": uuid, "type": message_type, "payload": payload }).to_string()
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        let responder = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut frames = Vec::new();
                for _ in 0..3 {
                    frames.push(parse(&rx.recv().await.unwrap()));
                }
                let types: Vec<String> = frames.iter().map(|f| f.message_type.clone()).collect();
                for frame in frames.iter().rev() {
                    channel.handle_incoming(&reply(
                        frame.uuid.as_deref().unwrap(),
                        &frame.message_type,
                        json!({ "echo": frame.message_type }),
                    ));
                }
                types
            })
        };

        let (a, b, c) = tokio::join!(
            channel.send_request(Some("s"), MessageType::RtpCapabilities, json!({})),
            channel.send_request(Some("s"), MessageType::ProducerList, json!({})),
            channel.send_request(Some("s"), MessageType::DataProducerList, json!({})),
        );

        assert_eq!(a.unwrap()["echo"], "rtpCapabilities");
        assert_eq!(b.unwrap()["echo"], "producerList");
        assert_eq!(c.unwrap()["echo"], "dataProducerList");
        assert_eq!(
            responder.await.unwrap(),
            vec!["rtpCapabilities", "producerList", "dataProducerList"]
        );
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_once_and_late_reply_is_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        let started = tokio::time::Instant::now();
        let result = channel
            .send_request(None, MessageType::GetSessionList, json!({}))
            .await;

        assert!(matches!(result, Err(ClientError::Timeout { .. })));
        assert!(started.elapsed() >= DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(channel.pending_count(), 0);

        let frame = parse(&rx.recv().await.unwrap());
        channel.handle_incoming(&reply(
            frame.uuid.as_deref().unwrap(),
            "getSessionList",
            json!({ "sessions": [] }),
        ));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_requests_leave_nothing_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        for _ in 0..5 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(5),
                channel.send_request(None, MessageType::GetSessionList, json!({})),
            )
            .await;
            assert!(abandoned.is_err());
        }
        assert_eq!(channel.pending_count(), 0);

        let request = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_request(None, MessageType::ProducerList, json!({}))
                    .await
            })
        };
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        request.abort();
        let _ = request.await;
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        let responder = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let frame = parse(&rx.recv().await.unwrap());
                assert_eq!(frame.id.as_deref(), Some("missing"));
                channel.handle_incoming(
                    &json!({
                        "uuid": frame.uuid,
                        "type": frame.message_type,
                        "error": { "code": "sessionNotFound", "message": "Session not found: missing" }
                    })
                    .to_string(),
                );
            })
        };

        let err = channel
            .send_request(Some("missing"), MessageType::RtpCapabilities, json!({}))
            .await
            .unwrap_err();
        responder.await.unwrap();

        assert!(err.is_code(sfu_protocol::ErrorCode::SessionNotFound));
    }

    #[tokio::test]
    async fn close_rejects_outstanding_requests() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        let request = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send_request(None, MessageType::GetSessionList, json!({}))
                    .await
            })
        };
        while channel.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.close();
        assert!(matches!(
            request.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            channel
                .send_request(None, MessageType::GetSessionList, json!({}))
                .await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn frames_without_uuid_go_to_the_subscriber() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = RequestChannel::new(tx, DEFAULT_REQUEST_TIMEOUT);

        // Without a subscriber the frame is simply dropped
        channel.handle_incoming(r#"{"type":"newProducer","payload":{}}"#);

        let mut notifications = channel.subscribe_notifications();
        channel.handle_incoming(r#"{"type":"sessionClosed","payload":{"sessionId":"x","reason":"destroyed"}}"#);
        channel.handle_incoming(r#"{"uuid":"nobody","type":"produce","payload":{}}"#);

        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.message_type, "sessionClosed");
        assert!(notifications.try_recv().is_err());
        assert_eq!(channel.pending_count(), 0);
    }
}
