//! End-to-end tests for the SFU signaling server
//!
//! Each test starts the server on an ephemeral port with the loopback engine
//! and talks to it over real WebSockets.
//!
//! Run with: cargo test -p sfu-server --test integration_tests

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use sfu_client::{ClientError, SfuClient};
use sfu_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, ErrorCode, MediaKind, NewProducerNotification,
    RtpCodecParameters, RtpParameters, SessionClosedNotification,
};
use sfu_server::config::{DefaultSession, Settings};
use sfu_server::engine::LoopbackEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        Self::start_with(Settings::default()).await
    }

    async fn start_with(mut settings: Settings) -> anyhow::Result<Self> {
        settings.server.bind_address = "127.0.0.1:0".to_string();
        let (router, _state) =
            sfu_server::create_app_with_engine(settings, Arc::new(LoopbackEngine::new())).await?;

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn client(&self) -> SfuClient {
        SfuClient::connect(&self.ws_url())
            .await
            .expect("Failed to connect client")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn opus_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 100,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![json!({ "ssrc": 1111 })],
        ..Default::default()
    }
}

fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99".to_string(),
        }],
    }
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..40 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::start().await.unwrap();

    let response = reqwest::get(format!("{}/health", server.http_url()))
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_router_without_listener() {
    let (router, _state) =
        sfu_server::create_app_with_engine(Settings::default(), Arc::new(LoopbackEngine::new()))
            .await
            .unwrap();

    let response = router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/api/sessions/nope")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);

    let response = router
        .oneshot(
            axum::http::Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn test_create_session_and_list_over_http() {
    let server = TestServer::start().await.unwrap();
    let client = server.client().await;

    let created = client.create_session(Some("demo".into())).await.unwrap();
    assert_eq!(created.id.len(), 32);
    assert!(created.id.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(created.name, "demo");

    let sessions = client.list_sessions().await.unwrap();
    assert!(sessions.iter().any(|s| s.id == created.id));

    let listed: Value = reqwest::get(format!("{}/api/sessions", server.http_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["sessions"][0]["id"], created.id.as_str());
    assert_eq!(listed["sessions"][0]["transportCount"], 0);

    let info: Value = reqwest::get(format!("{}/api/sessions/{}", server.http_url(), created.id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["name"], "demo");
}

#[tokio::test]
async fn test_unknown_session_is_reported_with_request_uuid() {
    let server = TestServer::start().await.unwrap();
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();

    ws.send(Message::Text(
        json!({ "id": "does-not-exist", "uuid": "req-1", "type": "rtpCapabilities" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let frame = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return serde_json::from_str::<Value>(&text).unwrap();
            }
        }
    })
    .await
    .expect("Timeout waiting for reply");

    assert_eq!(frame["uuid"], "req-1");
    assert_eq!(frame["type"], "rtpCapabilities");
    assert_eq!(frame["error"]["code"], ErrorCode::SessionNotFound.as_str());
    assert!(frame.get("payload").is_none());
}

#[tokio::test]
async fn test_unknown_type_gets_no_reply() {
    let server = TestServer::start().await.unwrap();
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();

    ws.send(Message::Text(
        json!({ "uuid": "req-1", "type": "joinRoom" }).to_string().into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        json!({ "uuid": "req-2", "type": "getSessionList" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let frame = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return serde_json::from_str::<Value>(&text).unwrap();
            }
        }
    })
    .await
    .expect("Timeout waiting for reply");

    // The first reply belongs to the second request
    assert_eq!(frame["uuid"], "req-2");
}

#[tokio::test]
async fn test_produce_and_consume_across_connections() {
    let server = TestServer::start().await.unwrap();
    let publisher = server.client().await;
    let viewer = server.client().await;

    let session = publisher.create_session(Some("room".into())).await.unwrap();
    viewer.set_session(Some(session.id.clone())).await;

    // Publisher side
    let send_transport = publisher.create_webrtc_transport(None).await.unwrap();
    assert!(!send_transport.ice_candidates.is_empty());
    publisher
        .connect_webrtc_transport(&send_transport.id, client_dtls())
        .await
        .unwrap();
    let producer = publisher
        .produce(
            &send_transport.id,
            MediaKind::Audio,
            opus_parameters(),
            Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(producer.kind, MediaKind::Audio);

    // Viewer side
    let capabilities = viewer.rtp_capabilities().await.unwrap();
    let recv_transport = viewer.create_webrtc_transport(None).await.unwrap();
    let consumer = viewer
        .consume(&recv_transport.id, &producer.id, capabilities)
        .await
        .unwrap();
    assert_eq!(consumer.producer_id, producer.id);
    assert_eq!(consumer.kind, MediaKind::Audio);

    let producers = viewer.producers().await.unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].id, producer.id);

    // Pause round trip
    let state = viewer.pause_producer(&producer.id).await.unwrap();
    assert_eq!(state.paused, Some(true));
    let state = viewer.resume_producer(&producer.id).await.unwrap();
    assert_eq!(state.paused, Some(false));
}

#[tokio::test]
async fn test_consume_unknown_producer_fails() {
    let server = TestServer::start().await.unwrap();
    let client = server.client().await;
    client.create_session(None).await.unwrap();

    let capabilities = client.rtp_capabilities().await.unwrap();
    let transport = client.create_webrtc_transport(None).await.unwrap();
    let err = client
        .consume(&transport.id, "no-such-producer", capabilities)
        .await
        .unwrap_err();
    assert!(err.is_code(ErrorCode::ProducerNotFound));
}

#[tokio::test]
async fn test_disconnect_releases_owned_transports() {
    let server = TestServer::start().await.unwrap();
    let publisher = server.client().await;
    let observer = server.client().await;

    let session = publisher.create_session(None).await.unwrap();
    observer.set_session(Some(session.id.clone())).await;

    let first = publisher.create_webrtc_transport(None).await.unwrap();
    let second = publisher
        .create_plain_transport(Some(false), Some(true))
        .await
        .unwrap();
    publisher
        .produce(&first.id, MediaKind::Audio, opus_parameters(), Value::Null)
        .await
        .unwrap();
    publisher
        .produce(&second.id, MediaKind::Audio, opus_parameters(), Value::Null)
        .await
        .unwrap();
    assert_eq!(observer.producers().await.unwrap().len(), 2);

    publisher.close();

    let observer_ref = &observer;
    assert!(
        eventually(move || async move { observer_ref.producers().await.unwrap().is_empty() })
            .await,
        "producers of a closed connection should disappear"
    );
    let sessions = observer.list_sessions().await.unwrap();
    let info = sessions.iter().find(|s| s.id == session.id).unwrap();
    assert_eq!(info.transport_count, 0);
}

#[tokio::test]
async fn test_new_producer_is_announced_to_other_connections() {
    let server = TestServer::start().await.unwrap();
    let publisher = server.client().await;
    let listener = server.client().await;
    let mut notifications = listener.notifications();
    let mut own_notifications = publisher.notifications();

    let outsider = server.client().await;
    let mut outsider_notifications = outsider.notifications();
    outsider.create_session(None).await.unwrap();

    let session = publisher.create_session(None).await.unwrap();
    // A connection joins a session with its first request there
    listener.set_session(Some(session.id.clone())).await;
    listener.producers().await.unwrap();

    let transport = publisher
        .create_plain_transport(None, Some(true))
        .await
        .unwrap();
    let producer = publisher
        .produce(&transport.id, MediaKind::Audio, opus_parameters(), Value::Null)
        .await
        .unwrap();

    let frame = timeout(Duration::from_secs(2), notifications.recv())
        .await
        .expect("Timeout waiting for notification")
        .unwrap();
    assert_eq!(frame.message_type, "newProducer");
    let notification: NewProducerNotification =
        serde_json::from_value(frame.payload.unwrap()).unwrap();
    assert_eq!(notification.session_id, session.id);
    assert_eq!(notification.producer.id, producer.id);

    assert!(own_notifications.try_recv().is_err());
    assert!(outsider_notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_session_closes_with_its_last_connection() {
    let server = TestServer::start().await.unwrap();
    let owner = server.client().await;
    let watcher = server.client().await;
    let mut notifications = watcher.notifications();
    watcher.list_sessions().await.unwrap();

    let session = owner.create_session(Some("ephemeral".into())).await.unwrap();
    owner.create_webrtc_transport(None).await.unwrap();
    owner.close();

    let frame = timeout(Duration::from_secs(2), async {
        loop {
            let frame = notifications.recv().await.unwrap();
            if frame.message_type == "sessionClosed" {
                return frame;
            }
        }
    })
    .await
    .expect("Timeout waiting for sessionClosed");
    let closed: SessionClosedNotification =
        serde_json::from_value(frame.payload.unwrap()).unwrap();
    assert_eq!(closed.session_id, session.id);
    assert_eq!(closed.reason, "last connection closed");

    let sessions = watcher.list_sessions().await.unwrap();
    assert!(sessions.iter().all(|s| s.id != session.id));
}

#[tokio::test]
async fn test_client_can_create_several_sessions() {
    let server = TestServer::start().await.unwrap();
    let client = server.client().await;

    let first = client.create_session(None).await.unwrap();
    let second = client.create_session(None).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(client.session_id().await, Some(second.id.clone()));
    let sessions = client.list_sessions().await.unwrap();
    assert!(sessions.iter().any(|s| s.id == first.id));
    assert!(sessions.iter().any(|s| s.id == second.id));
}

#[tokio::test]
async fn test_destroy_session_notifies_and_forgets() {
    let server = TestServer::start().await.unwrap();
    let owner = server.client().await;
    let watcher = server.client().await;
    let mut notifications = watcher.notifications();
    watcher.list_sessions().await.unwrap();

    let session = owner.create_session(Some("short-lived".into())).await.unwrap();
    owner.create_webrtc_transport(None).await.unwrap();
    owner.destroy_session().await.unwrap();

    let frame = timeout(Duration::from_secs(2), async {
        loop {
            let frame = notifications.recv().await.unwrap();
            if frame.message_type == "sessionClosed" {
                return frame;
            }
        }
    })
    .await
    .expect("Timeout waiting for sessionClosed");
    let closed: SessionClosedNotification =
        serde_json::from_value(frame.payload.unwrap()).unwrap();
    assert_eq!(closed.session_id, session.id);

    watcher.set_session(Some(session.id)).await;
    let err = watcher.producers().await.unwrap_err();
    assert!(err.is_code(ErrorCode::SessionNotFound));
}

#[tokio::test]
async fn test_default_session_serves_requests_without_id() {
    let mut settings = Settings::default();
    settings.default_session = Some(DefaultSession {
        id: "lobby".to_string(),
        name: Some("Lobby".to_string()),
    });
    let server = TestServer::start_with(settings).await.unwrap();
    let client = server.client().await;

    assert_eq!(client.session_id().await, None);
    let capabilities = client.rtp_capabilities().await.unwrap();
    assert!(!capabilities.codecs.is_empty());

    let transport = client.create_webrtc_transport(Some(true)).await.unwrap();
    assert!(transport.sctp_parameters.is_some());

    let sessions = client.list_sessions().await.unwrap();
    let lobby = sessions.iter().find(|s| s.id == "lobby").unwrap();
    assert_eq!(lobby.name, "Lobby");
    assert_eq!(lobby.transport_count, 1);
}

#[tokio::test]
async fn test_requests_without_session_fail_without_default() {
    let server = TestServer::start().await.unwrap();
    let client = server.client().await;

    let err = client.rtp_capabilities().await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
    assert!(err.is_code(ErrorCode::SessionNotFound));
}
