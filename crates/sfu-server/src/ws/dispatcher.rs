//! Per-connection signaling dispatch
//!
//! Each inbound frame is parsed into a [`RequestEnvelope`], its `type` into a
//! [`MessageType`], and its payload into a typed [`Command`]. Handler errors
//! become error envelopes; nothing a peer sends closes the connection.

use crate::engine::{DataProducerOptions, ProducerOptions, TransportConnectParams};
use crate::error::{Result, SignalError};
use crate::sfu::{Session, SessionManager};
use crate::ws::connections::ConnectionRegistry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sfu_protocol::{
    ConnectRequest, ConsumeRequest, CreatePlainTransportRequest, CreateSessionRequest,
    CreateWebRtcTransportRequest, DataConsumeRequest, DataProduceRequest,
    DataProducerListResponse, ErrorBody, ErrorCode, MessageType, NewDataProducerNotification,
    NewProducerNotification, NotificationType, ProduceRequest, ProducerListResponse, ProducerRef,
    ProducerStateResponse, RequestEnvelope, ResourceAck, ResponseEnvelope,
    RtpCapabilitiesResponse, SessionCreatedResponse, SessionListResponse, TransportRef,
};
use std::sync::Arc;
use uuid::Uuid;

/// A decoded request
#[derive(Debug, Clone)]
pub enum Command {
    GetSessionList,
    CreateSession(CreateSessionRequest),
    DestroySession,
    RtpCapabilities,
    CreateWebRtcTransport(CreateWebRtcTransportRequest),
    CreatePlainTransport(CreatePlainTransportRequest),
    DestroyWebRtcTransport(TransportRef),
    DestroyPlainTransport(TransportRef),
    Connect(ConnectRequest),
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    DataProduce(DataProduceRequest),
    DataConsume(DataConsumeRequest),
    ProducerList,
    DataProducerList,
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
}

fn parse<T: DeserializeOwned>(payload: Value) -> serde_json::Result<T> {
    // An omitted payload decodes like an empty object
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload)
}

impl Command {
    pub fn decode(message_type: MessageType, payload: Value) -> serde_json::Result<Self> {
        Ok(match message_type {
            MessageType::GetSessionList => Command::GetSessionList,
            MessageType::CreateSession => Command::CreateSession(parse(payload)?),
            MessageType::DestroySession => Command::DestroySession,
            MessageType::RtpCapabilities => Command::RtpCapabilities,
            MessageType::CreateWebRtcTransport => Command::CreateWebRtcTransport(parse(payload)?),
            MessageType::CreatePlainTransport => Command::CreatePlainTransport(parse(payload)?),
            MessageType::DestroyWebRtcTransport => Command::DestroyWebRtcTransport(parse(payload)?),
            MessageType::DestroyPlainTransport => Command::DestroyPlainTransport(parse(payload)?),
            MessageType::Connect => Command::Connect(parse(payload)?),
            MessageType::Produce => Command::Produce(parse(payload)?),
            MessageType::Consume => Command::Consume(parse(payload)?),
            MessageType::DataProduce => Command::DataProduce(parse(payload)?),
            MessageType::DataConsume => Command::DataConsume(parse(payload)?),
            MessageType::ProducerList => Command::ProducerList,
            MessageType::DataProducerList => Command::DataProducerList,
            MessageType::PauseProducer => Command::PauseProducer(parse(payload)?),
            MessageType::ResumeProducer => Command::ResumeProducer(parse(payload)?),
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| SignalError::BadRequest(e.to_string()))
}

pub struct Dispatcher {
    connection_id: Uuid,
    manager: SessionManager,
    connections: Arc<ConnectionRegistry>,
    /// Transports created through this connection, as (session id, transport id)
    owned_transports: Vec<(String, String)>,
}

impl Dispatcher {
    pub fn new(
        connection_id: Uuid,
        manager: SessionManager,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            connection_id,
            manager,
            connections,
            owned_transports: Vec::new(),
        }
    }

    pub fn owned_transport_count(&self) -> usize {
        self.owned_transports.len()
    }

    /// Handle one text frame and produce the reply, if one is owed
    pub async fn handle_frame(&mut self, text: &str) -> Option<ResponseEnvelope> {
        tracing::debug!(target: "access", "C[{}] -> S recv: {}", self.connection_id, text);

        let envelope: RequestEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Malformed frame from {}: {}", self.connection_id, e);
                return None;
            }
        };

        let message_type: MessageType = match envelope.message_type.parse() {
            Ok(message_type) => message_type,
            Err(e) => {
                tracing::warn!("Dropping frame from {}: {}", self.connection_id, e);
                return None;
            }
        };

        let command = match Command::decode(message_type, envelope.payload) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(
                    "Bad {} payload from {}: {}",
                    message_type,
                    self.connection_id,
                    e
                );
                return Some(ResponseEnvelope::failure(
                    envelope.uuid,
                    message_type.as_str(),
                    ErrorBody::new(ErrorCode::BadRequest, e.to_string()),
                ));
            }
        };

        let reply = match self.execute(envelope.id.as_deref(), command).await {
            Ok(payload) => ResponseEnvelope::success(envelope.uuid, message_type.as_str(), payload),
            Err(e) => {
                tracing::warn!("{} from {} failed: {}", message_type, self.connection_id, e);
                ResponseEnvelope::failure(envelope.uuid, message_type.as_str(), e.to_body())
            }
        };
        Some(reply)
    }

    /// Resolve the target session and remember that this connection works in it
    async fn session(&self, session_id: Option<&str>) -> Result<Arc<Session>> {
        let session = self.manager.resolve(session_id).await?;
        self.manager.attach(session.id(), self.connection_id).await;
        Ok(session)
    }

    /// Send `notification` to the other connections working in `session`
    async fn notify_members(&self, session: &Session, notification: &ResponseEnvelope) {
        let mut members = self.manager.members(session.id()).await;
        members.retain(|id| *id != self.connection_id);
        let reached = self.connections.broadcast_to(&members, notification).await;
        tracing::debug!(
            "{} sent to {} connection(s) in session {}",
            notification.message_type,
            reached,
            session.id()
        );
    }

    async fn execute(&mut self, session_id: Option<&str>, command: Command) -> Result<Value> {
        match command {
            Command::GetSessionList => to_payload(&SessionListResponse {
                sessions: self.manager.list_sessions().await,
            }),

            Command::CreateSession(request) => {
                let session = match session_id {
                    Some(id) => self.manager.create_session_with_id(id, request.name).await?,
                    None => self.manager.create_session(request.name).await?,
                };
                self.manager.attach(session.id(), self.connection_id).await;
                to_payload(&SessionCreatedResponse {
                    id: session.id().to_string(),
                    name: session.name().to_string(),
                })
            }

            Command::DestroySession => {
                let id = session_id.ok_or_else(|| {
                    SignalError::BadRequest("destroySession requires a session id".to_string())
                })?;
                self.manager.remove_session(id).await;
                self.owned_transports.retain(|(session, _)| session != id);
                to_payload(&ResourceAck { id: id.to_string() })
            }

            Command::RtpCapabilities => {
                let session = self.session(session_id).await?;
                to_payload(&RtpCapabilitiesResponse {
                    rtp_capabilities: session.rtp_capabilities()?,
                })
            }

            Command::CreateWebRtcTransport(request) => {
                let session = self.session(session_id).await?;
                let options = self.manager.media().webrtc_options(request.enable_sctp);
                let transport = session.create_webrtc_transport(&options).await?;
                self.owned_transports
                    .push((session.id().to_string(), transport.id.clone()));
                to_payload(&transport)
            }

            Command::CreatePlainTransport(request) => {
                let session = self.session(session_id).await?;
                let options = self
                    .manager
                    .media()
                    .plain_options(request.rtcp_mux, request.comedia);
                let transport = session.create_plain_transport(&options).await?;
                self.owned_transports
                    .push((session.id().to_string(), transport.id.clone()));
                to_payload(&transport)
            }

            Command::DestroyWebRtcTransport(target) | Command::DestroyPlainTransport(target) => {
                let session = self.session(session_id).await?;
                session.delete_transport(&target.transport_id).await;
                self.owned_transports.retain(|(owner, transport_id)| {
                    !(owner == session.id() && *transport_id == target.transport_id)
                });
                to_payload(&ResourceAck {
                    id: target.transport_id,
                })
            }

            Command::Connect(request) => {
                let session = self.session(session_id).await?;
                session
                    .connect_transport(
                        &request.transport_id,
                        TransportConnectParams {
                            dtls_parameters: request.dtls_parameters,
                            ip: request.ip,
                            port: request.port,
                            rtcp_port: request.rtcp_port,
                        },
                    )
                    .await?;
                to_payload(&ResourceAck {
                    id: request.transport_id,
                })
            }

            Command::Produce(request) => {
                let session = self.session(session_id).await?;
                let producer = session
                    .produce(
                        &request.transport_id,
                        ProducerOptions {
                            kind: request.kind,
                            rtp_parameters: request.rtp_parameters,
                            paused: request.paused,
                            app_data: request.app_data,
                        },
                    )
                    .await?;

                let notification = ResponseEnvelope::notification(
                    NotificationType::NewProducer,
                    to_payload(&NewProducerNotification {
                        session_id: session.id().to_string(),
                        producer: producer.clone(),
                    })?,
                );
                self.notify_members(&session, &notification).await;

                to_payload(&producer)
            }

            Command::Consume(request) => {
                let session = self.session(session_id).await?;
                let consumer = session
                    .consume(
                        &request.transport_id,
                        &request.producer_id,
                        request.rtp_capabilities,
                        request.paused,
                    )
                    .await?;
                to_payload(&consumer)
            }

            Command::DataProduce(request) => {
                let session = self.session(session_id).await?;
                let data_producer = session
                    .produce_data(
                        &request.transport_id,
                        DataProducerOptions {
                            sctp_stream_parameters: request.sctp_stream_parameters,
                            label: request.label,
                            protocol: request.protocol,
                            app_data: request.app_data,
                        },
                    )
                    .await?;

                let notification = ResponseEnvelope::notification(
                    NotificationType::NewDataProducer,
                    to_payload(&NewDataProducerNotification {
                        session_id: session.id().to_string(),
                        data_producer: data_producer.clone(),
                    })?,
                );
                self.notify_members(&session, &notification).await;

                to_payload(&data_producer)
            }

            Command::DataConsume(request) => {
                let session = self.session(session_id).await?;
                let data_consumer = session
                    .consume_data(&request.transport_id, &request.data_producer_id)
                    .await?;
                to_payload(&data_consumer)
            }

            Command::ProducerList => {
                let session = self.session(session_id).await?;
                to_payload(&ProducerListResponse {
                    producers: session.producers().await,
                })
            }

            Command::DataProducerList => {
                let session = self.session(session_id).await?;
                to_payload(&DataProducerListResponse {
                    data_producers: session.data_producers().await,
                })
            }

            Command::PauseProducer(target) => {
                let session = self.session(session_id).await?;
                let paused = session
                    .set_producer_paused(&target.producer_id, true)
                    .await?;
                to_payload(&ProducerStateResponse {
                    id: target.producer_id,
                    paused,
                })
            }

            Command::ResumeProducer(target) => {
                let session = self.session(session_id).await?;
                let paused = session
                    .set_producer_paused(&target.producer_id, false)
                    .await?;
                to_payload(&ProducerStateResponse {
                    id: target.producer_id,
                    paused,
                })
            }
        }
    }

    /// Tear down every transport this connection created and leave its
    /// sessions, closing those nobody else works in
    pub async fn close(&mut self) {
        let owned = std::mem::take(&mut self.owned_transports);
        if !owned.is_empty() {
            tracing::info!(
                "Connection {} closed, deleting {} transport(s)",
                self.connection_id,
                owned.len()
            );
        }

        for (session_id, transport_id) in owned {
            match self.manager.get(&session_id).await {
                Ok(session) => {
                    session.delete_transport(&transport_id).await;
                }
                Err(_) => {
                    tracing::debug!(
                        "Session {} already gone, skipping transport {}",
                        session_id,
                        transport_id
                    );
                }
            }
        }

        for id in self.manager.detach(self.connection_id).await {
            tracing::info!(
                "Session {} closed with its last connection {}",
                id,
                self.connection_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaSettings;
    use crate::engine::LoopbackEngine;
    use crate::ws::connections::Outbound;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn dispatcher() -> (Dispatcher, SessionManager, Arc<ConnectionRegistry>) {
        let manager = SessionManager::new(
            Arc::new(LoopbackEngine::new()),
            MediaSettings::default(),
            None,
        );
        let connections = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(Uuid::new_v4(), manager.clone(), connections.clone());
        (dispatcher, manager, connections)
    }

    async fn request(dispatcher: &mut Dispatcher, frame: Value) -> ResponseEnvelope {
        dispatcher
            .handle_frame(&frame.to_string())
            .await
            .expect("reply")
    }

    #[test]
    fn decode_covers_every_message_type() {
        for message_type in MessageType::ALL {
            let payload = json!({
                "transportId": "t",
                "producerId": "p",
                "dataProducerId": "d",
                "kind": "audio",
                "rtpParameters": { "codecs": [] },
                "rtpCapabilities": { "codecs": [] }
            });
            assert!(
                Command::decode(message_type, payload).is_ok(),
                "{} failed to decode",
                message_type
            );
        }
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_dropped() {
        let (mut dispatcher, _, _) = dispatcher();
        assert!(dispatcher.handle_frame("{not json").await.is_none());
        assert!(
            dispatcher
                .handle_frame(r#"{"uuid":"u1","type":"teleport","payload":{}}"#)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn bad_payload_gets_bad_request() {
        let (mut dispatcher, _, _) = dispatcher();
        let reply = request(
            &mut dispatcher,
            json!({ "id": "s", "uuid": "u2", "type": "produce", "payload": { "kind": "smell" } }),
        )
        .await;

        assert_eq!(reply.uuid.as_deref(), Some("u2"));
        assert_eq!(reply.message_type, "produce");
        assert_eq!(reply.error.unwrap().code, "badRequest");
    }

    #[tokio::test]
    async fn create_session_returns_random_id_and_name() {
        let (mut dispatcher, manager, _) = dispatcher();
        let reply = request(
            &mut dispatcher,
            json!({ "uuid": "u3", "type": "createSession", "payload": { "name": "demo" } }),
        )
        .await;

        let payload: SessionCreatedResponse =
            serde_json::from_value(reply.payload.unwrap()).unwrap();
        assert_eq!(payload.id.len(), 32);
        assert_eq!(payload.name, "demo");
        assert!(manager.get(&payload.id).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_session_is_reported() {
        let (mut dispatcher, _, _) = dispatcher();
        let reply = request(
            &mut dispatcher,
            json!({ "id": "missing", "uuid": "u4", "type": "rtpCapabilities" }),
        )
        .await;

        assert!(reply.payload.is_none());
        assert_eq!(reply.error.unwrap().code, "sessionNotFound");
    }

    #[tokio::test]
    async fn destroy_absent_session_is_acknowledged() {
        let (mut dispatcher, _, _) = dispatcher();
        let reply = request(
            &mut dispatcher,
            json!({ "id": "gone", "uuid": "u5", "type": "destroySession" }),
        )
        .await;
        assert_eq!(reply.payload.unwrap()["id"], "gone");

        let reply = request(&mut dispatcher, json!({ "uuid": "u6", "type": "destroySession" })).await;
        assert_eq!(reply.error.unwrap().code, "badRequest");
    }

    #[tokio::test]
    async fn produce_notifies_other_connections_in_the_session() {
        let (mut dispatcher, manager, connections) = dispatcher();
        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        let other = connections.register(other_tx).await;
        let (outsider_tx, mut outsider_rx) = mpsc::unbounded_channel();
        let outsider = connections.register(outsider_tx).await;
        manager.create_session_with_id("room", None).await.unwrap();
        manager.create_session_with_id("elsewhere", None).await.unwrap();
        manager.attach("room", other.id).await;
        manager.attach("elsewhere", outsider.id).await;

        let transport = request(
            &mut dispatcher,
            json!({ "id": "room", "uuid": "u7", "type": "createPlainTransport",
                    "payload": { "rtcpMux": false, "comedia": true } }),
        )
        .await;
        let transport_id = transport.payload.unwrap()["id"].as_str().unwrap().to_string();

        let produced = request(
            &mut dispatcher,
            json!({ "id": "room", "uuid": "u8", "type": "produce", "payload": {
                "transportId": transport_id,
                "kind": "audio",
                "rtpParameters": {
                    "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 }],
                    "encodings": [{ "ssrc": 1111 }]
                }
            }}),
        )
        .await;
        let producer_id = produced.payload.unwrap()["id"].as_str().unwrap().to_string();

        let Some(Outbound::Text(text)) = other_rx.recv().await else {
            panic!("expected a notification");
        };
        let notification: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(notification["type"], "newProducer");
        assert!(notification.get("uuid").is_none());
        assert_eq!(notification["payload"]["producer"]["id"], producer_id.as_str());
        assert_eq!(notification["payload"]["sessionId"], "room");
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_deletes_owned_transports() {
        let (mut dispatcher, manager, _) = dispatcher();
        let session = manager.create_session_with_id("room", None).await.unwrap();

        for uuid in ["a", "b"] {
            request(
                &mut dispatcher,
                json!({ "id": "room", "uuid": uuid, "type": "createWebRtcTransport" }),
            )
            .await;
        }
        assert_eq!(dispatcher.owned_transport_count(), 2);
        assert_eq!(session.info().await.transport_count, 2);

        let other = Uuid::new_v4();
        manager.attach("room", other).await;
        dispatcher.close().await;
        assert_eq!(dispatcher.owned_transport_count(), 0);
        assert_eq!(session.info().await.transport_count, 0);
        assert!(!session.is_closed());
        assert_eq!(manager.members("room").await, vec![other]);
    }

    #[tokio::test]
    async fn closing_the_last_connection_destroys_its_session() {
        let (mut dispatcher, manager, _) = dispatcher();
        let reply = request(
            &mut dispatcher,
            json!({ "uuid": "c1", "type": "createSession", "payload": {} }),
        )
        .await;
        let id = reply.payload.unwrap()["id"].as_str().unwrap().to_string();
        let session = manager.get(&id).await.unwrap();

        dispatcher.close().await;

        assert!(session.is_closed());
        assert!(manager.get(&id).await.is_err());
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn pause_unknown_producer_reports_no_state() {
        let (mut dispatcher, manager, _) = dispatcher();
        manager.create_session_with_id("room", None).await.unwrap();

        let reply = request(
            &mut dispatcher,
            json!({ "id": "room", "uuid": "u9", "type": "pauseProducer", "payload": { "producerId": "ghost" } }),
        )
        .await;

        let payload = reply.payload.unwrap();
        assert_eq!(payload["id"], "ghost");
        assert!(payload["paused"].is_null());
    }
}
