use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sfu_protocol::{
    ConnectRequest, ConsumeRequest, ConsumeResponse, CreatePlainTransportRequest,
    CreateSessionRequest, CreateWebRtcTransportRequest, DataConsumeRequest, DataConsumeResponse,
    DataProduceRequest, DataProducerInfo, DataProducerListResponse, DtlsParameters, MediaKind,
    MessageType, PlainTransportResponse, ProduceRequest, ProducerInfo, ProducerListResponse,
    ProducerRef, ProducerStateResponse, ResourceAck, ResponseEnvelope, RtpCapabilities,
    RtpCapabilitiesResponse, RtpParameters, SctpStreamParameters, SessionCreatedResponse,
    SessionInfo, SessionListResponse, TransportRef, WebRtcTransportResponse,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

use crate::channel::{DEFAULT_REQUEST_TIMEOUT, RequestChannel};
use crate::error::{ClientError, Result};
use crate::websocket;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Typed signaling client
///
/// Requests are tagged with the current session id (see [`SfuClient::set_session`]);
/// without one the server falls back to its default session.
#[derive(Clone)]
pub struct SfuClient {
    channel: RequestChannel,
    session_id: Arc<RwLock<Option<String>>>,
}

impl SfuClient {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, ClientOptions::default()).await
    }

    pub async fn connect_with(url: &str, options: ClientOptions) -> Result<Self> {
        let channel = websocket::connect(url, options.request_timeout).await?;
        Ok(Self::from_channel(channel))
    }

    /// Wrap an existing channel (any transport that feeds `handle_incoming`)
    pub fn from_channel(channel: RequestChannel) -> Self {
        Self {
            channel,
            session_id: Arc::new(RwLock::new(None)),
        }
    }

    pub fn channel(&self) -> &RequestChannel {
        &self.channel
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub async fn set_session(&self, session_id: Option<String>) {
        *self.session_id.write().await = session_id;
    }

    /// Server push frames (newProducer, newDataProducer, sessionClosed)
    pub fn notifications(&self) -> mpsc::UnboundedReceiver<ResponseEnvelope> {
        self.channel.subscribe_notifications()
    }

    /// Send `message_type` with `payload` in the current session and decode the reply payload
    pub async fn call<P, R>(&self, message_type: MessageType, payload: &P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let session_id = self.session_id().await;
        self.call_in(session_id.as_deref(), message_type, payload).await
    }

    /// Like [`SfuClient::call`] but tagged with `session_id` instead of the current session
    pub async fn call_in<P, R>(
        &self,
        session_id: Option<&str>,
        message_type: MessageType,
        payload: &P,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let reply = self
            .channel
            .send_request(session_id, message_type, payload)
            .await?;
        serde_json::from_value(reply).map_err(|e| {
            ClientError::Protocol(format!("unexpected {} reply: {}", message_type, e))
        })
    }

    // Sessions

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let response: SessionListResponse =
            self.call(MessageType::GetSessionList, &Value::Null).await?;
        Ok(response.sessions)
    }

    /// Create a session and make it the current one
    ///
    /// The request carries no session id, so the server picks a fresh one even
    /// while another session is current.
    pub async fn create_session(&self, name: Option<String>) -> Result<SessionCreatedResponse> {
        let created: SessionCreatedResponse = self
            .call_in(None, MessageType::CreateSession, &CreateSessionRequest { name })
            .await?;
        self.set_session(Some(created.id.clone())).await;
        Ok(created)
    }

    /// Destroy the current session and forget it
    pub async fn destroy_session(&self) -> Result<ResourceAck> {
        let ack: ResourceAck = self.call(MessageType::DestroySession, &Value::Null).await?;
        self.set_session(None).await;
        Ok(ack)
    }

    pub async fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        let response: RtpCapabilitiesResponse =
            self.call(MessageType::RtpCapabilities, &Value::Null).await?;
        Ok(response.rtp_capabilities)
    }

    // Transports

    pub async fn create_webrtc_transport(
        &self,
        enable_sctp: Option<bool>,
    ) -> Result<WebRtcTransportResponse> {
        self.call(
            MessageType::CreateWebRtcTransport,
            &CreateWebRtcTransportRequest { enable_sctp },
        )
        .await
    }

    pub async fn create_plain_transport(
        &self,
        rtcp_mux: Option<bool>,
        comedia: Option<bool>,
    ) -> Result<PlainTransportResponse> {
        self.call(
            MessageType::CreatePlainTransport,
            &CreatePlainTransportRequest { rtcp_mux, comedia },
        )
        .await
    }

    pub async fn destroy_webrtc_transport(&self, transport_id: &str) -> Result<ResourceAck> {
        self.call(
            MessageType::DestroyWebRtcTransport,
            &TransportRef {
                transport_id: transport_id.to_string(),
            },
        )
        .await
    }

    pub async fn destroy_plain_transport(&self, transport_id: &str) -> Result<ResourceAck> {
        self.call(
            MessageType::DestroyPlainTransport,
            &TransportRef {
                transport_id: transport_id.to_string(),
            },
        )
        .await
    }

    pub async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<ResourceAck> {
        self.connect_transport(ConnectRequest {
            transport_id: transport_id.to_string(),
            dtls_parameters: Some(dtls_parameters),
            ip: None,
            port: None,
            rtcp_port: None,
        })
        .await
    }

    pub async fn connect_transport(&self, request: ConnectRequest) -> Result<ResourceAck> {
        self.call(MessageType::Connect, &request).await
    }

    // Media

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<ProducerInfo> {
        self.call(
            MessageType::Produce,
            &ProduceRequest {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters,
                paused: false,
                app_data,
            },
        )
        .await
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeResponse> {
        self.call(
            MessageType::Consume,
            &ConsumeRequest {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                rtp_capabilities,
                paused: false,
            },
        )
        .await
    }

    pub async fn produce_data(
        &self,
        transport_id: &str,
        sctp_stream_parameters: SctpStreamParameters,
        label: &str,
        protocol: &str,
    ) -> Result<DataProducerInfo> {
        self.call(
            MessageType::DataProduce,
            &DataProduceRequest {
                transport_id: transport_id.to_string(),
                sctp_stream_parameters: Some(sctp_stream_parameters),
                label: label.to_string(),
                protocol: protocol.to_string(),
                app_data: Value::Null,
            },
        )
        .await
    }

    pub async fn consume_data(
        &self,
        transport_id: &str,
        data_producer_id: &str,
    ) -> Result<DataConsumeResponse> {
        self.call(
            MessageType::DataConsume,
            &DataConsumeRequest {
                transport_id: transport_id.to_string(),
                data_producer_id: data_producer_id.to_string(),
            },
        )
        .await
    }

    pub async fn producers(&self) -> Result<Vec<ProducerInfo>> {
        let response: ProducerListResponse =
            self.call(MessageType::ProducerList, &Value::Null).await?;
        Ok(response.producers)
    }

    pub async fn data_producers(&self) -> Result<Vec<DataProducerInfo>> {
        let response: DataProducerListResponse =
            self.call(MessageType::DataProducerList, &Value::Null).await?;
        Ok(response.data_producers)
    }

    pub async fn pause_producer(&self, producer_id: &str) -> Result<ProducerStateResponse> {
        self.call(
            MessageType::PauseProducer,
            &ProducerRef {
                producer_id: producer_id.to_string(),
            },
        )
        .await
    }

    pub async fn resume_producer(&self, producer_id: &str) -> Result<ProducerStateResponse> {
        self.call(
            MessageType::ResumeProducer,
            &ProducerRef {
                producer_id: producer_id.to_string(),
            },
        )
        .await
    }

    /// Reject outstanding requests and close the socket
    pub fn close(&self) {
        self.channel.close();
    }
}
