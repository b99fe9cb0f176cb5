use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::types::{
    DataProducerInfo, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerInfo,
    RtpCapabilities, RtpParameters, SctpParameters, SctpStreamParameters, SessionInfo,
};

/// Request types understood by the signaling server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    GetSessionList,
    CreateSession,
    DestroySession,
    RtpCapabilities,
    CreateWebRtcTransport,
    CreatePlainTransport,
    DestroyWebRtcTransport,
    DestroyPlainTransport,
    Connect,
    Produce,
    Consume,
    DataProduce,
    DataConsume,
    ProducerList,
    DataProducerList,
    PauseProducer,
    ResumeProducer,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        MessageType::GetSessionList,
        MessageType::CreateSession,
        MessageType::DestroySession,
        MessageType::RtpCapabilities,
        MessageType::CreateWebRtcTransport,
        MessageType::CreatePlainTransport,
        MessageType::DestroyWebRtcTransport,
        MessageType::DestroyPlainTransport,
        MessageType::Connect,
        MessageType::Produce,
        MessageType::Consume,
        MessageType::DataProduce,
        MessageType::DataConsume,
        MessageType::ProducerList,
        MessageType::DataProducerList,
        MessageType::PauseProducer,
        MessageType::ResumeProducer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::GetSessionList => "getSessionList",
            MessageType::CreateSession => "createSession",
            MessageType::DestroySession => "destroySession",
            MessageType::RtpCapabilities => "rtpCapabilities",
            MessageType::CreateWebRtcTransport => "createWebRtcTransport",
            MessageType::CreatePlainTransport => "createPlainTransport",
            MessageType::DestroyWebRtcTransport => "destroyWebRtcTransport",
            MessageType::DestroyPlainTransport => "destroyPlainTransport",
            MessageType::Connect => "connect",
            MessageType::Produce => "produce",
            MessageType::Consume => "consume",
            MessageType::DataProduce => "dataProduce",
            MessageType::DataConsume => "dataConsume",
            MessageType::ProducerList => "producerList",
            MessageType::DataProducerList => "dataProducerList",
            MessageType::PauseProducer => "pauseProducer",
            MessageType::ResumeProducer => "resumeProducer",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a frame names a type this protocol does not know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageType(pub String);

impl fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message type '{}'", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// Server-initiated messages (sent without a correlation id)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationType {
    NewProducer,
    NewDataProducer,
    SessionClosed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::NewProducer => "newProducer",
            NotificationType::NewDataProducer => "newDataProducer",
            NotificationType::SessionClosed => "sessionClosed",
        }
    }
}

/// Stable error codes carried in error envelopes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    SessionNotFound,
    TransportNotFound,
    ProducerNotFound,
    DataProducerNotFound,
    SessionExists,
    BadRequest,
    CannotConsume,
    EngineError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionNotFound => "sessionNotFound",
            ErrorCode::TransportNotFound => "transportNotFound",
            ErrorCode::ProducerNotFound => "producerNotFound",
            ErrorCode::DataProducerNotFound => "dataProducerNotFound",
            ErrorCode::SessionExists => "sessionExists",
            ErrorCode::BadRequest => "badRequest",
            ErrorCode::CannotConsume => "cannotConsume",
            ErrorCode::EngineError => "engineError",
        }
    }
}

// Envelopes

/// Inbound request frame
///
/// `message_type` stays a plain string here so that an unknown type can be
/// told apart from a malformed frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Reply, error or notification frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    pub fn success(uuid: Option<String>, message_type: &str, payload: Value) -> Self {
        Self {
            uuid,
            message_type: message_type.to_string(),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(uuid: Option<String>, message_type: &str, error: ErrorBody) -> Self {
        Self {
            uuid,
            message_type: message_type.to_string(),
            payload: None,
            error: Some(error),
        }
    }

    pub fn notification(kind: NotificationType, payload: Value) -> Self {
        Self {
            uuid: None,
            message_type: kind.as_str().to_string(),
            payload: Some(payload),
            error: None,
        }
    }
}

// Request payloads

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebRtcTransportRequest {
    /// Overrides the server's SCTP default (needed for data channels)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_sctp: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlainTransportRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_mux: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comedia: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRef {
    #[serde(alias = "id")]
    pub transport_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(alias = "id")]
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtls_parameters: Option<DtlsParameters>,
    /// Remote address for plain transports without comedia
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    #[serde(alias = "id")]
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    #[serde(alias = "id")]
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProduceRequest {
    #[serde(alias = "id")]
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumeRequest {
    #[serde(alias = "id")]
    pub transport_id: String,
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    #[serde(alias = "id")]
    pub producer_id: String,
}

// Response payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionCreatedResponse {
    pub id: String,
    pub name: String,
}

/// Acknowledges an operation on a single resource (destroy, connect)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceAck {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesResponse {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportResponse {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportResponse {
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumeResponse {
    pub id: String,
    pub data_producer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerListResponse {
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerListResponse {
    pub data_producers: Vec<DataProducerInfo>,
}

/// Reply to pause/resume; `paused` is absent when the producer was unknown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProducerStateResponse {
    pub id: String,
    #[serde(default)]
    pub paused: Option<bool>,
}

// Notification payloads

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerNotification {
    pub session_id: String,
    pub producer: ProducerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataProducerNotification {
    pub session_id: String,
    pub data_producer: DataProducerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosedNotification {
    pub session_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_type_names_match_serde() {
        for t in MessageType::ALL {
            let value = serde_json::to_value(t).unwrap();
            assert_eq!(value, Value::String(t.as_str().to_string()));
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let err = "joinRoom".parse::<MessageType>().unwrap_err();
        assert_eq!(err, UnknownMessageType("joinRoom".into()));
    }

    #[test]
    fn request_without_session_or_payload_parses() {
        let req: RequestEnvelope =
            serde_json::from_str(r#"{"type":"getSessionList","uuid":"u-1"}"#).unwrap();
        assert_eq!(req.id, None);
        assert_eq!(req.uuid.as_deref(), Some("u-1"));
        assert_eq!(req.payload, Value::Null);
    }

    #[test]
    fn error_envelope_omits_payload() {
        let env = ResponseEnvelope::failure(
            Some("u-2".into()),
            "rtpCapabilities",
            ErrorBody::new(ErrorCode::SessionNotFound, "session 'x' not found"),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "uuid": "u-2",
                "type": "rtpCapabilities",
                "error": { "code": "sessionNotFound", "message": "session 'x' not found" }
            })
        );
    }

    #[test]
    fn transport_payload_accepts_legacy_id_field() {
        let req: TransportRef = serde_json::from_value(json!({ "id": "t-1" })).unwrap();
        assert_eq!(req.transport_id, "t-1");

        let req: TransportRef = serde_json::from_value(json!({ "transportId": "t-2" })).unwrap();
        assert_eq!(req.transport_id, "t-2");
    }

    #[test]
    fn notification_has_no_correlation_id() {
        let env = ResponseEnvelope::notification(NotificationType::SessionClosed, json!({}));
        let value = serde_json::to_value(&env).unwrap();
        assert!(value.get("uuid").is_none());
        assert_eq!(value["type"], "sessionClosed");
    }
}
