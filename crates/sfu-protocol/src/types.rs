use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Network path flavour of a transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebRtc,
    Plain,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebRtc => f.write_str("webrtc"),
            TransportKind::Plain => f.write_str("plain"),
        }
    }
}

// Capabilities

/// A codec a router (or an endpoint) is able to send or receive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Whether `mime_type` and clock rate describe the same codec (case-insensitive mime).
    pub fn matches(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type) && self.clock_rate == clock_rate
    }
}

/// Capability descriptor exchanged before consuming
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    pub fn supports(&self, kind: MediaKind, mime_type: &str, clock_rate: u32) -> bool {
        self.codecs
            .iter()
            .any(|c| c.kind == kind && c.matches(mime_type, clock_rate))
    }
}

// RTP parameters

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecParameters {
    /// Retransmission and FEC entries never carry media on their own.
    pub fn is_media_codec(&self) -> bool {
        let subtype = self
            .mime_type
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        !matches!(subtype.as_str(), "rtx" | "red" | "ulpfec" | "flexfec")
    }
}

/// Parameters describing an RTP stream sent by a producer or received by a consumer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

// ICE / DTLS / SCTP

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    pub port: u16,
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
    pub max_message_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SctpStreamParameters {
    pub stream_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_packet_life_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retransmits: Option<u32>,
}

// Resource descriptions

/// Session summary as listed by `getSessionList`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub transport_count: usize,
    pub producer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerInfo {
    pub id: String,
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    #[serde(default)]
    pub app_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capability_match_ignores_mime_case() {
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }
            ]
        }))
        .unwrap();

        assert!(caps.supports(MediaKind::Audio, "audio/OPUS", 48000));
        assert!(!caps.supports(MediaKind::Video, "audio/opus", 48000));
        assert!(!caps.supports(MediaKind::Audio, "audio/opus", 8000));
    }

    #[test]
    fn rtx_is_not_a_media_codec() {
        let rtx = RtpCodecParameters {
            mime_type: "video/rtx".into(),
            payload_type: 97,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: vec![],
        };
        assert!(!rtx.is_media_codec());

        let vp8 = RtpCodecParameters {
            mime_type: "video/VP8".into(),
            ..rtx
        };
        assert!(vp8.is_media_codec());
    }

    #[test]
    fn sctp_parameters_use_uppercase_stream_counts() {
        let params = SctpParameters {
            port: 5000,
            os: 1024,
            mis: 1024,
            max_message_size: 262144,
        };
        let value = serde_json::to_value(params).unwrap();
        assert_eq!(value["OS"], 1024);
        assert_eq!(value["maxMessageSize"], 262144);
    }
}
