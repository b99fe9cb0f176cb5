//! Media engine boundary
//!
//! The SFU engine (workers, routers, RTP forwarding) is an external
//! collaborator. The session manager only talks to it through these traits
//! and learns about objects closing on their own through [`EngineEvent`]s.
//!
//! [`MediasoupEngine`] drives real mediasoup workers. The loopback engine,
//! built for tests and behind the `loopback` feature, keeps the same contract
//! without moving media.

#[cfg(any(test, feature = "loopback"))]
mod loopback;
mod mediasoup_engine;

#[cfg(any(test, feature = "loopback"))]
pub use loopback::{LoopbackEngine, LoopbackWorker};
pub use mediasoup_engine::MediasoupEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sfu_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, SctpParameters, SctpStreamParameters, TransportKind,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("no free port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("transport already connected")]
    AlreadyConnected,

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The engine refused or failed a request
    #[error("engine request failed: {0}")]
    Request(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Lifecycle notifications emitted by engine objects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The worker process went away; everything under it is gone
    WorkerDied { reason: String },
    RouterClosed { router_id: String },
    TransportClosed { transport_id: String },
    ProducerClosed { producer_id: String },
    ConsumerClosed { consumer_id: String },
    DataProducerClosed { data_producer_id: String },
    DataConsumerClosed { data_consumer_id: String },
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

// Options

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 40000,
            rtc_max_port: 40100,
            log_level: "warn".to_string(),
            log_tags: [
                "info",
                "ice",
                "dtls",
                "rtp",
                "srtp",
                "rtcp",
                "rtx",
                "bwe",
                "score",
                "simulcast",
                "svc",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    #[serde(default)]
    pub announced_ip: Option<String>,
}

impl ListenIp {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            announced_ip: None,
        }
    }

    /// Address handed to the far end
    pub fn public_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.ip)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: u16,
    pub max_sctp_message_size: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ips: vec![ListenIp::new("127.0.0.1"), ListenIp::new("0.0.0.0")],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
            num_sctp_streams: 1024,
            max_sctp_message_size: 262144,
            initial_available_outgoing_bitrate: 100_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

/// Connection parameters handed back to the far end after transport creation
#[derive(Debug, Clone, PartialEq)]
pub enum TransportParameters {
    WebRtc {
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        sctp_parameters: Option<SctpParameters>,
    },
    Plain {
        ip: String,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TransportConnectParams {
    pub dtls_parameters: Option<DtlsParameters>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub rtcp_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct DataProducerOptions {
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct DataConsumerOptions {
    pub data_producer_id: String,
}

// Objects

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Spawn a worker; every object created beneath it reports closure on `events`
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn Worker>>;
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn pid(&self) -> u32;
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn Router>>;
    fn close(&self);
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &str;
    fn rtp_capabilities(&self) -> RtpCapabilities;
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;
    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>>;
    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>>;
    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TransportKind;
    fn parameters(&self) -> TransportParameters;
    async fn connect(&self, params: TransportConnectParams) -> EngineResult<()>;
    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn Producer>>;
    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn Consumer>>;
    async fn produce_data(
        &self,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn DataProducer>>;
    async fn consume_data(
        &self,
        options: DataConsumerOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>>;
    fn close(&self);
}

#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn app_data(&self) -> &Value;
    fn paused(&self) -> bool;
    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    fn close(&self);
}

pub trait Consumer: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> &RtpParameters;
    fn paused(&self) -> bool;
    fn close(&self);
}

pub trait DataProducer: Send + Sync {
    fn id(&self) -> &str;
    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters>;
    fn label(&self) -> &str;
    fn protocol(&self) -> &str;
    fn app_data(&self) -> &Value;
    fn close(&self);
}

pub trait DataConsumer: Send + Sync {
    fn id(&self) -> &str;
    fn data_producer_id(&self) -> &str;
    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters>;
    fn label(&self) -> &str;
    fn protocol(&self) -> &str;
    fn close(&self);
}
