//! mediasoup engine
//!
//! Runs mediasoup workers in process through the `mediasoup` crate. Each
//! wrapper holds the mediasoup handle next to protocol-shaped copies of the
//! ids and parameters the session index reads. Dropping a handle closes the
//! object inside the worker, and every object reports that on the session's
//! event channel.
//!
//! Parameters cross the boundary as JSON: both sides speak the mediasoup wire
//! shape, so a serde round trip is the conversion.

use super::{
    Consumer, ConsumerOptions, DataConsumer, DataConsumerOptions, DataProducer,
    DataProducerOptions, EngineError, EngineEvent, EngineEventSender, EngineResult, ListenIp,
    MediaEngine, PlainTransportOptions, Producer, ProducerOptions, Router, Transport,
    TransportConnectParams, TransportParameters, WebRtcTransportOptions, Worker, WorkerSettings,
};
use ::mediasoup::data_structures::{ListenInfo, Protocol};
use ::mediasoup::prelude as ms;
use ::mediasoup::prelude::Transport as _;
use ::mediasoup::rtp_parameters as rtp;
use ::mediasoup::sctp_parameters::NumSctpStreams;
use ::mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sfu_protocol::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, SctpParameters, SctpStreamParameters, TransportKind,
};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn request_failed(error: impl std::fmt::Display) -> EngineError {
    EngineError::Request(error.to_string())
}

fn to_json<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::InvalidParameters(e.to_string()))
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> EngineResult<T> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidParameters(format!("{}: {}", what, e)))
}

/// Convert between the protocol types and mediasoup's through their shared JSON shape
fn convert<S: Serialize, T: DeserializeOwned>(what: &str, value: &S) -> EngineResult<T> {
    decode(what, to_json(value)?)
}

/// Closure that reports `event` once the mediasoup object is gone
fn notify_closed(events: &EngineEventSender, event: EngineEvent) -> Box<dyn FnOnce() + Send> {
    let events = events.clone();
    Box::new(move || {
        let _ = events.send(event);
    })
}

fn engine_kind(kind: MediaKind) -> rtp::MediaKind {
    match kind {
        MediaKind::Audio => rtp::MediaKind::Audio,
        MediaKind::Video => rtp::MediaKind::Video,
    }
}

fn protocol_kind(kind: rtp::MediaKind) -> MediaKind {
    match kind {
        rtp::MediaKind::Audio => MediaKind::Audio,
        rtp::MediaKind::Video => MediaKind::Video,
    }
}

// JSON shaping

fn fill_defaults(value: &mut Value, defaults: &[(&str, Value)]) {
    if let Value::Object(map) = value {
        for (key, default) in defaults {
            map.entry(key.to_string()).or_insert_with(|| default.clone());
        }
    }
}

/// mediasoup wants `parameters` and `rtcpFeedback` present and a channel count on audio codecs
fn complete_codec(codec: &mut Value) {
    let audio = codec
        .get("mimeType")
        .and_then(Value::as_str)
        .is_some_and(|mime| mime.to_ascii_lowercase().starts_with("audio/"));
    fill_defaults(codec, &[("parameters", json!({})), ("rtcpFeedback", json!([]))]);
    if audio {
        fill_defaults(codec, &[("channels", json!(1))]);
    }
}

fn complete_codecs(value: &mut Value) {
    if let Some(codecs) = value.get_mut("codecs").and_then(Value::as_array_mut) {
        codecs.iter_mut().for_each(complete_codec);
    }
}

/// Drop the entries of `value[key]` mediasoup does not understand
fn retain_known<T: DeserializeOwned>(value: &mut Value, key: &str) {
    if let Some(entries) = value.get_mut(key).and_then(Value::as_array_mut) {
        entries.retain(|entry| {
            let known = serde_json::from_value::<T>(entry.clone()).is_ok();
            if !known {
                tracing::debug!("Skipping unsupported {} entry {}", key, entry);
            }
            known
        });
    }
}

fn engine_media_codecs(
    codecs: &[RtpCodecCapability],
) -> EngineResult<Vec<rtp::RtpCodecCapability>> {
    codecs
        .iter()
        .map(|codec| {
            let mut value = to_json(codec)?;
            complete_codec(&mut value);
            decode("mediaCodecs", value)
        })
        .collect()
}

fn engine_rtp_parameters(parameters: &RtpParameters) -> EngineResult<rtp::RtpParameters> {
    let mut value = to_json(parameters)?;
    complete_codecs(&mut value);
    fill_defaults(
        &mut value,
        &[
            ("headerExtensions", json!([])),
            ("encodings", json!([])),
            ("rtcp", json!({ "reducedSize": true })),
        ],
    );
    decode("rtpParameters", value)
}

/// Remote capabilities often list codecs and extensions the engine has never
/// heard of; those are skipped rather than failing the whole set.
fn engine_rtp_capabilities(
    capabilities: &RtpCapabilities,
) -> EngineResult<rtp::RtpCapabilities> {
    let mut value = to_json(capabilities)?;
    complete_codecs(&mut value);
    retain_known::<rtp::RtpCodecCapability>(&mut value, "codecs");
    retain_known::<rtp::RtpHeaderExtension>(&mut value, "headerExtensions");
    decode("rtpCapabilities", value)
}

fn str_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_str))
}

fn u64_field(value: &Value, names: &[&str]) -> Option<u64> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_u64))
}

fn missing(what: &str) -> EngineError {
    EngineError::Request(format!("engine returned no {}", what))
}

fn ice_parameters(value: &Value) -> EngineResult<IceParameters> {
    Ok(IceParameters {
        username_fragment: str_field(value, &["usernameFragment"])
            .ok_or_else(|| missing("usernameFragment"))?
            .to_string(),
        password: str_field(value, &["password"])
            .ok_or_else(|| missing("password"))?
            .to_string(),
        ice_lite: value
            .get("iceLite")
            .and_then(Value::as_bool)
            .unwrap_or(true),
    })
}

fn ice_candidate(value: &Value) -> EngineResult<IceCandidate> {
    let port = u64_field(value, &["port"]).ok_or_else(|| missing("candidate port"))?;
    Ok(IceCandidate {
        foundation: str_field(value, &["foundation"])
            .unwrap_or_default()
            .to_string(),
        priority: u64_field(value, &["priority"])
            .and_then(|p| u32::try_from(p).ok())
            .unwrap_or_default(),
        ip: str_field(value, &["address", "ip"])
            .ok_or_else(|| missing("candidate address"))?
            .to_string(),
        protocol: str_field(value, &["protocol"]).unwrap_or("udp").to_string(),
        port: u16::try_from(port).map_err(|_| missing("valid candidate port"))?,
        candidate_type: str_field(value, &["type"]).unwrap_or("host").to_string(),
        tcp_type: str_field(value, &["tcpType"]).map(String::from),
    })
}

fn sctp_parameters(value: &Value) -> Option<SctpParameters> {
    Some(SctpParameters {
        port: u64_field(value, &["port"]).and_then(|v| u16::try_from(v).ok())?,
        os: u64_field(value, &["OS", "os"]).and_then(|v| u16::try_from(v).ok())?,
        mis: u64_field(value, &["MIS", "mis"]).and_then(|v| u16::try_from(v).ok())?,
        max_message_size: u64_field(value, &["maxMessageSize"])
            .and_then(|v| u32::try_from(v).ok())?,
    })
}

/// Local address and port of a plain transport tuple
fn tuple_endpoint(value: &Value) -> Option<(String, u16)> {
    let ip = str_field(value, &["localAddress", "localIp"])?;
    let port = u64_field(value, &["localPort"]).and_then(|v| u16::try_from(v).ok())?;
    Some((ip.to_string(), port))
}

fn listen_info(
    protocol: Protocol,
    listen: &ListenIp,
    ports: &RangeInclusive<u16>,
) -> EngineResult<ListenInfo> {
    let ip: IpAddr = listen
        .ip
        .parse()
        .map_err(|_| EngineError::InvalidParameters(format!("invalid listen ip '{}'", listen.ip)))?;
    Ok(ListenInfo {
        protocol,
        ip,
        announced_address: listen.announced_ip.clone(),
        expose_internal_ip: false,
        port: None,
        port_range: Some(ports.clone()),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    })
}

fn worker_settings(settings: &WorkerSettings) -> EngineResult<ms::WorkerSettings> {
    if settings.rtc_min_port > settings.rtc_max_port {
        return Err(EngineError::InvalidParameters(format!(
            "rtc port range {}-{} is empty",
            settings.rtc_min_port, settings.rtc_max_port
        )));
    }

    let mut worker_settings = ms::WorkerSettings::default();
    match serde_json::from_value::<WorkerLogLevel>(Value::String(settings.log_level.clone())) {
        Ok(level) => worker_settings.log_level = level,
        Err(_) => tracing::warn!("Unknown worker log level '{}'", settings.log_level),
    }
    worker_settings.log_tags = settings
        .log_tags
        .iter()
        .filter_map(|tag| {
            let parsed = serde_json::from_value::<WorkerLogTag>(Value::String(tag.clone()));
            if parsed.is_err() {
                tracing::warn!("Unknown worker log tag '{}'", tag);
            }
            parsed.ok()
        })
        .collect();
    Ok(worker_settings)
}

// Engine

pub struct MediasoupEngine {
    manager: ms::WorkerManager,
    next_pid: AtomicU32,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: ms::WorkerManager::new(),
            next_pid: AtomicU32::new(1),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn Worker>> {
        let worker = self
            .manager
            .create_worker(worker_settings(settings)?)
            .await
            .map_err(|e| EngineError::Request(format!("failed to start worker: {}", e)))?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let dead_events = events.clone();
        worker
            .on_dead(move |exit| {
                let reason = match exit {
                    Ok(()) => "exited".to_string(),
                    Err(error) => format!("{:?}", error),
                };
                let _ = dead_events.send(EngineEvent::WorkerDied { reason });
            })
            .detach();

        tracing::debug!("mediasoup worker {} started", pid);
        Ok(Arc::new(MediasoupWorker {
            pid,
            ports: settings.rtc_min_port..=settings.rtc_max_port,
            events,
            handle: Mutex::new(Some(worker)),
        }))
    }
}

struct MediasoupWorker {
    pid: u32,
    ports: RangeInclusive<u16>,
    events: EngineEventSender,
    handle: Mutex<Option<ms::Worker>>,
}

#[async_trait]
impl Worker for MediasoupWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn Router>> {
        let worker = lock(&self.handle)
            .clone()
            .ok_or(EngineError::Closed("worker"))?;
        let router = worker
            .create_router(ms::RouterOptions::new(engine_media_codecs(media_codecs)?))
            .await
            .map_err(request_failed)?;

        let id = router.id().to_string();
        let rtp_capabilities: RtpCapabilities =
            convert("router rtpCapabilities", router.rtp_capabilities())?;
        router
            .on_close(notify_closed(
                &self.events,
                EngineEvent::RouterClosed {
                    router_id: id.clone(),
                },
            ))
            .detach();

        Ok(Arc::new(MediasoupRouter {
            id,
            rtp_capabilities,
            ports: self.ports.clone(),
            events: self.events.clone(),
            handle: Mutex::new(Some(router)),
        }))
    }

    fn close(&self) {
        if lock(&self.handle).take().is_some() {
            tracing::debug!("mediasoup worker {} closed", self.pid);
        }
    }
}

struct MediasoupRouter {
    id: String,
    rtp_capabilities: RtpCapabilities,
    ports: RangeInclusive<u16>,
    events: EngineEventSender,
    handle: Mutex<Option<ms::Router>>,
}

impl MediasoupRouter {
    fn router(&self) -> EngineResult<ms::Router> {
        lock(&self.handle)
            .clone()
            .ok_or(EngineError::Closed("router"))
    }

    fn wrap_transport(
        &self,
        kind: TransportKind,
        parameters: TransportParameters,
        handle: TransportHandle,
    ) -> Arc<dyn Transport> {
        let id = handle.id();
        handle.on_close(notify_closed(
            &self.events,
            EngineEvent::TransportClosed {
                transport_id: id.clone(),
            },
        ));
        Arc::new(MediasoupTransport {
            id,
            kind,
            parameters,
            events: self.events.clone(),
            connected: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl Router for MediasoupRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ms::ProducerId>() else {
            return false;
        };
        match engine_rtp_capabilities(rtp_capabilities) {
            Ok(capabilities) => router.can_consume(&producer_id, &capabilities),
            Err(e) => {
                tracing::debug!("Unusable rtpCapabilities: {}", e);
                false
            }
        }
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        let router = self.router()?;

        let mut protocols = Vec::new();
        if options.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if options.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        let mut infos = Vec::new();
        for listen in &options.listen_ips {
            for protocol in &protocols {
                infos.push(listen_info(*protocol, listen, &self.ports)?);
            }
        }
        let mut infos = infos.into_iter();
        let Some(first) = infos.next() else {
            return Err(EngineError::InvalidParameters(
                "no listen ip with UDP or TCP enabled".to_string(),
            ));
        };
        let listen_infos =
            infos.fold(ms::WebRtcTransportListenInfos::new(first), |all, info| all.insert(info));

        let mut transport_options = ms::WebRtcTransportOptions::new(listen_infos);
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.enable_sctp = options.enable_sctp;
        transport_options.num_sctp_streams = NumSctpStreams {
            os: options.num_sctp_streams,
            mis: options.num_sctp_streams,
        };
        transport_options.max_sctp_message_size = options.max_sctp_message_size;
        transport_options.initial_available_outgoing_bitrate =
            options.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(request_failed)?;

        let candidates = to_json(transport.ice_candidates())?;
        let ice_candidates = candidates
            .as_array()
            .map(|all| all.iter().map(ice_candidate).collect::<EngineResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        let sctp = to_json(&transport.sctp_parameters())?;
        let parameters = TransportParameters::WebRtc {
            ice_parameters: ice_parameters(&to_json(transport.ice_parameters())?)?,
            ice_candidates,
            dtls_parameters: convert("dtlsParameters", &transport.dtls_parameters())?,
            sctp_parameters: sctp_parameters(&sctp),
        };

        Ok(self.wrap_transport(
            TransportKind::WebRtc,
            parameters,
            TransportHandle::WebRtc(transport),
        ))
    }

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        let router = self.router()?;

        let mut transport_options = ms::PlainTransportOptions::new(listen_info(
            Protocol::Udp,
            &options.listen_ip,
            &self.ports,
        )?);
        transport_options.rtcp_mux = options.rtcp_mux;
        transport_options.comedia = options.comedia;

        let transport = router
            .create_plain_transport(transport_options)
            .await
            .map_err(request_failed)?;

        let (ip, port) =
            tuple_endpoint(&to_json(&transport.tuple())?).ok_or_else(|| missing("tuple"))?;
        let rtcp_port = transport
            .rtcp_tuple()
            .map(|tuple| to_json(&tuple))
            .transpose()?
            .and_then(|tuple| tuple_endpoint(&tuple))
            .map(|(_, port)| port);
        let parameters = TransportParameters::Plain {
            ip: options
                .listen_ip
                .announced_ip
                .clone()
                .unwrap_or(ip),
            port,
            rtcp_port,
        };

        Ok(self.wrap_transport(
            TransportKind::Plain,
            parameters,
            TransportHandle::Plain(transport),
        ))
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

#[derive(Clone)]
enum TransportHandle {
    WebRtc(ms::WebRtcTransport),
    Plain(ms::PlainTransport),
}

impl TransportHandle {
    fn id(&self) -> String {
        match self {
            Self::WebRtc(transport) => transport.id().to_string(),
            Self::Plain(transport) => transport.id().to_string(),
        }
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        match self {
            Self::WebRtc(transport) => transport.on_close(callback).detach(),
            Self::Plain(transport) => transport.on_close(callback).detach(),
        }
    }

    async fn produce(&self, options: ms::ProducerOptions) -> EngineResult<ms::Producer> {
        match self {
            Self::WebRtc(transport) => transport.produce(options).await,
            Self::Plain(transport) => transport.produce(options).await,
        }
        .map_err(request_failed)
    }

    async fn consume(&self, options: ms::ConsumerOptions) -> EngineResult<ms::Consumer> {
        match self {
            Self::WebRtc(transport) => transport.consume(options).await,
            Self::Plain(transport) => transport.consume(options).await,
        }
        .map_err(request_failed)
    }

    async fn produce_data(
        &self,
        options: ms::DataProducerOptions,
    ) -> EngineResult<ms::DataProducer> {
        match self {
            Self::WebRtc(transport) => transport.produce_data(options).await,
            Self::Plain(transport) => transport.produce_data(options).await,
        }
        .map_err(request_failed)
    }

    async fn consume_data(
        &self,
        options: ms::DataConsumerOptions,
    ) -> EngineResult<ms::DataConsumer> {
        match self {
            Self::WebRtc(transport) => transport.consume_data(options).await,
            Self::Plain(transport) => transport.consume_data(options).await,
        }
        .map_err(request_failed)
    }
}

struct MediasoupTransport {
    id: String,
    kind: TransportKind,
    parameters: TransportParameters,
    events: EngineEventSender,
    connected: AtomicBool,
    handle: Mutex<Option<TransportHandle>>,
}

impl MediasoupTransport {
    fn transport(&self) -> EngineResult<TransportHandle> {
        lock(&self.handle)
            .clone()
            .ok_or(EngineError::Closed("transport"))
    }
}

#[async_trait]
impl Transport for MediasoupTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn parameters(&self) -> TransportParameters {
        self.parameters.clone()
    }

    async fn connect(&self, params: TransportConnectParams) -> EngineResult<()> {
        let transport = self.transport()?;
        if self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected);
        }

        match &transport {
            TransportHandle::WebRtc(webrtc) => {
                let dtls: &DtlsParameters = params.dtls_parameters.as_ref().ok_or_else(|| {
                    EngineError::InvalidParameters("dtlsParameters required".to_string())
                })?;
                webrtc
                    .connect(ms::WebRtcTransportRemoteParameters {
                        dtls_parameters: convert("dtlsParameters", dtls)?,
                    })
                    .await
                    .map_err(request_failed)?;
            }
            TransportHandle::Plain(plain) => {
                let ip = params
                    .ip
                    .as_deref()
                    .map(|ip| {
                        ip.parse::<IpAddr>().map_err(|_| {
                            EngineError::InvalidParameters(format!("invalid ip '{}'", ip))
                        })
                    })
                    .transpose()?;
                plain
                    .connect(ms::PlainTransportRemoteParameters {
                        ip,
                        port: params.port,
                        rtcp_port: params.rtcp_port,
                        srtp_parameters: None,
                    })
                    .await
                    .map_err(request_failed)?;
            }
        }

        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected);
        }
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn Producer>> {
        let transport = self.transport()?;

        let mut producer_options = ms::ProducerOptions::new(
            engine_kind(options.kind),
            engine_rtp_parameters(&options.rtp_parameters)?,
        );
        producer_options.paused = options.paused;
        let producer = transport.produce(producer_options).await?;

        let id = producer.id().to_string();
        producer
            .on_close(notify_closed(
                &self.events,
                EngineEvent::ProducerClosed {
                    producer_id: id.clone(),
                },
            ))
            .detach();

        Ok(Arc::new(MediasoupProducer {
            id,
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            handle: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn Consumer>> {
        let transport = self.transport()?;

        let producer_id = options
            .producer_id
            .parse::<ms::ProducerId>()
            .map_err(|_| EngineError::NotFound {
                kind: "producer",
                id: options.producer_id.clone(),
            })?;
        let mut consumer_options = ms::ConsumerOptions::new(
            producer_id,
            engine_rtp_capabilities(&options.rtp_capabilities)?,
        );
        consumer_options.paused = options.paused;
        let consumer = transport.consume(consumer_options).await?;

        let id = consumer.id().to_string();
        let rtp_parameters: RtpParameters =
            convert("consumer rtpParameters", consumer.rtp_parameters())?;
        consumer
            .on_close(notify_closed(
                &self.events,
                EngineEvent::ConsumerClosed {
                    consumer_id: id.clone(),
                },
            ))
            .detach();

        Ok(Arc::new(MediasoupConsumer {
            id,
            producer_id: options.producer_id,
            kind: protocol_kind(consumer.kind()),
            rtp_parameters,
            handle: Mutex::new(Some(consumer)),
        }))
    }

    async fn produce_data(
        &self,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn DataProducer>> {
        let transport = self.transport()?;

        let mut data_options = match &options.sctp_stream_parameters {
            Some(stream) => {
                ms::DataProducerOptions::new_sctp(convert("sctpStreamParameters", stream)?)
            }
            None => {
                return Err(EngineError::InvalidParameters(
                    "sctpStreamParameters required".to_string(),
                ));
            }
        };
        data_options.label = options.label.clone();
        data_options.protocol = options.protocol.clone();
        let data_producer = transport.produce_data(data_options).await?;

        let id = data_producer.id().to_string();
        data_producer
            .on_close(notify_closed(
                &self.events,
                EngineEvent::DataProducerClosed {
                    data_producer_id: id.clone(),
                },
            ))
            .detach();

        Ok(Arc::new(MediasoupDataProducer {
            id,
            sctp_stream_parameters: options.sctp_stream_parameters,
            label: options.label,
            protocol: options.protocol,
            app_data: options.app_data,
            handle: Mutex::new(Some(data_producer)),
        }))
    }

    async fn consume_data(
        &self,
        options: DataConsumerOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>> {
        let transport = self.transport()?;

        let data_producer_id = options
            .data_producer_id
            .parse::<ms::DataProducerId>()
            .map_err(|_| EngineError::NotFound {
                kind: "dataProducer",
                id: options.data_producer_id.clone(),
            })?;
        let data_consumer = transport
            .consume_data(ms::DataConsumerOptions::new_sctp(data_producer_id))
            .await?;

        let id = data_consumer.id().to_string();
        let sctp_stream_parameters = data_consumer
            .sctp_stream_parameters()
            .map(|stream| convert("sctpStreamParameters", &stream))
            .transpose()?;
        data_consumer
            .on_close(notify_closed(
                &self.events,
                EngineEvent::DataConsumerClosed {
                    data_consumer_id: id.clone(),
                },
            ))
            .detach();

        Ok(Arc::new(MediasoupDataConsumer {
            id,
            data_producer_id: options.data_producer_id,
            sctp_stream_parameters,
            label: data_consumer.label().to_string(),
            protocol: data_consumer.protocol().to_string(),
            handle: Mutex::new(Some(data_consumer)),
        }))
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: Value,
    handle: Mutex<Option<ms::Producer>>,
}

impl MediasoupProducer {
    fn producer(&self) -> EngineResult<ms::Producer> {
        lock(&self.handle)
            .clone()
            .ok_or(EngineError::Closed("producer"))
    }
}

#[async_trait]
impl Producer for MediasoupProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn app_data(&self) -> &Value {
        &self.app_data
    }

    fn paused(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|producer| producer.paused())
    }

    async fn pause(&self) -> EngineResult<()> {
        self.producer()?.pause().await.map_err(request_failed)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.producer()?.resume().await.map_err(request_failed)
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    handle: Mutex<Option<ms::Consumer>>,
}

impl Consumer for MediasoupConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn paused(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|consumer| consumer.paused())
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

struct MediasoupDataProducer {
    id: String,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    app_data: Value,
    handle: Mutex<Option<ms::DataProducer>>,
}

impl DataProducer for MediasoupDataProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.sctp_stream_parameters
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn app_data(&self) -> &Value {
        &self.app_data
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

struct MediasoupDataConsumer {
    id: String,
    data_producer_id: String,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    handle: Mutex<Option<ms::DataConsumer>>,
}

impl DataConsumer for MediasoupDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.sctp_stream_parameters
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn close(&self) {
        lock(&self.handle).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use sfu_protocol::RtpCodecParameters;
    use tokio::sync::mpsc;

    #[test]
    fn audio_codecs_get_channel_and_list_defaults() {
        let mut codec = json!({ "kind": "audio", "mimeType": "audio/PCMU", "clockRate": 8000 });
        complete_codec(&mut codec);
        assert_eq!(codec["channels"], 1);
        assert_eq!(codec["parameters"], json!({}));
        assert_eq!(codec["rtcpFeedback"], json!([]));

        let mut video = json!({ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 });
        complete_codec(&mut video);
        assert!(video.get("channels").is_none());
    }

    #[test]
    fn default_media_codecs_are_accepted() {
        let codecs = engine_media_codecs(&default_media_codecs()).unwrap();
        assert_eq!(codecs.len(), default_media_codecs().len());
    }

    #[test]
    fn unknown_capability_codecs_are_skipped() {
        let mut capabilities = RtpCapabilities {
            codecs: default_media_codecs(),
            header_extensions: vec![json!({ "nonsense": true })],
        };
        capabilities.codecs.push(RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/made-up".into(),
            preferred_payload_type: Some(120),
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![],
        });

        let converted = to_json(&engine_rtp_capabilities(&capabilities).unwrap()).unwrap();
        let codecs = converted["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), default_media_codecs().len());
        assert!(converted["headerExtensions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn producer_parameters_get_rtcp_defaults() {
        let parameters = RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".into(),
                payload_type: 100,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Default::default(),
                rtcp_feedback: vec![],
            }],
            encodings: vec![json!({ "ssrc": 1111 })],
            ..Default::default()
        };

        let converted = to_json(&engine_rtp_parameters(&parameters).unwrap()).unwrap();
        assert_eq!(converted["codecs"][0]["payloadType"], 100);
        assert_eq!(converted["encodings"][0]["ssrc"], 1111);
        assert_eq!(converted["rtcp"]["reducedSize"], true);
    }

    #[test]
    fn candidates_accept_address_or_ip() {
        let current = json!({
            "foundation": "udpcandidate", "priority": 1076302079u64, "address": "10.0.0.1",
            "protocol": "udp", "port": 40001, "type": "host"
        });
        let older = json!({
            "foundation": "tcpcandidate", "priority": 1076276479u64, "ip": "10.0.0.2",
            "protocol": "tcp", "port": 40002, "type": "host", "tcpType": "passive"
        });

        let current = ice_candidate(&current).unwrap();
        assert_eq!(current.ip, "10.0.0.1");
        assert_eq!(current.port, 40001);
        assert_eq!(current.tcp_type, None);

        let older = ice_candidate(&older).unwrap();
        assert_eq!(older.ip, "10.0.0.2");
        assert_eq!(older.tcp_type.as_deref(), Some("passive"));

        assert!(ice_candidate(&json!({ "address": "10.0.0.3" })).is_err());
    }

    #[test]
    fn sctp_and_tuple_fields_are_read() {
        let sctp = json!({ "port": 5000, "OS": 1024, "MIS": 1024, "maxMessageSize": 262144 });
        assert_eq!(
            sctp_parameters(&sctp),
            Some(SctpParameters {
                port: 5000,
                os: 1024,
                mis: 1024,
                max_message_size: 262144
            })
        );
        assert_eq!(sctp_parameters(&Value::Null), None);

        let tuple = json!({ "localAddress": "127.0.0.1", "localPort": 40010, "protocol": "udp" });
        assert_eq!(tuple_endpoint(&tuple), Some(("127.0.0.1".to_string(), 40010)));
    }

    #[test]
    fn bad_listen_ip_and_port_range_are_rejected() {
        assert!(matches!(
            listen_info(Protocol::Udp, &ListenIp::new("not-an-ip"), &(40000..=40010)),
            Err(EngineError::InvalidParameters(_))
        ));
        let settings = WorkerSettings {
            rtc_min_port: 40010,
            rtc_max_port: 40000,
            ..Default::default()
        };
        assert!(matches!(
            worker_settings(&settings),
            Err(EngineError::InvalidParameters(_))
        ));
    }

    /// Spawns a real mediasoup worker
    #[tokio::test]
    async fn plain_transport_owns_its_advertised_port() {
        let engine = MediasoupEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = WorkerSettings {
            rtc_min_port: 47000,
            rtc_max_port: 47100,
            ..Default::default()
        };
        let worker = engine.create_worker(&settings, tx).await.unwrap();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        assert!(!router.rtp_capabilities().codecs.is_empty());

        let transport = router
            .create_plain_transport(&PlainTransportOptions {
                listen_ip: ListenIp::new("127.0.0.1"),
                rtcp_mux: true,
                comedia: true,
            })
            .await
            .unwrap();
        let TransportParameters::Plain { ip, port, rtcp_port } = transport.parameters() else {
            panic!("expected plain parameters");
        };
        assert_eq!(ip, "127.0.0.1");
        assert!((47000..=47100).contains(&port));
        assert_eq!(rtcp_port, None);
        assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_err());

        let transport_id = transport.id().to_string();
        transport.close();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(EngineEvent::TransportClosed { transport_id: id }) => break id,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(closed, transport_id);

        worker.close();
    }
}
