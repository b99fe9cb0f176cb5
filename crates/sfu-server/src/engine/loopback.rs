//! Loopback engine
//!
//! Keeps the engine's observable contract (ids, port allocation, capability
//! negotiation, cascading close notifications) without moving any media.
//! Test double for the session manager and the signaling tests.

use super::{
    Consumer, ConsumerOptions, DataConsumer, DataConsumerOptions, DataProducer,
    DataProducerOptions, EngineError, EngineEvent, EngineEventSender, EngineResult, MediaEngine,
    PlainTransportOptions, Producer, ProducerOptions, Router, Transport, TransportConnectParams,
    TransportParameters, WebRtcTransportOptions, Worker, WorkerSettings,
};
use async_trait::async_trait;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Value, json};
use sfu_protocol::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpParameters, SctpParameters, SctpStreamParameters,
    TransportKind,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

const SCTP_PORT: u16 = 5000;
const UDP_PRIORITY: u32 = 1076302079;
const TCP_PRIORITY: u32 = 1076276479;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn kind_prefix(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio/",
        MediaKind::Video => "video/",
    }
}

/// Whether any media codec the producer sends can be decoded with `caps`
fn decodable(producer: &LoopbackProducer, caps: &RtpCapabilities) -> bool {
    producer
        .rtp_parameters
        .codecs
        .iter()
        .filter(|c| c.is_media_codec())
        .any(|c| caps.supports(producer.kind, &c.mime_type, c.clock_rate))
}

struct PortPool {
    min: u16,
    max: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    fn allocate(&self, count: usize) -> EngineResult<Vec<u16>> {
        let mut used = lock(&self.used);
        let free: Vec<u16> = (self.min..=self.max)
            .filter(|port| !used.contains(port))
            .take(count)
            .collect();

        if free.len() < count {
            return Err(EngineError::PortsExhausted {
                min: self.min,
                max: self.max,
            });
        }

        used.extend(free.iter().copied());
        Ok(free)
    }

    fn release(&self, ports: &[u16]) {
        let mut used = lock(&self.used);
        for port in ports {
            used.remove(port);
        }
    }
}

// Engine

pub struct LoopbackEngine {
    next_pid: AtomicU32,
    workers: Mutex<Vec<Weak<LoopbackWorker>>>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Look up a live worker, e.g. to simulate its death
    pub fn worker(&self, pid: u32) -> Option<Arc<LoopbackWorker>> {
        lock(&self.workers)
            .iter()
            .filter_map(Weak::upgrade)
            .find(|w| w.pid == pid)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(
        &self,
        settings: &WorkerSettings,
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn Worker>> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::InvalidParameters(format!(
                "rtc_min_port {} is above rtc_max_port {}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(LoopbackWorker {
            pid,
            events,
            ports: Arc::new(PortPool::new(settings.rtc_min_port, settings.rtc_max_port)),
            fingerprint: random_fingerprint(),
            routers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        {
            let mut workers = lock(&self.workers);
            workers.retain(|w| w.strong_count() > 0);
            workers.push(Arc::downgrade(&worker));
        }

        tracing::debug!(
            "Loopback worker {} started (ports {}-{})",
            pid,
            settings.rtc_min_port,
            settings.rtc_max_port
        );

        Ok(worker)
    }
}

// Worker

pub struct LoopbackWorker {
    pid: u32,
    events: EngineEventSender,
    ports: Arc<PortPool>,
    fingerprint: String,
    routers: Mutex<Vec<Arc<RouterShared>>>,
    closed: AtomicBool,
}

impl LoopbackWorker {
    /// Simulate an unexpected worker exit
    pub fn kill(&self, reason: &str) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
        self.close_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let routers = std::mem::take(&mut *lock(&self.routers));
        for router in routers {
            router.close();
        }
        tracing::debug!("Loopback worker {} closed", self.pid);
    }

    fn new_router(&self, media_codecs: &[RtpCodecCapability]) -> EngineResult<Arc<dyn Router>> {
        if self.is_closed() {
            return Err(EngineError::Closed("worker"));
        }
        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one media codec".to_string(),
            ));
        }

        let codecs = media_codecs
            .iter()
            .enumerate()
            .map(|(i, codec)| RtpCodecCapability {
                preferred_payload_type: codec
                    .preferred_payload_type
                    .or(Some(100u8.saturating_add(i as u8))),
                ..codec.clone()
            })
            .collect();

        let shared = Arc::new_cyclic(|me| RouterShared {
            id: new_id(),
            me: me.clone(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: vec![],
            },
            events: self.events.clone(),
            ports: self.ports.clone(),
            fingerprint: self.fingerprint.clone(),
            index: Mutex::new(RouterIndex::default()),
            closed: AtomicBool::new(false),
        });

        lock(&self.routers).push(shared.clone());
        Ok(Arc::new(LoopbackRouter { shared }))
    }
}

#[async_trait]
impl Worker for LoopbackWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn Router>> {
        self.new_router(media_codecs)
    }

    fn close(&self) {
        self.close_all();
    }
}

// Router

#[derive(Default)]
struct RouterIndex {
    transports: HashMap<String, Arc<LoopbackTransport>>,
    producers: HashMap<String, Arc<LoopbackProducer>>,
    consumers: HashMap<String, Arc<LoopbackConsumer>>,
    data_producers: HashMap<String, Arc<LoopbackDataProducer>>,
    data_consumers: HashMap<String, Arc<LoopbackDataConsumer>>,
}

struct RouterShared {
    id: String,
    me: Weak<RouterShared>,
    capabilities: RtpCapabilities,
    events: EngineEventSender,
    ports: Arc<PortPool>,
    fingerprint: String,
    index: Mutex<RouterIndex>,
    closed: AtomicBool,
}

impl RouterShared {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed("router"))
        } else {
            Ok(())
        }
    }

    fn can_consume(&self, producer_id: &str, caps: &RtpCapabilities) -> bool {
        lock(&self.index)
            .producers
            .get(producer_id)
            .is_some_and(|p| decodable(p, caps))
    }

    fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;
        if options.listen_ips.is_empty() {
            return Err(EngineError::InvalidParameters("no listen ips".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "neither UDP nor TCP enabled".to_string(),
            ));
        }

        let count = usize::from(options.enable_udp) + usize::from(options.enable_tcp);
        let ports = self.ports.allocate(count)?;
        let mut port_iter = ports.iter().copied();
        let udp_port = if options.enable_udp { port_iter.next() } else { None };
        let tcp_port = if options.enable_tcp { port_iter.next() } else { None };

        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (UDP_PRIORITY, TCP_PRIORITY)
        } else {
            (TCP_PRIORITY, UDP_PRIORITY)
        };

        let mut ice_candidates = Vec::new();
        for (i, listen) in options.listen_ips.iter().enumerate() {
            let offset = (i as u32) * 1000;
            if let Some(port) = udp_port {
                ice_candidates.push(IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: udp_priority - offset,
                    ip: listen.public_ip().to_string(),
                    protocol: "udp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                });
            }
            if let Some(port) = tcp_port {
                ice_candidates.push(IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: tcp_priority - offset,
                    ip: listen.public_ip().to_string(),
                    protocol: "tcp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                });
            }
        }

        let sctp_parameters = options.enable_sctp.then(|| SctpParameters {
            port: SCTP_PORT,
            os: options.num_sctp_streams,
            mis: options.num_sctp_streams,
            max_message_size: options.max_sctp_message_size,
        });

        let parameters = TransportParameters::WebRtc {
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: self.fingerprint.clone(),
                }],
            },
            sctp_parameters,
        };

        Ok(self.insert_transport(
            TransportKind::WebRtc,
            parameters,
            ports,
            options.enable_sctp,
            false,
        ))
    }

    fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.ensure_open()?;

        let count = if options.rtcp_mux { 1 } else { 2 };
        let ports = self.ports.allocate(count)?;
        let parameters = TransportParameters::Plain {
            ip: options.listen_ip.public_ip().to_string(),
            port: ports[0],
            rtcp_port: ports.get(1).copied(),
        };

        Ok(self.insert_transport(TransportKind::Plain, parameters, ports, false, options.comedia))
    }

    fn insert_transport(
        &self,
        kind: TransportKind,
        parameters: TransportParameters,
        ports: Vec<u16>,
        sctp_enabled: bool,
        comedia: bool,
    ) -> Arc<dyn Transport> {
        let transport = Arc::new(LoopbackTransport {
            id: new_id(),
            kind,
            parameters,
            ports,
            sctp_enabled,
            comedia,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_stream_id: AtomicU16::new(0),
            router: self.me.clone(),
        });
        lock(&self.index)
            .transports
            .insert(transport.id.clone(), transport.clone());
        transport
    }

    fn create_producer(
        &self,
        transport_id: &str,
        options: ProducerOptions,
    ) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;

        let media: Vec<_> = options
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| c.is_media_codec())
            .collect();
        if media.is_empty() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters contain no media codec".to_string(),
            ));
        }
        for codec in media {
            if !codec
                .mime_type
                .to_ascii_lowercase()
                .starts_with(kind_prefix(options.kind))
            {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} does not match kind {}",
                    codec.mime_type, options.kind
                )));
            }
            if !self
                .capabilities
                .supports(options.kind, &codec.mime_type, codec.clock_rate)
            {
                return Err(EngineError::Unsupported(format!(
                    "codec {}/{} not enabled on router",
                    codec.mime_type, codec.clock_rate
                )));
            }
        }

        let producer = Arc::new(LoopbackProducer {
            id: new_id(),
            transport_id: transport_id.to_string(),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            app_data: options.app_data,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            router: self.me.clone(),
        });
        lock(&self.index)
            .producers
            .insert(producer.id.clone(), producer.clone());
        Ok(producer)
    }

    fn create_consumer(
        &self,
        transport_id: &str,
        options: ConsumerOptions,
    ) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;

        let mut index = lock(&self.index);
        let producer = index
            .producers
            .get(&options.producer_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: "producer",
                id: options.producer_id.clone(),
            })?;

        if !decodable(&producer, &options.rtp_capabilities) {
            return Err(EngineError::Unsupported(format!(
                "cannot consume producer {} with the given capabilities",
                producer.id
            )));
        }

        let codecs = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| {
                c.is_media_codec()
                    && options
                        .rtp_capabilities
                        .supports(producer.kind, &c.mime_type, c.clock_rate)
            })
            .cloned()
            .collect();

        let consumer = Arc::new(LoopbackConsumer {
            id: new_id(),
            transport_id: transport_id.to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs,
                header_extensions: vec![],
                encodings: vec![json!({ "ssrc": rand::random::<u32>() })],
                rtcp: Some(json!({ "cname": random_token(8), "reducedSize": true })),
            },
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            router: self.me.clone(),
        });
        index
            .consumers
            .insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }

    fn create_data_producer(
        &self,
        transport_id: &str,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn DataProducer>> {
        self.ensure_open()?;
        let Some(sctp) = options.sctp_stream_parameters else {
            return Err(EngineError::InvalidParameters(
                "sctpStreamParameters required".to_string(),
            ));
        };

        let data_producer = Arc::new(LoopbackDataProducer {
            id: new_id(),
            transport_id: transport_id.to_string(),
            sctp,
            label: options.label,
            protocol: options.protocol,
            app_data: options.app_data,
            closed: AtomicBool::new(false),
            router: self.me.clone(),
        });
        lock(&self.index)
            .data_producers
            .insert(data_producer.id.clone(), data_producer.clone());
        Ok(data_producer)
    }

    fn create_data_consumer(
        &self,
        transport_id: &str,
        stream_id: u16,
        options: DataConsumerOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>> {
        self.ensure_open()?;

        let mut index = lock(&self.index);
        let data_producer = index
            .data_producers
            .get(&options.data_producer_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                kind: "dataProducer",
                id: options.data_producer_id.clone(),
            })?;

        let data_consumer = Arc::new(LoopbackDataConsumer {
            id: new_id(),
            transport_id: transport_id.to_string(),
            data_producer_id: data_producer.id.clone(),
            sctp: SctpStreamParameters {
                stream_id,
                ..data_producer.sctp
            },
            label: data_producer.label.clone(),
            protocol: data_producer.protocol.clone(),
            closed: AtomicBool::new(false),
            router: self.me.clone(),
        });
        index
            .data_consumers
            .insert(data_consumer.id.clone(), data_consumer.clone());
        Ok(data_consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport_ids: Vec<String> = lock(&self.index).transports.keys().cloned().collect();
        for id in transport_ids {
            self.close_transport(&id);
        }
        self.emit(EngineEvent::RouterClosed {
            router_id: self.id.clone(),
        });
    }

    fn close_transport(&self, transport_id: &str) {
        let (transport, consumers, data_consumers, producers, data_producers) = {
            let mut index = lock(&self.index);
            let Some(transport) = index.transports.remove(transport_id) else {
                return;
            };
            let consumers: Vec<String> = index
                .consumers
                .values()
                .filter(|c| c.transport_id == transport_id)
                .map(|c| c.id.clone())
                .collect();
            let data_consumers: Vec<String> = index
                .data_consumers
                .values()
                .filter(|c| c.transport_id == transport_id)
                .map(|c| c.id.clone())
                .collect();
            let producers: Vec<String> = index
                .producers
                .values()
                .filter(|p| p.transport_id == transport_id)
                .map(|p| p.id.clone())
                .collect();
            let data_producers: Vec<String> = index
                .data_producers
                .values()
                .filter(|p| p.transport_id == transport_id)
                .map(|p| p.id.clone())
                .collect();
            (transport, consumers, data_consumers, producers, data_producers)
        };

        transport.closed.store(true, Ordering::SeqCst);
        for id in consumers {
            self.close_consumer(&id);
        }
        for id in data_consumers {
            self.close_data_consumer(&id);
        }
        for id in producers {
            self.close_producer(&id);
        }
        for id in data_producers {
            self.close_data_producer(&id);
        }

        self.ports.release(&transport.ports);
        self.emit(EngineEvent::TransportClosed {
            transport_id: transport_id.to_string(),
        });
    }

    fn close_producer(&self, producer_id: &str) {
        let consumers: Vec<String> = {
            let mut index = lock(&self.index);
            let Some(producer) = index.producers.remove(producer_id) else {
                return;
            };
            producer.closed.store(true, Ordering::SeqCst);
            index
                .consumers
                .values()
                .filter(|c| c.producer_id == producer_id)
                .map(|c| c.id.clone())
                .collect()
        };

        for id in consumers {
            self.close_consumer(&id);
        }
        self.emit(EngineEvent::ProducerClosed {
            producer_id: producer_id.to_string(),
        });
    }

    fn close_consumer(&self, consumer_id: &str) {
        let Some(consumer) = lock(&self.index).consumers.remove(consumer_id) else {
            return;
        };
        consumer.closed.store(true, Ordering::SeqCst);
        self.emit(EngineEvent::ConsumerClosed {
            consumer_id: consumer_id.to_string(),
        });
    }

    fn close_data_producer(&self, data_producer_id: &str) {
        let data_consumers: Vec<String> = {
            let mut index = lock(&self.index);
            let Some(data_producer) = index.data_producers.remove(data_producer_id) else {
                return;
            };
            data_producer.closed.store(true, Ordering::SeqCst);
            index
                .data_consumers
                .values()
                .filter(|c| c.data_producer_id == data_producer_id)
                .map(|c| c.id.clone())
                .collect()
        };

        for id in data_consumers {
            self.close_data_consumer(&id);
        }
        self.emit(EngineEvent::DataProducerClosed {
            data_producer_id: data_producer_id.to_string(),
        });
    }

    fn close_data_consumer(&self, data_consumer_id: &str) {
        let Some(data_consumer) = lock(&self.index).data_consumers.remove(data_consumer_id) else {
            return;
        };
        data_consumer.closed.store(true, Ordering::SeqCst);
        self.emit(EngineEvent::DataConsumerClosed {
            data_consumer_id: data_consumer_id.to_string(),
        });
    }
}

struct LoopbackRouter {
    shared: Arc<RouterShared>,
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.shared.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        self.shared.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.shared.create_webrtc_transport(options)
    }

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        self.shared.create_plain_transport(options)
    }

    fn close(&self) {
        self.shared.close();
    }
}

// Transport

struct LoopbackTransport {
    id: String,
    kind: TransportKind,
    parameters: TransportParameters,
    ports: Vec<u16>,
    sctp_enabled: bool,
    comedia: bool,
    connected: AtomicBool,
    closed: AtomicBool,
    next_stream_id: AtomicU16,
    router: Weak<RouterShared>,
}

impl LoopbackTransport {
    fn router(&self) -> EngineResult<Arc<RouterShared>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("transport"));
        }
        self.router.upgrade().ok_or(EngineError::Closed("router"))
    }

    fn require_sctp(&self) -> EngineResult<()> {
        if self.sctp_enabled {
            Ok(())
        } else {
            Err(EngineError::Unsupported(
                "SCTP is not enabled on this transport".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
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
        self.router()?;

        match self.kind {
            TransportKind::WebRtc => {
                if params.dtls_parameters.is_none() {
                    return Err(EngineError::InvalidParameters(
                        "dtlsParameters required".to_string(),
                    ));
                }
            }
            TransportKind::Plain => {
                if !self.comedia && (params.ip.is_none() || params.port.is_none()) {
                    return Err(EngineError::InvalidParameters(
                        "ip and port required unless comedia is enabled".to_string(),
                    ));
                }
            }
        }

        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected);
        }
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn Producer>> {
        self.router()?.create_producer(&self.id, options)
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn Consumer>> {
        self.router()?.create_consumer(&self.id, options)
    }

    async fn produce_data(
        &self,
        options: DataProducerOptions,
    ) -> EngineResult<Arc<dyn DataProducer>> {
        let router = self.router()?;
        self.require_sctp()?;
        router.create_data_producer(&self.id, options)
    }

    async fn consume_data(
        &self,
        options: DataConsumerOptions,
    ) -> EngineResult<Arc<dyn DataConsumer>> {
        let router = self.router()?;
        self.require_sctp()?;
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        router.create_data_consumer(&self.id, stream_id, options)
    }

    fn close(&self) {
        if let Some(router) = self.router.upgrade() {
            router.close_transport(&self.id);
        }
    }
}

// Producers and consumers

struct LoopbackProducer {
    id: String,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: Value,
    paused: AtomicBool,
    closed: AtomicBool,
    router: Weak<RouterShared>,
}

#[async_trait]
impl Producer for LoopbackProducer {
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
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed("producer"));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if let Some(router) = self.router.upgrade() {
            router.close_producer(&self.id);
        }
    }
}

struct LoopbackConsumer {
    id: String,
    transport_id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    router: Weak<RouterShared>,
}

impl Consumer for LoopbackConsumer {
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
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if let Some(router) = self.router.upgrade() {
            router.close_consumer(&self.id);
        }
    }
}

struct LoopbackDataProducer {
    id: String,
    transport_id: String,
    sctp: SctpStreamParameters,
    label: String,
    protocol: String,
    app_data: Value,
    closed: AtomicBool,
    router: Weak<RouterShared>,
}

impl DataProducer for LoopbackDataProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        Some(self.sctp)
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
        if let Some(router) = self.router.upgrade() {
            router.close_data_producer(&self.id);
        }
    }
}

struct LoopbackDataConsumer {
    id: String,
    transport_id: String,
    data_producer_id: String,
    sctp: SctpStreamParameters,
    label: String,
    protocol: String,
    closed: AtomicBool,
    router: Weak<RouterShared>,
}

impl DataConsumer for LoopbackDataConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        Some(self.sctp)
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn close(&self) {
        if let Some(router) = self.router.upgrade() {
            router.close_data_consumer(&self.id);
        }
    }
}
