//! Session
//!
//! One engine worker and router plus the index of every transport, producer
//! and consumer created on them. Explicit deletes and engine close events go
//! through the same `ResourceIndex::remove_*` functions, so an id is removed
//! exactly once whichever side notices first.

use crate::engine::{
    Consumer, ConsumerOptions, DataConsumer, DataConsumerOptions, DataProducer,
    DataProducerOptions, EngineError, EngineEvent, PlainTransportOptions, Producer,
    ProducerOptions, Router, Transport, TransportConnectParams, TransportParameters,
    WebRtcTransportOptions, Worker,
};
use crate::error::{Result, SignalError};
use chrono::{DateTime, Utc};
use sfu_protocol::{
    ConsumeResponse, DataConsumeResponse, DataProducerInfo, PlainTransportResponse,
    ProducerInfo, RtpCapabilities, SessionInfo, WebRtcTransportResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Engine handle plus the transport it was created on
struct Owned<T: ?Sized> {
    transport_id: String,
    handle: Arc<T>,
}

#[derive(Default)]
struct ResourceIndex {
    transports: HashMap<String, Arc<dyn Transport>>,
    producers: HashMap<String, Owned<dyn Producer>>,
    consumers: HashMap<String, Owned<dyn Consumer>>,
    data_producers: HashMap<String, Owned<dyn DataProducer>>,
    data_consumers: HashMap<String, Owned<dyn DataConsumer>>,
}

impl ResourceIndex {
    fn transport(&self, transport_id: &str) -> Result<Arc<dyn Transport>> {
        self.transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))
    }

    /// Drop a transport and everything that lives on it
    fn remove_transport(&mut self, transport_id: &str) -> Option<Arc<dyn Transport>> {
        let transport = self.transports.remove(transport_id)?;

        self.consumers.retain(|_, c| c.transport_id != transport_id);
        self.data_consumers.retain(|_, c| c.transport_id != transport_id);

        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in producers {
            self.remove_producer(&id);
        }

        let data_producers: Vec<String> = self
            .data_producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in data_producers {
            self.remove_data_producer(&id);
        }

        Some(transport)
    }

    /// Drop a producer and the consumers bound to it
    fn remove_producer(&mut self, producer_id: &str) -> Option<Arc<dyn Producer>> {
        let producer = self.producers.remove(producer_id)?;
        self.consumers
            .retain(|_, c| c.handle.producer_id() != producer_id);
        Some(producer.handle)
    }

    fn remove_consumer(&mut self, consumer_id: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.remove(consumer_id).map(|c| c.handle)
    }

    fn remove_data_producer(&mut self, data_producer_id: &str) -> Option<Arc<dyn DataProducer>> {
        let data_producer = self.data_producers.remove(data_producer_id)?;
        self.data_consumers
            .retain(|_, c| c.handle.data_producer_id() != data_producer_id);
        Some(data_producer.handle)
    }

    fn remove_data_consumer(&mut self, data_consumer_id: &str) -> Option<Arc<dyn DataConsumer>> {
        self.data_consumers.remove(data_consumer_id).map(|c| c.handle)
    }
}

fn producer_info(transport_id: &str, producer: &dyn Producer) -> ProducerInfo {
    ProducerInfo {
        id: producer.id().to_string(),
        transport_id: transport_id.to_string(),
        kind: producer.kind(),
        paused: producer.paused(),
        rtp_parameters: producer.rtp_parameters().clone(),
        app_data: producer.app_data().clone(),
    }
}

fn data_producer_info(transport_id: &str, data_producer: &dyn DataProducer) -> DataProducerInfo {
    DataProducerInfo {
        id: data_producer.id().to_string(),
        transport_id: transport_id.to_string(),
        sctp_stream_parameters: data_producer.sctp_stream_parameters(),
        label: data_producer.label().to_string(),
        protocol: data_producer.protocol().to_string(),
        app_data: data_producer.app_data().clone(),
    }
}

/// Close a transport whose parameters do not match the kind that was asked for
fn discard_mismatched(transport: Arc<dyn Transport>) -> SignalError {
    transport.close();
    SignalError::Engine(EngineError::Unsupported(format!(
        "engine returned mismatched parameters for {} transport {}",
        transport.kind(),
        transport.id()
    )))
}

pub struct Session {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    worker: Arc<dyn Worker>,
    router: Arc<dyn Router>,
    resources: Mutex<ResourceIndex>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(id: String, name: String, worker: Arc<dyn Worker>, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            name,
            created_at: Utc::now(),
            worker,
            router,
            resources: Mutex::new(ResourceIndex::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SignalError::SessionNotFound(self.id.clone()))
        } else {
            Ok(())
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let resources = self.resources.lock().await;
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            transport_count: resources.transports.len(),
            producer_count: resources.producers.len(),
        }
    }

    pub fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        self.ensure_open()?;
        Ok(self.router.rtp_capabilities())
    }

    // Transports

    pub async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<WebRtcTransportResponse> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;

        let transport = self.router.create_webrtc_transport(options).await?;
        let response = match transport.parameters() {
            TransportParameters::WebRtc {
                ice_parameters,
                ice_candidates,
                dtls_parameters,
                sctp_parameters,
            } => WebRtcTransportResponse {
                id: transport.id().to_string(),
                ice_parameters,
                ice_candidates,
                dtls_parameters,
                sctp_parameters,
            },
            TransportParameters::Plain { .. } => return Err(discard_mismatched(transport)),
        };

        resources
            .transports
            .insert(transport.id().to_string(), transport.clone());
        tracing::info!(
            "Session {}: created webrtc transport {}",
            self.id,
            transport.id()
        );
        Ok(response)
    }

    pub async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> Result<PlainTransportResponse> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;

        let transport = self.router.create_plain_transport(options).await?;
        let response = match transport.parameters() {
            TransportParameters::Plain {
                ip,
                port,
                rtcp_port,
            } => PlainTransportResponse {
                id: transport.id().to_string(),
                ip,
                port,
                rtcp_port,
            },
            TransportParameters::WebRtc { .. } => return Err(discard_mismatched(transport)),
        };

        resources
            .transports
            .insert(transport.id().to_string(), transport.clone());
        tracing::info!(
            "Session {}: created plain transport {}",
            self.id,
            transport.id()
        );
        Ok(response)
    }

    /// Close and forget a transport; returns whether it was still known
    pub async fn delete_transport(&self, transport_id: &str) -> bool {
        let removed = self.resources.lock().await.remove_transport(transport_id);
        match removed {
            Some(transport) => {
                transport.close();
                tracing::info!("Session {}: deleted transport {}", self.id, transport_id);
                true
            }
            None => {
                tracing::debug!(
                    "Session {}: transport {} already gone",
                    self.id,
                    transport_id
                );
                false
            }
        }
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        params: TransportConnectParams,
    ) -> Result<()> {
        self.ensure_open()?;
        let transport = self.resources.lock().await.transport(transport_id)?;
        transport.connect(params).await?;
        tracing::debug!("Session {}: connected transport {}", self.id, transport_id);
        Ok(())
    }

    // Producers and consumers

    pub async fn produce(&self, transport_id: &str, options: ProducerOptions) -> Result<ProducerInfo> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;
        let transport = resources.transport(transport_id)?;

        let producer = transport.produce(options).await?;
        let info = producer_info(transport_id, producer.as_ref());
        resources.producers.insert(
            info.id.clone(),
            Owned {
                transport_id: transport_id.to_string(),
                handle: producer,
            },
        );

        tracing::info!(
            "Session {}: {} producer {} on transport {}",
            self.id,
            info.kind,
            info.id,
            transport_id
        );
        Ok(info)
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumeResponse> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;
        let transport = resources.transport(transport_id)?;

        if !resources.producers.contains_key(producer_id) {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }
        if !self.router.can_consume(producer_id, &rtp_capabilities) {
            return Err(SignalError::CannotConsume(producer_id.to_string()));
        }

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer_id.to_string(),
                rtp_capabilities,
                paused,
            })
            .await?;

        let response = ConsumeResponse {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            paused: consumer.paused(),
        };
        resources.consumers.insert(
            response.id.clone(),
            Owned {
                transport_id: transport_id.to_string(),
                handle: consumer,
            },
        );

        tracing::info!(
            "Session {}: consumer {} of producer {}",
            self.id,
            response.id,
            producer_id
        );
        Ok(response)
    }

    pub async fn produce_data(
        &self,
        transport_id: &str,
        options: DataProducerOptions,
    ) -> Result<DataProducerInfo> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;
        let transport = resources.transport(transport_id)?;

        let data_producer = transport.produce_data(options).await?;
        let info = data_producer_info(transport_id, data_producer.as_ref());
        resources.data_producers.insert(
            info.id.clone(),
            Owned {
                transport_id: transport_id.to_string(),
                handle: data_producer,
            },
        );

        tracing::info!(
            "Session {}: data producer {} ({}) on transport {}",
            self.id,
            info.id,
            info.label,
            transport_id
        );
        Ok(info)
    }

    pub async fn consume_data(
        &self,
        transport_id: &str,
        data_producer_id: &str,
    ) -> Result<DataConsumeResponse> {
        self.ensure_open()?;
        let mut resources = self.resources.lock().await;
        let transport = resources.transport(transport_id)?;

        if !resources.data_producers.contains_key(data_producer_id) {
            return Err(SignalError::DataProducerNotFound(
                data_producer_id.to_string(),
            ));
        }

        let data_consumer = transport
            .consume_data(DataConsumerOptions {
                data_producer_id: data_producer_id.to_string(),
            })
            .await?;

        let response = DataConsumeResponse {
            id: data_consumer.id().to_string(),
            data_producer_id: data_consumer.data_producer_id().to_string(),
            sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
            label: data_consumer.label().to_string(),
            protocol: data_consumer.protocol().to_string(),
        };
        resources.data_consumers.insert(
            response.id.clone(),
            Owned {
                transport_id: transport_id.to_string(),
                handle: data_consumer,
            },
        );

        Ok(response)
    }

    pub async fn producers(&self) -> Vec<ProducerInfo> {
        let resources = self.resources.lock().await;
        let mut producers: Vec<ProducerInfo> = resources
            .producers
            .values()
            .map(|p| producer_info(&p.transport_id, p.handle.as_ref()))
            .collect();
        producers.sort_by(|a, b| a.id.cmp(&b.id));
        producers
    }

    pub async fn data_producers(&self) -> Vec<DataProducerInfo> {
        let resources = self.resources.lock().await;
        let mut data_producers: Vec<DataProducerInfo> = resources
            .data_producers
            .values()
            .map(|p| data_producer_info(&p.transport_id, p.handle.as_ref()))
            .collect();
        data_producers.sort_by(|a, b| a.id.cmp(&b.id));
        data_producers
    }

    /// Pause or resume a producer. Unknown producers are a logged no-op
    /// reported as `None`.
    pub async fn set_producer_paused(&self, producer_id: &str, paused: bool) -> Result<Option<bool>> {
        self.ensure_open()?;
        let producer = self
            .resources
            .lock()
            .await
            .producers
            .get(producer_id)
            .map(|p| p.handle.clone());

        let Some(producer) = producer else {
            tracing::warn!(
                "Session {}: cannot {} unknown producer {}",
                self.id,
                if paused { "pause" } else { "resume" },
                producer_id
            );
            return Ok(None);
        };

        if paused {
            producer.pause().await?;
        } else {
            producer.resume().await?;
        }
        Ok(Some(producer.paused()))
    }

    // Lifecycle

    /// Mirror an engine-side close into the index
    pub async fn on_engine_event(&self, event: &EngineEvent) {
        let mut resources = self.resources.lock().await;
        let removed = match event {
            EngineEvent::TransportClosed { transport_id } => {
                resources.remove_transport(transport_id).is_some()
            }
            EngineEvent::ProducerClosed { producer_id } => {
                resources.remove_producer(producer_id).is_some()
            }
            EngineEvent::ConsumerClosed { consumer_id } => {
                resources.remove_consumer(consumer_id).is_some()
            }
            EngineEvent::DataProducerClosed { data_producer_id } => {
                resources.remove_data_producer(data_producer_id).is_some()
            }
            EngineEvent::DataConsumerClosed { data_consumer_id } => {
                resources.remove_data_consumer(data_consumer_id).is_some()
            }
            EngineEvent::RouterClosed { .. } | EngineEvent::WorkerDied { .. } => false,
        };

        if removed {
            tracing::debug!("Session {}: engine closed {:?}", self.id, event);
        }
    }

    /// Close every resource, then the router and the worker
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let resources = std::mem::take(&mut *self.resources.lock().await);
        for consumer in resources.consumers.values() {
            consumer.handle.close();
        }
        for data_consumer in resources.data_consumers.values() {
            data_consumer.handle.close();
        }
        for producer in resources.producers.values() {
            producer.handle.close();
        }
        for data_producer in resources.data_producers.values() {
            data_producer.handle.close();
        }
        for transport in resources.transports.values() {
            transport.close();
        }

        self.router.close();
        self.worker.close();

        tracing::info!("Session {} ({}) closed", self.id, self.name);
    }
}

#[cfg(test)]
impl Session {
    pub(crate) async fn consumer_count(&self) -> usize {
        self.resources.lock().await.consumers.len()
    }

    pub(crate) async fn transport_ids(&self) -> Vec<String> {
        self.resources.lock().await.transports.keys().cloned().collect()
    }
}
