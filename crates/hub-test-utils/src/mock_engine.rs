//! Media engine with test controls.
//!
//! Wraps [`LoopbackEngine`] so resource bookkeeping behaves exactly like the
//! binary's engine, and adds what tests need on top: artificial latency on
//! the slow calls and counters for every explicit close.
//!
//! # Example
//!
//! ```rust,ignore
//! use hub_test_utils::MockEngine;
//!
//! let (engine, events) = MockEngine::new();
//! engine.set_produce_delay(Duration::from_secs(30));
//! // A produce request now outlives a 5 s request timeout.
//! ```

use common::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use hub_service::media::{
    ConsumerDescriptor, EngineError, EngineEvent, LoopbackCounts, LoopbackEngine, MediaEngine,
    TransportDescriptor,
};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Explicit close calls seen by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseCalls {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl CloseCalls {
    #[must_use]
    pub fn total(&self) -> usize {
        self.transports + self.producers + self.consumers
    }
}

/// Loopback engine with injectable latency and call counters.
#[derive(Debug)]
pub struct MockEngine {
    inner: LoopbackEngine,
    transport_delay_ms: AtomicU64,
    produce_delay_ms: AtomicU64,
    consume_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
    produce_calls: AtomicUsize,
    closed_transports: AtomicUsize,
    closed_producers: AtomicUsize,
    closed_consumers: AtomicUsize,
}

impl MockEngine {
    /// Create the engine and the receiver for its events.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEvent>) {
        let (inner, events) = LoopbackEngine::new();
        let engine = Self {
            inner,
            transport_delay_ms: AtomicU64::new(0),
            produce_delay_ms: AtomicU64::new(0),
            consume_delay_ms: AtomicU64::new(0),
            close_delay_ms: AtomicU64::new(0),
            produce_calls: AtomicUsize::new(0),
            closed_transports: AtomicUsize::new(0),
            closed_producers: AtomicUsize::new(0),
            closed_consumers: AtomicUsize::new(0),
        };
        (Arc::new(engine), events)
    }

    /// Delay every WebRTC transport creation.
    pub fn set_transport_delay(&self, delay: Duration) {
        self.transport_delay_ms
            .store(millis(delay), Ordering::SeqCst);
    }

    /// Delay every produce call.
    pub fn set_produce_delay(&self, delay: Duration) {
        self.produce_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Delay every consume call.
    pub fn set_consume_delay(&self, delay: Duration) {
        self.consume_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Delay every explicit close, which stretches owner cleanup.
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Live resource counts.
    pub async fn counts(&self) -> LoopbackCounts {
        self.inner.counts().await
    }

    pub async fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.inner.consumer_paused(consumer_id).await
    }

    /// Explicit close calls so far.
    #[must_use]
    pub fn close_calls(&self) -> CloseCalls {
        CloseCalls {
            transports: self.closed_transports.load(Ordering::SeqCst),
            producers: self.closed_producers.load(Ordering::SeqCst),
            consumers: self.closed_consumers.load(Ordering::SeqCst),
        }
    }

    #[must_use]
    pub fn produce_calls(&self) -> usize {
        self.produce_calls.load(Ordering::SeqCst)
    }

    /// Fail the engine; emits a fatal event.
    pub async fn fail(&self, reason: &str) {
        self.inner.fail(reason).await;
    }

    /// Close a producer as if the engine decided to on its own.
    pub async fn close_producer_externally(&self, producer_id: &ProducerId) -> bool {
        self.inner.close_producer_externally(producer_id).await
    }

    async fn pause(delay: &AtomicU64) {
        let ms = delay.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait::async_trait]
impl MediaEngine for MockEngine {
    fn capabilities(&self) -> Value {
        self.inner.capabilities()
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        Self::pause(&self.transport_delay_ms).await;
        self.inner.create_webrtc_transport(direction).await
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError> {
        self.inner
            .connect_webrtc_transport(transport_id, dtls_parameters)
            .await
    }

    async fn create_plain_transport(&self, listen_ip: IpAddr) -> Result<TransportId, EngineError> {
        self.inner.create_plain_transport(listen_ip).await
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        rtp: SocketAddr,
        rtcp_port: u16,
    ) -> Result<(), EngineError> {
        self.inner
            .connect_plain_transport(transport_id, rtp, rtcp_port)
            .await
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, EngineError> {
        self.produce_calls.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.produce_delay_ms).await;
        self.inner.produce(transport_id, kind, rtp_parameters).await
    }

    async fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool {
        self.inner.can_consume(producer_id, capabilities).await
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &Value,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError> {
        Self::pause(&self.consume_delay_ms).await;
        self.inner
            .consume(transport_id, producer_id, capabilities, paused)
            .await
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.inner.resume_consumer(consumer_id).await
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.closed_consumers.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.close_delay_ms).await;
        self.inner.close_consumer(consumer_id).await
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.closed_producers.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.close_delay_ms).await;
        self.inner.close_producer(producer_id).await
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        self.closed_transports.fetch_add(1, Ordering::SeqCst);
        Self::pause(&self.close_delay_ms).await;
        self.inner.close_transport(transport_id).await
    }
}
