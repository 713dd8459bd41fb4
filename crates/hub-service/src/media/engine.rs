//! Media engine seam.
//!
//! The engine owns transports, producers and consumers. The hub only ever
//! sees opaque ids and the JSON parameter blobs clients exchange with it.
//! Closures the engine performs on its own (a producer dying with its
//! transport, a consumer dying with its producer) arrive as [`EngineEvent`]s.

use common::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Errors returned by a media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Id is unknown to the engine (never existed or already closed).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request was understood but refused (negotiation, state, capabilities).
    #[error("rejected: {0}")]
    Rejected(String),

    /// Engine can no longer serve any request.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Parameters a client needs to set up its side of a WebRTC transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// A consumer as created by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

/// Why the engine closed a resource on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    TransportClosed,
    ProducerClosed,
}

/// Events emitted by the engine outside of any request.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ProducerClosed {
        producer_id: ProducerId,
        cause: CloseCause,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        cause: CloseCause,
    },
    Fatal {
        reason: String,
    },
}

/// Async interface to a selective forwarding unit.
///
/// Explicit `close_*` calls do not emit events for the resource being
/// closed, only for dependents the engine closes as a consequence.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router RTP capabilities handed to clients in `welcome`.
    fn capabilities(&self) -> Value;

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError>;

    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError>;

    /// Create a plain RTP transport used to feed an external encoder.
    async fn create_plain_transport(&self, listen_ip: IpAddr) -> Result<TransportId, EngineError>;

    /// Point a plain transport at the encoder's RTP and RTCP ports.
    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        rtp: SocketAddr,
        rtcp_port: u16,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, EngineError>;

    async fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &Value,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError>;
}
