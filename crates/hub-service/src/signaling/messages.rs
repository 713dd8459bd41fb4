//! Signaling message types.
//!
//! Every frame is a JSON envelope `{ "type": ..., "payload": { ... } }` with
//! kebab-case types and camelCase payload fields. Requests may carry
//! `payload.requestId`, which is echoed in the matching reply or `error`.

use common::secret::SecretString;
use common::types::{ClientId, ConsumerId, MediaKind, ProducerId, Role, TransportDirection, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Inbound (client -> hub)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    /// Shared access token, checked when the hub is configured with one.
    #[serde(default)]
    pub token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportPayload {
    pub direction: TransportDirection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducePayload {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumePayload {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerPayload {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanZoomPayload {
    pub target_id: ClientId,
    pub zoom: f64,
    #[serde(default)]
    pub pan_x: f64,
    #[serde(default)]
    pub pan_y: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProducersPayload {
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

/// A decoded client request.
#[derive(Debug)]
pub enum ClientRequest {
    Register(RegisterPayload),
    CreateTransport(CreateTransportPayload),
    ConnectTransport(ConnectTransportPayload),
    Produce(ProducePayload),
    Consume(ConsumePayload),
    ResumeConsumer(ResumeConsumerPayload),
    PanZoom(PanZoomPayload),
    StopStreaming,
    GetStreamers,
    GetProducers(GetProducersPayload),
}

impl ClientRequest {
    /// Wire type of the request.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientRequest::Register(_) => "register",
            ClientRequest::CreateTransport(_) => "create-transport",
            ClientRequest::ConnectTransport(_) => "connect-transport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::Consume(_) => "consume",
            ClientRequest::ResumeConsumer(_) => "resume-consumer",
            ClientRequest::PanZoom(_) => "pan-zoom",
            ClientRequest::StopStreaming => "stop-streaming",
            ClientRequest::GetStreamers => "get-streamers",
            ClientRequest::GetProducers(_) => "get-producers",
        }
    }

    /// Whether the sender must have registered a role first.
    #[must_use]
    pub const fn requires_registration(&self) -> bool {
        !matches!(
            self,
            ClientRequest::Register(_) | ClientRequest::GetStreamers | ClientRequest::GetProducers(_)
        )
    }
}

/// A decoded frame: the request plus its client correlation id.
#[derive(Debug)]
pub struct InboundFrame {
    pub request_id: Option<String>,
    pub request: ClientRequest,
}

// ============================================================================
// Outbound (hub -> client)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub client_id: ClientId,
    pub media_capabilities: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registered {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub client_id: ClientId,
    pub role: Role,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnected {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub id: TransportId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Produced {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    /// Streamer that owns the producer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub id: ConsumerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanZoomCommand {
    pub from_id: ClientId,
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerJoined {
    pub client_id: ClientId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerLeft {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub client_id: ClientId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerSummary {
    pub client_id: ClientId,
    pub name: String,
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerList {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub streamers: Vec<StreamerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerListEntry {
    pub client_id: ClientId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerList {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub producers: Vec<ProducerListEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStopped {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub client_id: ClientId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A frame sent from the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome(Welcome),
    Registered(Registered),
    TransportCreated(TransportCreated),
    TransportConnected(TransportConnected),
    Produced(Produced),
    Consumed(Consumed),
    ConsumerResumed(ConsumerResumed),
    PanZoomCommand(PanZoomCommand),
    StreamerJoined(StreamerJoined),
    StreamerLeft(StreamerLeft),
    NewProducer(NewProducer),
    StreamerList(StreamerList),
    ProducerList(ProducerList),
    StreamingStopped(StreamingStopped),
    ProducerClosed(ProducerClosed),
    ConsumerClosed(ConsumerClosed),
    Error(ErrorPayload),
}

impl ServerMessage {
    /// Wire type of the message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Welcome(_) => "welcome",
            ServerMessage::Registered(_) => "registered",
            ServerMessage::TransportCreated(_) => "transport-created",
            ServerMessage::TransportConnected(_) => "transport-connected",
            ServerMessage::Produced(_) => "produced",
            ServerMessage::Consumed(_) => "consumed",
            ServerMessage::ConsumerResumed(_) => "consumer-resumed",
            ServerMessage::PanZoomCommand(_) => "pan-zoom-command",
            ServerMessage::StreamerJoined(_) => "streamer-joined",
            ServerMessage::StreamerLeft(_) => "streamer-left",
            ServerMessage::NewProducer(_) => "new-producer",
            ServerMessage::StreamerList(_) => "streamer-list",
            ServerMessage::ProducerList(_) => "producer-list",
            ServerMessage::StreamingStopped(_) => "streaming-stopped",
            ServerMessage::ProducerClosed(_) => "producer-closed",
            ServerMessage::ConsumerClosed(_) => "consumer-closed",
            ServerMessage::Error(_) => "error",
        }
    }

    /// Build an `error` reply.
    #[must_use]
    pub fn error(
        message: impl Into<String>,
        code: i32,
        request_type: Option<&str>,
        request_id: Option<String>,
    ) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
            code,
            request_type: request_type.map(str::to_string),
            request_id,
        })
    }
}
