//! In-process media engine that keeps full resource bookkeeping without
//! forwarding any RTP.
//!
//! Used by the binary in signaling-only deployments and by tests. It
//! enforces the same rules a real SFU would: ids must exist, consumers need
//! a receive (or plain) transport, producers need a send transport with at
//! least one codec, and consumers are only created for codecs the consumer
//! side declares. Closing a transport closes its producers and consumers;
//! closing a producer closes its consumers. Both cascades emit events.

use super::engine::{
    CloseCause, ConsumerDescriptor, EngineError, EngineEvent, MediaEngine, TransportDescriptor,
};
use common::types::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// First SSRC handed to a consumer.
const FIRST_SSRC: u32 = 0x1000_0000;

/// Port of the first advertised ICE candidate.
const FIRST_CANDIDATE_PORT: u16 = 40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    WebRtc(TransportDirection),
    Plain,
}

#[derive(Debug)]
struct Transport {
    kind: TransportKind,
    connected: bool,
}

#[derive(Debug)]
struct Producer {
    transport_id: TransportId,
    kind: MediaKind,
    codec: Value,
}

#[derive(Debug)]
struct Consumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct LoopbackState {
    transports: HashMap<TransportId, Transport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    next_ssrc: u32,
    next_port: u16,
    failed: Option<String>,
}

/// Snapshot of live resource counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Bookkeeping-only [`MediaEngine`].
#[derive(Debug)]
pub struct LoopbackEngine {
    state: Mutex<LoopbackState>,
    events: mpsc::UnboundedSender<EngineEvent>,
    capabilities: Value,
}

impl LoopbackEngine {
    /// Create the engine and the receiver for its events.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            state: Mutex::new(LoopbackState {
                next_ssrc: FIRST_SSRC,
                next_port: FIRST_CANDIDATE_PORT,
                ..LoopbackState::default()
            }),
            events,
            capabilities: default_capabilities(),
        };
        (engine, rx)
    }

    /// Current number of live resources.
    pub async fn counts(&self) -> LoopbackCounts {
        let state = self.state.lock().await;
        LoopbackCounts {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    /// Whether a consumer exists and is paused.
    pub async fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state
            .lock()
            .await
            .consumers
            .get(consumer_id)
            .map(|c| c.paused)
    }

    /// Put the engine into a failed state and emit a fatal event.
    ///
    /// Every later request fails with [`EngineError::Fatal`].
    pub async fn fail(&self, reason: &str) {
        self.state.lock().await.failed = Some(reason.to_string());
        warn!(target: "hub.media.loopback", reason = %reason, "Loopback engine failed");
        let _ = self.events.send(EngineEvent::Fatal {
            reason: reason.to_string(),
        });
    }

    /// Close a producer as if the engine decided to on its own.
    ///
    /// Emits `ProducerClosed` for the producer itself and `ConsumerClosed`
    /// for each dependent consumer.
    pub async fn close_producer_externally(&self, producer_id: &ProducerId) -> bool {
        let mut state = self.state.lock().await;
        if state.producers.remove(producer_id).is_none() {
            return false;
        }
        let _ = self.events.send(EngineEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            cause: CloseCause::TransportClosed,
        });
        self.cascade_producer(&mut state, producer_id);
        true
    }

    fn check_alive(state: &LoopbackState) -> Result<(), EngineError> {
        match &state.failed {
            Some(reason) => Err(EngineError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    fn cascade_producer(&self, state: &mut LoopbackState, producer_id: &ProducerId) {
        let dependents: Vec<ConsumerId> = state
            .consumers
            .iter()
            .filter(|(_, c)| &c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();

        for consumer_id in dependents {
            state.consumers.remove(&consumer_id);
            let _ = self.events.send(EngineEvent::ConsumerClosed {
                consumer_id,
                producer_id: producer_id.clone(),
                cause: CloseCause::ProducerClosed,
            });
        }
    }
}

#[async_trait::async_trait]
impl MediaEngine for LoopbackEngine {
    fn capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let id = TransportId::new();
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1).max(FIRST_CANDIDATE_PORT);
        state.transports.insert(
            id.clone(),
            Transport {
                kind: TransportKind::WebRtc(direction),
                connected: false,
            },
        );

        debug!(target: "hub.media.loopback", transport_id = %id, direction = direction.as_str(), "Transport created");

        Ok(TransportDescriptor {
            ice_parameters: json!({
                "usernameFragment": format!("ufrag-{}", id.as_str().get(..8).unwrap_or("loopback")),
                "password": uuid::Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": "127.0.0.1",
                "address": "127.0.0.1",
                "protocol": "udp",
                "port": port,
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": loopback_fingerprint(),
                }],
            }),
            id,
            direction,
        })
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;

        if !matches!(transport.kind, TransportKind::WebRtc(_)) {
            return Err(EngineError::Rejected("not a WebRTC transport".to_string()));
        }
        if transport.connected {
            return Err(EngineError::Rejected("transport already connected".to_string()));
        }
        if !dtls_parameters.get("fingerprints").is_some_and(Value::is_array) {
            return Err(EngineError::Rejected(
                "dtlsParameters must carry fingerprints".to_string(),
            ));
        }

        transport.connected = true;
        Ok(())
    }

    async fn create_plain_transport(&self, listen_ip: IpAddr) -> Result<TransportId, EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let id = TransportId::new();
        state.transports.insert(
            id.clone(),
            Transport {
                kind: TransportKind::Plain,
                connected: false,
            },
        );
        debug!(target: "hub.media.loopback", transport_id = %id, listen_ip = %listen_ip, "Plain transport created");
        Ok(id)
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        rtp: SocketAddr,
        rtcp_port: u16,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.kind != TransportKind::Plain {
            return Err(EngineError::Rejected("not a plain transport".to_string()));
        }
        transport.connected = true;
        debug!(target: "hub.media.loopback", transport_id = %transport_id, rtp = %rtp, rtcp_port, "Plain transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.kind != TransportKind::WebRtc(TransportDirection::Send) {
            return Err(EngineError::Rejected("transport is not a send transport".to_string()));
        }

        let codec = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .filter(|codec| codec.get("mimeType").is_some_and(Value::is_string))
            .cloned()
            .ok_or_else(|| EngineError::Rejected("rtpParameters carries no codec".to_string()))?;

        let id = ProducerId::new();
        state.producers.insert(
            id.clone(),
            Producer {
                transport_id: transport_id.clone(),
                kind,
                codec,
            },
        );
        Ok(id)
    }

    async fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool {
        let state = self.state.lock().await;
        state
            .producers
            .get(producer_id)
            .is_some_and(|p| supports_codec(capabilities, &p.codec))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &Value,
        paused: bool,
    ) -> Result<ConsumerDescriptor, EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.kind == TransportKind::WebRtc(TransportDirection::Send) {
            return Err(EngineError::Rejected("transport is not a receive transport".to_string()));
        }

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        if !supports_codec(capabilities, &producer.codec) {
            return Err(EngineError::Rejected(
                "capabilities do not include the producer codec".to_string(),
            ));
        }
        let kind = producer.kind;
        let codec = producer.codec.clone();

        let ssrc = state.next_ssrc;
        state.next_ssrc = state.next_ssrc.wrapping_add(1);

        let id = ConsumerId::new();
        state.consumers.insert(
            id.clone(),
            Consumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused,
            },
        );

        Ok(ConsumerDescriptor {
            rtp_parameters: json!({
                "mid": state.consumers.len().to_string(),
                "codecs": [codec],
                "headerExtensions": [],
                "encodings": [{ "ssrc": ssrc }],
                "rtcp": { "cname": format!("hub-{}", id.as_str().get(..8).unwrap_or("cname")), "reducedSize": true },
            }),
            id,
            producer_id: producer_id.clone(),
            kind,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        Self::check_alive(&state)?;

        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        state
            .consumers
            .remove(consumer_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.producers.remove(producer_id).is_none() {
            return Err(EngineError::NotFound(format!("producer {producer_id}")));
        }
        self.cascade_producer(&mut state, producer_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.transports.remove(transport_id).is_none() {
            return Err(EngineError::NotFound(format!("transport {transport_id}")));
        }

        let producers: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            state.producers.remove(&producer_id);
            let _ = self.events.send(EngineEvent::ProducerClosed {
                producer_id: producer_id.clone(),
                cause: CloseCause::TransportClosed,
            });
            self.cascade_producer(&mut state, &producer_id);
        }

        let consumers: Vec<(ConsumerId, ProducerId)> = state
            .consumers
            .iter()
            .filter(|(_, c)| &c.transport_id == transport_id)
            .map(|(id, c)| (id.clone(), c.producer_id.clone()))
            .collect();
        for (consumer_id, producer_id) in consumers {
            state.consumers.remove(&consumer_id);
            let _ = self.events.send(EngineEvent::ConsumerClosed {
                consumer_id,
                producer_id,
                cause: CloseCause::TransportClosed,
            });
        }
        Ok(())
    }
}

/// Router capabilities offered by the loopback engine.
fn default_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2,
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": {},
            },
            {
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 102,
                "clockRate": 90000,
                "parameters": {
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f",
                    "level-asymmetry-allowed": 1,
                },
            },
        ],
        "headerExtensions": [],
    })
}

fn supports_codec(capabilities: &Value, codec: &Value) -> bool {
    let Some(mime) = codec.get("mimeType").and_then(Value::as_str) else {
        return false;
    };
    capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs.iter().any(|c| {
                c.get("mimeType")
                    .and_then(Value::as_str)
                    .is_some_and(|m| m.eq_ignore_ascii_case(mime))
            })
        })
}

fn loopback_fingerprint() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
