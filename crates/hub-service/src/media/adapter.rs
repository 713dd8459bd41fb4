//! Resource lifecycle adapter.
//!
//! Facade over a [`MediaEngine`] that tags every transport, producer and
//! consumer with the [`Owner`] that created it. Ownership is checked on every
//! request, so a client can only touch its own resources, and `cleanup`
//! releases everything an owner holds in one idempotent call.
//!
//! Engine calls are never made while the ownership table is locked. A
//! resource whose creation completes after its owner was cleaned up (or
//! after the transport it was created on went away) is closed again right
//! away and reported as not found.
//!
//! Closures the engine performs on its own are translated into
//! [`ResourceEvent`]s tagged with the owner and delivered on the channel
//! returned from [`MediaAdapter::spawn`].

use super::engine::{ConsumerDescriptor, EngineError, EngineEvent, MediaEngine, TransportDescriptor};
use crate::errors::HubError;

use common::types::{ClientId, ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Who a media resource belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A signaling client.
    Client(ClientId),
    /// The recording capture pipeline of one producer.
    Capture(ProducerId),
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Client(id) => write!(f, "client:{id}"),
            Owner::Capture(id) => write!(f, "capture:{id}"),
        }
    }
}

/// Engine-initiated closure or failure, resolved to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    ProducerClosed {
        owner: Owner,
        producer_id: ProducerId,
    },
    ConsumerClosed {
        owner: Owner,
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    EngineFailed {
        reason: String,
    },
}

#[derive(Debug, Default)]
struct OwnedResources {
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

impl OwnedResources {
    fn len(&self) -> usize {
        self.transports.len() + self.producers.len() + self.consumers.len()
    }
}

#[derive(Debug)]
struct ProducerEntry {
    owner: Owner,
    transport_id: TransportId,
}

#[derive(Debug)]
struct ConsumerEntry {
    owner: Owner,
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Debug, Default)]
struct OwnershipTable {
    owners: HashMap<Owner, OwnedResources>,
    transports: HashMap<TransportId, Owner>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl OwnershipTable {
    fn owns_transport(&self, owner: &Owner, transport_id: &TransportId) -> bool {
        self.transports.get(transport_id) == Some(owner)
    }

    fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<ProducerEntry> {
        let entry = self.producers.remove(producer_id)?;
        if let Some(owned) = self.owners.get_mut(&entry.owner) {
            owned.producers.remove(producer_id);
        }
        Some(entry)
    }

    fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(consumer_id)?;
        if let Some(owned) = self.owners.get_mut(&entry.owner) {
            owned.consumers.remove(consumer_id);
        }
        Some(entry)
    }

    fn remove_transport(&mut self, transport_id: &TransportId) -> Option<Owner> {
        let owner = self.transports.remove(transport_id)?;
        if let Some(owned) = self.owners.get_mut(&owner) {
            owned.transports.remove(transport_id);
        }
        Some(owner)
    }
}

/// Counts of what an owner currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnedCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct AdapterInner {
    engine: Arc<dyn MediaEngine>,
    table: Mutex<OwnershipTable>,
}

/// Cloneable handle to the resource lifecycle adapter.
#[derive(Clone)]
pub struct MediaAdapter {
    inner: Arc<AdapterInner>,
}

impl fmt::Debug for MediaAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaAdapter").finish_non_exhaustive()
    }
}

impl MediaAdapter {
    /// Create the adapter and start translating engine events.
    ///
    /// Returns the adapter, the receiver for owner-resolved events, and the
    /// event task's join handle. The task exits when `cancel_token` fires or
    /// the engine drops its event sender.
    pub fn spawn(
        engine: Arc<dyn MediaEngine>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ResourceEvent>, JoinHandle<()>) {
        let adapter = Self {
            inner: Arc::new(AdapterInner {
                engine,
                table: Mutex::new(OwnershipTable::default()),
            }),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            adapter
                .clone()
                .run_event_loop(engine_events, events_tx, cancel_token),
        );
        (adapter, events_rx, task)
    }

    #[instrument(skip_all, name = "hub.media.adapter.events")]
    async fn run_event_loop(
        self,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        events_tx: mpsc::UnboundedSender<ResourceEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                event = engine_events.recv() => {
                    let Some(event) = event else {
                        debug!(target: "hub.media.adapter", "Engine event channel closed");
                        break;
                    };
                    if let Some(resolved) = self.resolve_event(event).await {
                        if events_tx.send(resolved).is_err() {
                            debug!(target: "hub.media.adapter", "Resource event receiver dropped");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn resolve_event(&self, event: EngineEvent) -> Option<ResourceEvent> {
        match event {
            EngineEvent::ProducerClosed { producer_id, cause } => {
                let entry = self.inner.table.lock().await.remove_producer(&producer_id)?;
                debug!(
                    target: "hub.media.adapter",
                    producer_id = %producer_id,
                    owner = %entry.owner,
                    cause = ?cause,
                    "Producer closed by engine"
                );
                Some(ResourceEvent::ProducerClosed {
                    owner: entry.owner,
                    producer_id,
                })
            }
            EngineEvent::ConsumerClosed {
                consumer_id,
                producer_id,
                cause,
            } => {
                let entry = self.inner.table.lock().await.remove_consumer(&consumer_id)?;
                debug!(
                    target: "hub.media.adapter",
                    consumer_id = %consumer_id,
                    owner = %entry.owner,
                    cause = ?cause,
                    "Consumer closed by engine"
                );
                Some(ResourceEvent::ConsumerClosed {
                    owner: entry.owner,
                    consumer_id,
                    producer_id,
                })
            }
            EngineEvent::Fatal { reason } => {
                error!(target: "hub.media.adapter", reason = %reason, "Media engine reported fatal failure");
                Some(ResourceEvent::EngineFailed { reason })
            }
        }
    }

    /// Engine capabilities advertised to clients.
    #[must_use]
    pub fn capabilities(&self) -> Value {
        self.inner.engine.capabilities()
    }

    /// Mark an owner live so it may create resources.
    pub async fn attach(&self, owner: Owner) {
        self.inner
            .table
            .lock()
            .await
            .owners
            .entry(owner)
            .or_default();
    }

    /// Whether an owner is currently live.
    pub async fn is_attached(&self, owner: &Owner) -> bool {
        self.inner.table.lock().await.owners.contains_key(owner)
    }

    /// What an owner currently holds, if it is live.
    pub async fn owned(&self, owner: &Owner) -> Option<OwnedCounts> {
        let table = self.inner.table.lock().await;
        table.owners.get(owner).map(|owned| OwnedCounts {
            transports: owned.transports.len(),
            producers: owned.producers.len(),
            consumers: owned.consumers.len(),
        })
    }

    /// Owner of a live producer.
    pub async fn producer_owner(&self, producer_id: &ProducerId) -> Option<Owner> {
        self.inner
            .table
            .lock()
            .await
            .producers
            .get(producer_id)
            .map(|e| e.owner.clone())
    }

    /// Create a WebRTC transport for a client.
    pub async fn create_transport(
        &self,
        owner: &Owner,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, HubError> {
        self.require_attached(owner).await?;

        let descriptor = self.inner.engine.create_webrtc_transport(direction).await?;

        if self.register_transport(owner, &descriptor.id).await {
            Ok(descriptor)
        } else {
            self.release_orphan_transport(&descriptor.id).await;
            Err(HubError::ResourceNotFound(format!("owner {owner} was released")))
        }
    }

    /// Complete DTLS setup on a client's transport.
    pub async fn connect_transport(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), HubError> {
        self.require_transport(owner, transport_id).await?;
        self.inner
            .engine
            .connect_webrtc_transport(transport_id, dtls_parameters)
            .await?;
        Ok(())
    }

    /// Create a plain RTP transport for the capture pipeline.
    pub async fn create_plain_transport(
        &self,
        owner: &Owner,
        listen_ip: IpAddr,
    ) -> Result<TransportId, HubError> {
        self.require_attached(owner).await?;

        let transport_id = self.inner.engine.create_plain_transport(listen_ip).await?;

        if self.register_transport(owner, &transport_id).await {
            Ok(transport_id)
        } else {
            self.release_orphan_transport(&transport_id).await;
            Err(HubError::ResourceNotFound(format!("owner {owner} was released")))
        }
    }

    /// Point a plain transport at an RTP/RTCP port pair.
    pub async fn connect_plain_transport(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
        rtp: SocketAddr,
        rtcp_port: u16,
    ) -> Result<(), HubError> {
        self.require_transport(owner, transport_id).await?;
        self.inner
            .engine
            .connect_plain_transport(transport_id, rtp, rtcp_port)
            .await?;
        Ok(())
    }

    /// Create a producer on a transport the owner holds.
    pub async fn produce(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, HubError> {
        self.require_transport(owner, transport_id).await?;

        let producer_id = self
            .inner
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await?;

        let registered = {
            let mut table = self.inner.table.lock().await;
            if table.owns_transport(owner, transport_id) {
                table.producers.insert(
                    producer_id.clone(),
                    ProducerEntry {
                        owner: owner.clone(),
                        transport_id: transport_id.clone(),
                    },
                );
                if let Some(owned) = table.owners.get_mut(owner) {
                    owned.producers.insert(producer_id.clone());
                }
                true
            } else {
                false
            }
        };

        if registered {
            debug!(target: "hub.media.adapter", owner = %owner, producer_id = %producer_id, kind = kind.as_str(), "Producer created");
            Ok(producer_id)
        } else {
            ignore_not_found(self.inner.engine.close_producer(&producer_id).await);
            Err(HubError::ResourceNotFound(format!(
                "transport {transport_id} was closed"
            )))
        }
    }

    /// Whether a live producer can be consumed with the given capabilities.
    pub async fn can_consume(&self, producer_id: &ProducerId, capabilities: &Value) -> bool {
        if !self.inner.table.lock().await.producers.contains_key(producer_id) {
            return false;
        }
        self.inner.engine.can_consume(producer_id, capabilities).await
    }

    /// Create a consumer for `producer_id` on a transport the owner holds.
    pub async fn consume(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &Value,
        paused: bool,
    ) -> Result<ConsumerDescriptor, HubError> {
        {
            let table = self.inner.table.lock().await;
            if !table.producers.contains_key(producer_id) {
                return Err(HubError::ResourceNotFound(format!(
                    "producer {producer_id} not found"
                )));
            }
            if !table.owns_transport(owner, transport_id) {
                return Err(HubError::ResourceNotFound(format!(
                    "transport {transport_id} not found"
                )));
            }
        }

        if !self.inner.engine.can_consume(producer_id, capabilities).await {
            return Err(HubError::EngineRejected(format!(
                "cannot consume producer {producer_id} with the given capabilities"
            )));
        }

        let descriptor = self
            .inner
            .engine
            .consume(transport_id, producer_id, capabilities, paused)
            .await?;

        let registered = {
            let mut table = self.inner.table.lock().await;
            if table.owns_transport(owner, transport_id)
                && table.producers.contains_key(producer_id)
            {
                table.consumers.insert(
                    descriptor.id.clone(),
                    ConsumerEntry {
                        owner: owner.clone(),
                        transport_id: transport_id.clone(),
                        producer_id: producer_id.clone(),
                    },
                );
                if let Some(owned) = table.owners.get_mut(owner) {
                    owned.consumers.insert(descriptor.id.clone());
                }
                true
            } else {
                false
            }
        };

        if registered {
            Ok(descriptor)
        } else {
            ignore_not_found(self.inner.engine.close_consumer(&descriptor.id).await);
            Err(HubError::ResourceNotFound(format!(
                "producer {producer_id} or transport {transport_id} was closed"
            )))
        }
    }

    /// Resume a paused consumer the owner holds.
    pub async fn resume_consumer(
        &self,
        owner: &Owner,
        consumer_id: &ConsumerId,
    ) -> Result<(), HubError> {
        {
            let table = self.inner.table.lock().await;
            if table.consumers.get(consumer_id).map(|e| &e.owner) != Some(owner) {
                return Err(HubError::ResourceNotFound(format!(
                    "consumer {consumer_id} not found"
                )));
            }
        }
        self.inner.engine.resume_consumer(consumer_id).await?;
        Ok(())
    }

    /// Close one consumer the owner holds.
    pub async fn close_consumer(
        &self,
        owner: &Owner,
        consumer_id: &ConsumerId,
    ) -> Result<(), HubError> {
        {
            let mut table = self.inner.table.lock().await;
            if table.consumers.get(consumer_id).map(|e| &e.owner) != Some(owner) {
                return Err(HubError::ResourceNotFound(format!(
                    "consumer {consumer_id} not found"
                )));
            }
            table.remove_consumer(consumer_id);
        }
        ignore_not_found(self.inner.engine.close_consumer(consumer_id).await);
        Ok(())
    }

    /// Close one producer the owner holds.
    pub async fn close_producer(
        &self,
        owner: &Owner,
        producer_id: &ProducerId,
    ) -> Result<(), HubError> {
        {
            let mut table = self.inner.table.lock().await;
            if table.producers.get(producer_id).map(|e| &e.owner) != Some(owner) {
                return Err(HubError::ResourceNotFound(format!(
                    "producer {producer_id} not found"
                )));
            }
            table.remove_producer(producer_id);
        }
        ignore_not_found(self.inner.engine.close_producer(producer_id).await);
        Ok(())
    }

    /// Close one transport the owner holds, along with what was created on it.
    pub async fn close_transport(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
    ) -> Result<(), HubError> {
        {
            let mut table = self.inner.table.lock().await;
            if !table.owns_transport(owner, transport_id) {
                return Err(HubError::ResourceNotFound(format!(
                    "transport {transport_id} not found"
                )));
            }
            table.remove_transport(transport_id);
            let producers: Vec<ProducerId> = table
                .producers
                .iter()
                .filter(|(_, e)| &e.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for producer_id in producers {
                table.remove_producer(&producer_id);
            }
            let consumers: Vec<ConsumerId> = table
                .consumers
                .iter()
                .filter(|(_, e)| &e.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for consumer_id in consumers {
                table.remove_consumer(&consumer_id);
            }
        }
        ignore_not_found(self.inner.engine.close_transport(transport_id).await);
        Ok(())
    }

    /// Release every resource an owner holds and detach it.
    ///
    /// Idempotent: a second call for the same owner makes no engine calls and
    /// returns zero. Consumers go first, then producers, then transports.
    #[instrument(skip_all, name = "hub.media.adapter.cleanup", fields(owner = %owner))]
    pub async fn cleanup(&self, owner: &Owner) -> usize {
        let owned = {
            let mut table = self.inner.table.lock().await;
            let Some(owned) = table.owners.remove(owner) else {
                return 0;
            };
            for id in &owned.consumers {
                table.consumers.remove(id);
            }
            for id in &owned.producers {
                table.producers.remove(id);
            }
            for id in &owned.transports {
                table.transports.remove(id);
            }
            owned
        };

        let released = owned.len();

        for consumer_id in &owned.consumers {
            ignore_not_found(self.inner.engine.close_consumer(consumer_id).await);
        }
        for producer_id in &owned.producers {
            ignore_not_found(self.inner.engine.close_producer(producer_id).await);
        }
        for transport_id in &owned.transports {
            ignore_not_found(self.inner.engine.close_transport(transport_id).await);
        }

        if released > 0 {
            info!(target: "hub.media.adapter", owner = %owner, released, "Owner resources released");
        }
        released
    }

    async fn require_attached(&self, owner: &Owner) -> Result<(), HubError> {
        if self.is_attached(owner).await {
            Ok(())
        } else {
            Err(HubError::ResourceNotFound(format!("owner {owner} is not attached")))
        }
    }

    async fn require_transport(
        &self,
        owner: &Owner,
        transport_id: &TransportId,
    ) -> Result<(), HubError> {
        if self.inner.table.lock().await.owns_transport(owner, transport_id) {
            Ok(())
        } else {
            Err(HubError::ResourceNotFound(format!(
                "transport {transport_id} not found"
            )))
        }
    }

    /// Record a freshly created transport if its owner is still live.
    async fn register_transport(&self, owner: &Owner, transport_id: &TransportId) -> bool {
        let mut table = self.inner.table.lock().await;
        let Some(owned) = table.owners.get_mut(owner) else {
            return false;
        };
        owned.transports.insert(transport_id.clone());
        table.transports.insert(transport_id.clone(), owner.clone());
        true
    }

    async fn release_orphan_transport(&self, transport_id: &TransportId) {
        warn!(target: "hub.media.adapter", transport_id = %transport_id, "Releasing transport created for a released owner");
        ignore_not_found(self.inner.engine.close_transport(transport_id).await);
    }
}

/// Closing something the engine already closed is fine; anything else is logged.
fn ignore_not_found(result: Result<(), EngineError>) {
    match result {
        Ok(()) | Err(EngineError::NotFound(_)) => {}
        Err(e) => {
            warn!(target: "hub.media.adapter", error = %e, "Engine close failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::LoopbackEngine;
    use serde_json::json;

    fn vp8() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }] })
    }

    struct Fixture {
        adapter: MediaAdapter,
        engine: Arc<LoopbackEngine>,
        events: mpsc::UnboundedReceiver<ResourceEvent>,
        _cancel: CancellationToken,
    }

    fn fixture() -> Fixture {
        let (engine, engine_events) = LoopbackEngine::new();
        let engine = Arc::new(engine);
        let cancel = CancellationToken::new();
        let (adapter, events, _task) = MediaAdapter::spawn(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            engine_events,
            cancel.clone(),
        );
        Fixture {
            adapter,
            engine,
            events,
            _cancel: cancel,
        }
    }

    fn client(name: &str) -> Owner {
        Owner::Client(ClientId::from(name))
    }

    #[tokio::test]
    async fn test_unattached_owner_cannot_create_transport() {
        let f = fixture();
        let err = f
            .adapter
            .create_transport(&client("nobody"), TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ResourceNotFound(_)));
        assert_eq!(f.engine.counts().await.transports, 0);
    }

    #[tokio::test]
    async fn test_transport_not_usable_by_other_owner() {
        let f = fixture();
        let alice = client("alice");
        let bob = client("bob");
        f.adapter.attach(alice.clone()).await;
        f.adapter.attach(bob.clone()).await;

        let t = f
            .adapter
            .create_transport(&alice, TransportDirection::Send)
            .await
            .unwrap();

        let err = f
            .adapter
            .produce(&bob, &t.id, MediaKind::Video, &vp8())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_is_not_found() {
        let f = fixture();
        let viewer = client("viewer");
        f.adapter.attach(viewer.clone()).await;
        let recv = f
            .adapter
            .create_transport(&viewer, TransportDirection::Recv)
            .await
            .unwrap();

        let err = f
            .adapter
            .consume(
                &viewer,
                &recv.id,
                &ProducerId::from("never-existed"),
                &f.adapter.capabilities(),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_capability_mismatch_is_rejected() {
        let f = fixture();
        let streamer = client("streamer");
        let viewer = client("viewer");
        f.adapter.attach(streamer.clone()).await;
        f.adapter.attach(viewer.clone()).await;

        let send = f.adapter.create_transport(&streamer, TransportDirection::Send).await.unwrap();
        let recv = f.adapter.create_transport(&viewer, TransportDirection::Recv).await.unwrap();
        let producer = f.adapter.produce(&streamer, &send.id, MediaKind::Video, &vp8()).await.unwrap();

        let audio_only = json!({ "codecs": [{ "mimeType": "audio/opus" }] });
        assert!(!f.adapter.can_consume(&producer, &audio_only).await);
        let err = f
            .adapter
            .consume(&viewer, &recv.id, &producer, &audio_only, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::EngineRejected(_)));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        let streamer = client("streamer");
        f.adapter.attach(streamer.clone()).await;
        let send = f.adapter.create_transport(&streamer, TransportDirection::Send).await.unwrap();
        f.adapter.produce(&streamer, &send.id, MediaKind::Video, &vp8()).await.unwrap();
        f.adapter.produce(&streamer, &send.id, MediaKind::Audio, &json!({"codecs": [{"mimeType": "audio/opus"}]})).await.unwrap();

        assert_eq!(f.adapter.cleanup(&streamer).await, 3);
        assert_eq!(f.adapter.cleanup(&streamer).await, 0);

        assert_eq!(f.engine.counts().await, crate::media::LoopbackCounts::default());
        assert!(!f.adapter.is_attached(&streamer).await);
    }

    #[tokio::test]
    async fn test_cleanup_of_producer_notifies_consumer_owner() {
        let mut f = fixture();
        let streamer = client("streamer");
        let viewer = client("viewer");
        f.adapter.attach(streamer.clone()).await;
        f.adapter.attach(viewer.clone()).await;

        let send = f.adapter.create_transport(&streamer, TransportDirection::Send).await.unwrap();
        let recv = f.adapter.create_transport(&viewer, TransportDirection::Recv).await.unwrap();
        let producer = f.adapter.produce(&streamer, &send.id, MediaKind::Video, &vp8()).await.unwrap();
        let consumer = f
            .adapter
            .consume(&viewer, &recv.id, &producer, &f.adapter.capabilities(), true)
            .await
            .unwrap();

        f.adapter.cleanup(&streamer).await;

        let event = f.events.recv().await.unwrap();
        assert_eq!(
            event,
            ResourceEvent::ConsumerClosed {
                owner: viewer.clone(),
                consumer_id: consumer.id,
                producer_id: producer,
            }
        );
        assert_eq!(f.adapter.owned(&viewer).await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_engine_closure_is_resolved_to_owner() {
        let mut f = fixture();
        let streamer = client("streamer");
        f.adapter.attach(streamer.clone()).await;
        let send = f.adapter.create_transport(&streamer, TransportDirection::Send).await.unwrap();
        let producer = f.adapter.produce(&streamer, &send.id, MediaKind::Video, &vp8()).await.unwrap();

        assert!(f.engine.close_producer_externally(&producer).await);

        assert_eq!(
            f.events.recv().await.unwrap(),
            ResourceEvent::ProducerClosed {
                owner: streamer.clone(),
                producer_id: producer.clone(),
            }
        );
        assert!(f.adapter.producer_owner(&producer).await.is_none());
    }

    #[tokio::test]
    async fn test_engine_failure_is_forwarded() {
        let mut f = fixture();
        f.engine.fail("worker exited").await;
        assert_eq!(
            f.events.recv().await.unwrap(),
            ResourceEvent::EngineFailed {
                reason: "worker exited".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_close_transport_drops_its_producers_from_table() {
        let f = fixture();
        let streamer = client("streamer");
        f.adapter.attach(streamer.clone()).await;
        let send = f.adapter.create_transport(&streamer, TransportDirection::Send).await.unwrap();
        let producer = f.adapter.produce(&streamer, &send.id, MediaKind::Video, &vp8()).await.unwrap();

        f.adapter.close_transport(&streamer, &send.id).await.unwrap();

        assert!(f.adapter.producer_owner(&producer).await.is_none());
        assert_eq!(f.adapter.owned(&streamer).await.unwrap(), OwnedCounts::default());
        assert!(f.adapter.is_attached(&streamer).await);
    }
}
