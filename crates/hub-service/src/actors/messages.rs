//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::connection::ConnectionActorHandle;
use super::pending::OperationKey;
use crate::errors::HubError;
use crate::media::{ConsumerDescriptor, TransportDescriptor};
use crate::signaling::ServerMessage;

use common::types::{ClientId, ConsumerId, MediaKind, ProducerId, Role, TransportId};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Messages sent to the `HubActor`.
#[derive(Debug)]
pub enum HubMessage {
    /// A transport connection was accepted.
    Connect {
        client_id: ClientId,
        origin: Option<SocketAddr>,
        /// Encoded frames for the socket writer.
        outbound: mpsc::Sender<String>,
        respond_to: oneshot::Sender<Result<ConnectionActorHandle, HubError>>,
    },

    /// A text frame arrived from a client.
    Inbound { client_id: ClientId, frame: String },

    /// The transport connection closed. Sent exactly once per connection.
    Disconnect { client_id: ClientId },

    /// Snapshot of sessions and streamers for presence reporting.
    GetTopology {
        respond_to: oneshot::Sender<TopologySnapshot>,
    },

    /// Stop accepting connections and close every session.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Encode and write a message to the client.
    Send { message: ServerMessage },

    /// Flush what is queued and stop.
    Close { reason: String },
}

/// Result of an adapter call made on behalf of a pending request.
///
/// Carries the correlation id minted when the request was accepted, so the
/// hub can tell a live completion from one whose request already timed out.
#[derive(Debug)]
pub(crate) struct Completion {
    pub client_id: ClientId,
    pub key: OperationKey,
    pub correlation_id: Uuid,
    pub outcome: CompletionOutcome,
}

#[derive(Debug)]
pub(crate) enum CompletionOutcome {
    TransportCreated(Result<TransportDescriptor, HubError>),
    TransportConnected {
        transport_id: TransportId,
        result: Result<(), HubError>,
    },
    Produced {
        kind: MediaKind,
        result: Result<ProducerId, HubError>,
    },
    Consumed {
        producer_id: ProducerId,
        result: Result<ConsumerDescriptor, HubError>,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
        result: Result<(), HubError>,
    },
    /// Owner resources released and the identity re-attached.
    StreamingStopped { released: usize },
}

/// One registered streamer in a [`TopologySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamerInfo {
    pub client_id: ClientId,
    pub name: String,
    /// Peer address of the connection, when the transport knows it.
    pub origin_address: Option<SocketAddr>,
    pub transport_count: usize,
    pub producer_count: usize,
}

/// Point-in-time view of the hub's registries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub connections: usize,
    pub viewers: usize,
    /// Ordered by registration.
    pub streamers: Vec<StreamerInfo>,
    pub unregistered: usize,
}

impl TopologySnapshot {
    /// Number of identities holding `role`.
    #[must_use]
    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Streamer => self.streamers.len(),
            Role::Viewer => self.viewers,
        }
    }
}
