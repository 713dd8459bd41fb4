//! Topology broadcaster.
//!
//! Fans topology events out to every viewer. Delivery never waits: a viewer
//! whose mailbox is full loses the event and the drop is counted.

use crate::actors::ConnectionActorHandle;
use crate::signaling::messages::{NewProducer, ProducerClosed, StreamerJoined, StreamerLeft};
use crate::signaling::ServerMessage;

use common::types::{ClientId, MediaKind, ProducerId};
use tracing::debug;

/// Delivery counts of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Send `message` to every handle in `viewers`.
pub fn to_viewers<'a, I>(viewers: I, message: &ServerMessage) -> BroadcastReport
where
    I: IntoIterator<Item = &'a ConnectionActorHandle>,
{
    let mut report = BroadcastReport::default();
    for viewer in viewers {
        if viewer.try_send(message.clone()) {
            report.delivered += 1;
        } else {
            report.dropped += 1;
        }
    }
    debug!(
        target: "hub.broadcast",
        message_type = message.message_type(),
        delivered = report.delivered,
        dropped = report.dropped,
        "Broadcast to viewers"
    );
    report
}

#[must_use]
pub fn streamer_joined(client_id: &ClientId, name: &str) -> ServerMessage {
    ServerMessage::StreamerJoined(StreamerJoined {
        client_id: client_id.clone(),
        name: name.to_string(),
    })
}

#[must_use]
pub fn streamer_left(client_id: &ClientId) -> ServerMessage {
    ServerMessage::StreamerLeft(StreamerLeft {
        client_id: client_id.clone(),
    })
}

#[must_use]
pub fn new_producer(
    client_id: &ClientId,
    producer_id: &ProducerId,
    kind: MediaKind,
    name: &str,
) -> ServerMessage {
    ServerMessage::NewProducer(NewProducer {
        client_id: client_id.clone(),
        producer_id: producer_id.clone(),
        kind,
        name: name.to_string(),
    })
}

#[must_use]
pub fn producer_closed(client_id: &ClientId, producer_id: &ProducerId) -> ServerMessage {
    ServerMessage::ProducerClosed(ProducerClosed {
        client_id: client_id.clone(),
        producer_id: producer_id.clone(),
    })
}
