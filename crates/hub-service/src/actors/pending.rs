//! Pending operation correlation.
//!
//! Every request that waits on the media engine is recorded here under
//! `(client, discriminator)` with a server-generated correlation id. The
//! completion must present the same id to be accepted; anything else is a
//! late completion whose request already timed out or was discarded.

use crate::errors::HubError;

use common::types::{ClientId, ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Discriminator for operations of one client.
///
/// At most one operation per key may be pending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKey {
    CreateTransport(TransportDirection),
    ConnectTransport(TransportId),
    Produce(TransportId, MediaKind),
    Consume(ProducerId),
    ResumeConsumer(ConsumerId),
    StopStreaming,
}

impl OperationKey {
    /// Wire request type, also used as the `operation` metric label.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        match self {
            OperationKey::CreateTransport(_) => "create-transport",
            OperationKey::ConnectTransport(_) => "connect-transport",
            OperationKey::Produce(..) => "produce",
            OperationKey::Consume(_) => "consume",
            OperationKey::ResumeConsumer(_) => "resume-consumer",
            OperationKey::StopStreaming => "stop-streaming",
        }
    }
}

/// An accepted request awaiting its completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub correlation_id: Uuid,
    /// Client-supplied `requestId`, echoed in the reply.
    pub request_id: Option<String>,
    pub started_at: Instant,
    pub deadline: Instant,
}

/// Pending operations of every client, owned by the hub actor.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<(ClientId, OperationKey), PendingOperation>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new operation and return its correlation id.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` if the same key is already pending. The existing
    /// entry is left untouched.
    pub fn insert(
        &mut self,
        client_id: &ClientId,
        key: OperationKey,
        request_id: Option<String>,
        timeout: Duration,
    ) -> Result<Uuid, HubError> {
        let slot = (client_id.clone(), key);
        if self.entries.contains_key(&slot) {
            return Err(HubError::OperationInProgress(format!(
                "{} already pending",
                slot.1.request_type()
            )));
        }
        let now = Instant::now();
        let correlation_id = Uuid::new_v4();
        self.entries.insert(
            slot,
            PendingOperation {
                correlation_id,
                request_id,
                started_at: now,
                deadline: now + timeout,
            },
        );
        Ok(correlation_id)
    }

    /// Remove and return the entry if `correlation_id` matches.
    ///
    /// A mismatch leaves the table unchanged and returns `None`.
    pub fn complete(
        &mut self,
        client_id: &ClientId,
        key: &OperationKey,
        correlation_id: Uuid,
    ) -> Option<PendingOperation> {
        let slot = (client_id.clone(), key.clone());
        match self.entries.get(&slot) {
            Some(op) if op.correlation_id == correlation_id => self.entries.remove(&slot),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_pending(&self, client_id: &ClientId, key: &OperationKey) -> bool {
        self.entries.contains_key(&(client_id.clone(), key.clone()))
    }

    /// Remove every entry past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<(ClientId, OperationKey, PendingOperation)> {
        let expired: Vec<(ClientId, OperationKey)> = self
            .entries
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(slot, _)| slot.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|slot| {
                let op = self.entries.remove(&slot)?;
                Some((slot.0, slot.1, op))
            })
            .collect()
    }

    /// Remove and return every entry of a client.
    pub fn drain_client(&mut self, client_id: &ClientId) -> Vec<(OperationKey, PendingOperation)> {
        let keys: Vec<OperationKey> = self
            .entries
            .keys()
            .filter(|(c, _)| c == client_id)
            .map(|(_, key)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let op = self.entries.remove(&(client_id.clone(), key.clone()))?;
                Some((key, op))
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn client(id: &str) -> ClientId {
        ClientId::from(id)
    }

    #[tokio::test]
    async fn test_duplicate_key_is_rejected_without_overwrite() {
        let mut table = PendingTable::new();
        let key = OperationKey::CreateTransport(TransportDirection::Send);

        let first = table
            .insert(&client("a"), key.clone(), Some("r1".into()), TIMEOUT)
            .unwrap();
        let err = table
            .insert(&client("a"), key.clone(), Some("r2".into()), TIMEOUT)
            .unwrap_err();

        assert!(matches!(err, HubError::OperationInProgress(_)));
        let op = table.complete(&client("a"), &key, first).unwrap();
        assert_eq!(op.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_same_key_for_different_clients_is_independent() {
        let mut table = PendingTable::new();
        let key = OperationKey::StopStreaming;
        table.insert(&client("a"), key.clone(), None, TIMEOUT).unwrap();
        table.insert(&client("b"), key, None, TIMEOUT).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_different_directions_are_distinct_keys() {
        let mut table = PendingTable::new();
        table
            .insert(&client("a"), OperationKey::CreateTransport(TransportDirection::Send), None, TIMEOUT)
            .unwrap();
        table
            .insert(&client("a"), OperationKey::CreateTransport(TransportDirection::Recv), None, TIMEOUT)
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_complete_with_stale_correlation_id_is_ignored() {
        let mut table = PendingTable::new();
        let key = OperationKey::Consume(ProducerId::from("p"));
        table.insert(&client("a"), key.clone(), None, TIMEOUT).unwrap();

        assert!(table.complete(&client("a"), &key, Uuid::new_v4()).is_none());
        assert!(table.is_pending(&client("a"), &key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_returns_only_overdue_entries() {
        let mut table = PendingTable::new();
        table
            .insert(&client("a"), OperationKey::StopStreaming, None, Duration::from_secs(1))
            .unwrap();
        table
            .insert(&client("b"), OperationKey::StopStreaming, None, Duration::from_secs(30))
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let expired = table.expire(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired.first().unwrap().0, client("a"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_client_returns_all_of_its_entries() {
        let mut table = PendingTable::new();
        table.insert(&client("a"), OperationKey::StopStreaming, None, TIMEOUT).unwrap();
        table
            .insert(&client("a"), OperationKey::Consume(ProducerId::from("p")), None, TIMEOUT)
            .unwrap();
        table.insert(&client("b"), OperationKey::StopStreaming, None, TIMEOUT).unwrap();

        let drained = table.drain_client(&client("a"));
        assert_eq!(drained.len(), 2);
        assert!(drained
            .iter()
            .any(|(key, _)| *key == OperationKey::Consume(ProducerId::from("p"))));
        assert_eq!(table.len(), 1);
        assert!(table.drain_client(&client("a")).is_empty());
    }
}
