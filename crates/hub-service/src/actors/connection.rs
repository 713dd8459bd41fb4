//! `ConnectionActor` - per-connection outbound actor.
//!
//! Each `ConnectionActor`:
//! - Serves exactly one signaling connection
//! - Receives `ServerMessage`s from the `HubActor` and encodes them as JSON
//! - Hands encoded frames to the socket writer task
//!
//! The hub only ever uses [`ConnectionActorHandle::try_send`], so a client
//! that stops draining its socket fills its own mailbox and loses messages
//! instead of stalling the hub.
//!
//! # Lifecycle
//!
//! 1. Spawned by the `HubActor` when a connection is accepted
//! 2. Runs until `Close`, cancellation, or the socket writer goes away
//! 3. Dropping the outbound sender lets the writer flush and close the socket

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::signaling::{encode, ServerMessage};

use common::types::ClientId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    client_id: ClientId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Queue a message without waiting.
    ///
    /// Returns `false` if the mailbox is full or the actor is gone. Full
    /// mailboxes are counted as drops.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(ConnectionMessage::Send { message }) {
            Ok(()) => true,
            Err(TrySendError::Full(ConnectionMessage::Send { message })) => {
                debug!(
                    target: "hub.actor.connection",
                    client_id = %self.client_id,
                    message_type = message.message_type(),
                    "Dropping outbound message"
                );
                self.mailbox.record_drop();
                false
            }
            Err(_) => false,
        }
    }

    /// Ask the actor to flush what is queued and stop. Falls back to
    /// cancellation when the mailbox is full or already closed.
    pub fn close(&self, reason: &str) {
        let close = ConnectionMessage::Close {
            reason: reason.to_string(),
        };
        if self.sender.try_send(close).is_err() {
            self.cancel();
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    client_id: ClientId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Encoded frames for the socket writer.
    outbound: mpsc::Sender<String>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        client_id: ClientId,
        outbound: mpsc::Sender<String>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            client_id.as_str(),
        ));

        let actor = Self {
            client_id: client_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            client_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "hub.actor.connection", fields(client_id = %self.client_id))]
    async fn run(mut self) {
        debug!(
            target: "hub.actor.connection",
            client_id = %self.client_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "hub.actor.connection",
                        client_id = %self.client_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(
                            target: "hub.actor.connection",
                            client_id = %self.client_id,
                            "ConnectionActor channel closed, exiting"
                        );
                        break;
                    };
                    self.mailbox.record_depth(self.receiver.len());
                    let should_exit = self.handle_message(message).await;
                    self.mailbox.record_processed();
                    self.metrics.record_message_processed();

                    if should_exit {
                        break;
                    }
                }
            }
        }

        info!(
            target: "hub.actor.connection",
            client_id = %self.client_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => !self.handle_send(&message).await,
            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "hub.actor.connection",
                    client_id = %self.client_id,
                    reason = %reason,
                    "Closing connection"
                );
                true
            }
        }
    }

    /// Encode and forward one message. Returns false once the writer is gone.
    async fn handle_send(&mut self, message: &ServerMessage) -> bool {
        let text = match encode(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "hub.actor.connection",
                    client_id = %self.client_id,
                    message_type = message.message_type(),
                    error = %e,
                    "Failed to encode outbound message"
                );
                return true;
            }
        };

        if self.outbound.send(text).await.is_err() {
            debug!(
                target: "hub.actor.connection",
                client_id = %self.client_id,
                "Socket writer gone"
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::messages::StreamerLeft;
    use std::time::Duration;

    fn streamer_left(id: &str) -> ServerMessage {
        ServerMessage::StreamerLeft(StreamerLeft {
            client_id: ClientId::from(id),
        })
    }

    #[tokio::test]
    async fn test_connection_actor_encodes_messages() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (handle, _task) = ConnectionActor::spawn(
            ClientId::from("c-1"),
            out_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        assert!(handle.try_send(streamer_left("s-1")));
        let frame = out_rx.recv().await.unwrap();
        assert_eq!(
            frame,
            r#"{"type":"streamer-left","payload":{"clientId":"s-1"}}"#
        );

        handle.cancel();
    }

    #[tokio::test]
    async fn test_connection_actor_close_flushes_and_exits() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (handle, task) = ConnectionActor::spawn(
            ClientId::from("c-close"),
            out_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        assert!(handle.try_send(streamer_left("s-1")));
        handle.close("hub shutting down");

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());

        assert!(out_rx.recv().await.is_some());
        // Actor dropped its sender, so the writer sees end of stream.
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mailbox_depth_reflects_queued_messages() {
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (handle, _task) = ConnectionActor::spawn(
            ClientId::from("c-slow"),
            out_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        // Queued before the actor task first runs.
        for i in 0..5 {
            assert!(handle.try_send(streamer_left(&format!("s-{i}"))));
        }
        for _ in 0..5 {
            assert!(out_rx.recv().await.is_some());
        }

        assert_eq!(handle.mailbox.peak_depth(), 4);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_connection_actor_exits_when_writer_gone() {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (handle, task) = ConnectionActor::spawn(
            ClientId::from("c-gone"),
            out_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        drop(out_rx);

        assert!(handle.try_send(streamer_left("s-1")));

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connection_actor_parent_cancellation() {
        let parent_token = CancellationToken::new();
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (handle, task) = ConnectionActor::spawn(
            ClientId::from("c-parent"),
            out_tx,
            parent_token.child_token(),
            ActorMetrics::new(),
        );

        parent_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_try_send_after_exit_returns_false() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (handle, task) = ConnectionActor::spawn(
            ClientId::from("c-dead"),
            out_tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        handle.cancel();
        task.await.unwrap();

        assert!(!handle.try_send(streamer_left("s-1")));
    }
}
