//! `HubActor` - singleton session orchestrator.
//!
//! The `HubActor`:
//! - Owns the session table, the streamer registry and the viewer set
//! - Dispatches inbound signaling frames in arrival order
//! - Runs media adapter calls as detached tasks and matches their results
//!   back to the pending request by correlation id
//! - Turns adapter resource events into topology broadcasts
//! - Triggers recording start and stop on the recording controller
//!
//! # Suspension points
//!
//! Registry state is only touched inside the actor loop. Adapter calls run on
//! spawned tasks and report back through the completion channel, so the loop
//! never waits on the engine while a frame is half-handled.
//!
//! # Stop streaming
//!
//! `stop-streaming` removes the streamer from the registry immediately and
//! releases its media resources on a background task. Frames the identity
//! sends before the release finishes are queued and replayed afterwards, so
//! a follow-up `register` never races the cleanup.

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{Completion, CompletionOutcome, HubMessage, StreamerInfo, TopologySnapshot};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::pending::{OperationKey, PendingOperation, PendingTable};
use crate::broadcast;
use crate::config::Config;
use crate::errors::HubError;
use crate::media::{MediaAdapter, Owner, ResourceEvent};
use crate::observability::metrics as prom;
use crate::recording::{RecordingControllerHandle, RecordingRequest};
use crate::signaling::messages::{
    ConsumerClosed, ConsumerResumed, Consumed, PanZoomCommand, PanZoomPayload, ProducerList,
    ProducerListEntry, ProducerSummary, Produced, RegisterPayload, Registered, StreamerList,
    StreamerSummary, StreamingStopped, TransportConnected, TransportCreated, Welcome,
};
use crate::signaling::{decode, ClientRequest, InboundFrame, ServerMessage};

use common::secret::{constant_time_eq, ExposeSecret, SecretString};
use common::types::{ClientId, ConsumerId, MediaKind, ProducerId, Role, TransportId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1000;

/// How often pending operations are checked against their deadline.
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Frames queued per identity while a stop-streaming release is running.
const MAX_BACKLOG: usize = 256;

/// Hub runtime settings.
#[derive(Clone)]
pub struct HubSettings {
    pub hub_id: String,
    pub max_connections: usize,
    pub request_timeout: Duration,
    /// Token clients must present in `register`, when set.
    pub access_token: Option<SecretString>,
}

impl HubSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            hub_id: config.hub_id.clone(),
            max_connections: config.max_connections,
            request_timeout: config.request_timeout,
            access_token: config.access_token.clone(),
        }
    }
}

impl fmt::Debug for HubSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubSettings")
            .field("hub_id", &self.hub_id)
            .field("max_connections", &self.max_connections)
            .field("request_timeout", &self.request_timeout)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Collaborators the hub is constructed with.
pub struct HubDependencies {
    pub adapter: MediaAdapter,
    /// Owner-resolved engine events from [`MediaAdapter::spawn`].
    pub resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
    pub recorder: RecordingControllerHandle,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to the `HubActor`.
#[derive(Clone, Debug)]
pub struct HubActorHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
}

impl HubActorHandle {
    /// Admit a new connection.
    ///
    /// On success the hub has queued `welcome` on the returned connection,
    /// whose encoded frames arrive on `outbound`.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when the hub is full, `Internal` if the actor is gone.
    pub async fn connect(
        &self,
        client_id: ClientId,
        origin: Option<SocketAddr>,
        outbound: mpsc::Sender<String>,
    ) -> Result<ConnectionActorHandle, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Connect {
                client_id,
                origin,
                outbound,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))?
    }

    /// Deliver one inbound text frame. Frames of one client keep their order.
    pub async fn inbound(&self, client_id: ClientId, frame: String) -> Result<(), HubError> {
        self.sender
            .send(HubMessage::Inbound { client_id, frame })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))
    }

    /// Report that a connection closed.
    pub async fn disconnect(&self, client_id: ClientId) -> Result<(), HubError> {
        self.sender
            .send(HubMessage::Disconnect { client_id })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn topology(&self) -> Result<TopologySnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::GetTopology { respond_to: tx })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Whether a request was answered inline or is waiting on the adapter.
enum Dispatch {
    Replied,
    Pending,
}

struct Session {
    role: Option<Role>,
    name: String,
    origin: Option<SocketAddr>,
    connection: ConnectionActorHandle,
    task: JoinHandle<()>,
    /// Set while a stop-streaming release runs; frames go to `backlog`.
    blocked: bool,
    backlog: VecDeque<String>,
}

struct StreamerRecord {
    name: String,
    /// Registration order.
    seq: u64,
    transports: Vec<TransportId>,
    producers: Vec<(ProducerId, MediaKind)>,
}

/// The `HubActor` implementation.
pub struct HubActor {
    settings: HubSettings,
    receiver: mpsc::Receiver<HubMessage>,
    cancel_token: CancellationToken,
    /// Cancelled when the media engine fails; drives process shutdown.
    fatal_token: CancellationToken,
    adapter: MediaAdapter,
    resource_events: mpsc::UnboundedReceiver<ResourceEvent>,
    recorder: RecordingControllerHandle,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    sessions: HashMap<ClientId, Session>,
    streamers: HashMap<ClientId, StreamerRecord>,
    viewers: HashSet<ClientId>,
    pending: PendingTable,
    next_seq: u64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl HubActor {
    /// Spawn the hub.
    ///
    /// `cancel_token` stops the actor; `fatal_token` is cancelled by the hub
    /// itself when the media engine reports a fatal failure.
    pub fn spawn(
        settings: HubSettings,
        deps: HubDependencies,
        cancel_token: CancellationToken,
        fatal_token: CancellationToken,
    ) -> (HubActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let mailbox = MailboxMonitor::new(ActorType::Hub, settings.hub_id.clone());

        let actor = Self {
            settings,
            receiver,
            cancel_token: cancel_token.clone(),
            fatal_token,
            adapter: deps.adapter,
            resource_events: deps.resource_events,
            recorder: deps.recorder,
            completions_tx,
            completions_rx,
            sessions: HashMap::new(),
            streamers: HashMap::new(),
            viewers: HashSet::new(),
            pending: PendingTable::new(),
            next_seq: 0,
            metrics: deps.metrics,
            mailbox,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = HubActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "hub.actor.hub", fields(hub_id = %self.settings.hub_id))]
    async fn run(mut self) {
        info!(
            target: "hub.actor.hub",
            hub_id = %self.settings.hub_id,
            max_connections = self.settings.max_connections,
            "HubActor started"
        );

        let mut sweep = tokio::time::interval(PENDING_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "hub.actor.hub", "HubActor received cancellation signal");
                    break;
                }

                _ = sweep.tick() => {
                    self.expire_pending();
                }

                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion).await;
                }

                Some(event) = self.resource_events.recv() => {
                    self.handle_resource_event(event);
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "hub.actor.hub", "HubActor channel closed, exiting");
                        break;
                    };
                    self.mailbox.record_depth(self.receiver.len());
                    let exit = self.handle_message(message).await;
                    self.mailbox.record_processed();
                    self.metrics.record_message_processed();
                    if exit {
                        break;
                    }
                }
            }
        }

        self.close_all_sessions().await;

        info!(
            target: "hub.actor.hub",
            hub_id = %self.settings.hub_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "HubActor stopped"
        );
    }

    /// Returns true if the actor should exit.
    async fn handle_message(&mut self, message: HubMessage) -> bool {
        match message {
            HubMessage::Connect {
                client_id,
                origin,
                outbound,
                respond_to,
            } => {
                let result = self.handle_connect(client_id, origin, outbound).await;
                let _ = respond_to.send(result);
                false
            }
            HubMessage::Inbound { client_id, frame } => {
                self.handle_inbound(&client_id, frame);
                false
            }
            HubMessage::Disconnect { client_id } => {
                self.handle_disconnect(&client_id);
                false
            }
            HubMessage::GetTopology { respond_to } => {
                let _ = respond_to.send(self.topology());
                false
            }
            HubMessage::Shutdown { respond_to } => {
                info!(target: "hub.actor.hub", sessions = self.sessions.len(), "Hub shutting down");
                self.close_all_sessions().await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn handle_connect(
        &mut self,
        client_id: ClientId,
        origin: Option<SocketAddr>,
        outbound: mpsc::Sender<String>,
    ) -> Result<ConnectionActorHandle, HubError> {
        if self.sessions.len() >= self.settings.max_connections {
            warn!(
                target: "hub.actor.hub",
                client_id = %client_id,
                max_connections = self.settings.max_connections,
                "Connection rejected, hub at capacity"
            );
            return Err(HubError::CapacityExceeded);
        }
        if self.sessions.contains_key(&client_id) {
            return Err(HubError::Internal(format!("duplicate client id {client_id}")));
        }

        let (connection, task) = ConnectionActor::spawn(
            client_id.clone(),
            outbound,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );
        self.adapter.attach(Owner::Client(client_id.clone())).await;

        connection.try_send(ServerMessage::Welcome(Welcome {
            client_id: client_id.clone(),
            media_capabilities: self.adapter.capabilities(),
        }));

        self.sessions.insert(
            client_id.clone(),
            Session {
                role: None,
                name: String::new(),
                origin,
                connection: connection.clone(),
                task,
                blocked: false,
                backlog: VecDeque::new(),
            },
        );
        self.publish_counts();

        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            origin = ?origin,
            connections = self.sessions.len(),
            "Client connected"
        );
        Ok(connection)
    }

    fn handle_disconnect(&mut self, client_id: &ClientId) {
        let Some(session) = self.sessions.remove(client_id) else {
            debug!(target: "hub.actor.hub", client_id = %client_id, "Disconnect for unknown client");
            return;
        };
        let Session {
            role,
            name,
            connection,
            task,
            ..
        } = session;

        let discarded = self.pending.drain_client(client_id).len();
        self.retire_streamer(client_id);
        self.viewers.remove(client_id);

        connection.cancel();
        self.watch_connection_task(task);

        let adapter = self.adapter.clone();
        let owner = Owner::Client(client_id.clone());
        tokio::spawn(async move {
            adapter.cleanup(&owner).await;
        });

        self.publish_counts();
        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            name = %name,
            role = ?role,
            discarded_operations = discarded,
            connections = self.sessions.len(),
            "Client disconnected"
        );
    }

    /// Count connection actor panics once their task ends.
    fn watch_connection_task(&self, task: JoinHandle<()>) {
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    metrics.record_panic(ActorType::Connection);
                }
            }
        });
    }

    async fn close_all_sessions(&mut self) {
        let clients: Vec<ClientId> = self.sessions.keys().cloned().collect();
        for client_id in clients {
            self.retire_streamer(&client_id);
            if let Some(session) = self.sessions.remove(&client_id) {
                session.connection.close("hub shutting down");
                self.watch_connection_task(session.task);
            }
            self.adapter.cleanup(&Owner::Client(client_id)).await;
        }
        self.viewers.clear();
        self.pending = PendingTable::new();
        self.publish_counts();
    }

    /// Drop a streamer from the registry, tell viewers and stop its recordings.
    fn retire_streamer(&mut self, client_id: &ClientId) {
        let Some(record) = self.streamers.remove(client_id) else {
            return;
        };
        self.broadcast(&broadcast::streamer_left(client_id));
        for (producer_id, _) in record.producers {
            self.recorder.submit_stop(producer_id);
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn handle_inbound(&mut self, client_id: &ClientId, frame: String) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            debug!(target: "hub.actor.hub", client_id = %client_id, "Frame from unknown client dropped");
            return;
        };

        if session.blocked {
            if session.backlog.len() < MAX_BACKLOG {
                session.backlog.push_back(frame);
            } else {
                self.reply_error(
                    client_id,
                    &HubError::OperationInProgress("stop-streaming in progress".to_string()),
                    None,
                    None,
                );
            }
            return;
        }

        self.dispatch_frame(client_id, &frame);
    }

    fn dispatch_frame(&mut self, client_id: &ClientId, frame: &str) {
        let started = Instant::now();
        let InboundFrame {
            request_id,
            request,
        } = match decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                let request_type = e.request_type().map(str::to_string);
                self.reply_error(
                    client_id,
                    &HubError::InvalidMessage(e.to_string()),
                    request_type.as_deref(),
                    e.request_id(),
                );
                return;
            }
        };

        let request_type = request.message_type();
        match self.dispatch(client_id, request, request_id.clone()) {
            Ok(Dispatch::Replied) => {
                prom::record_message_latency(request_type, started.elapsed());
            }
            Ok(Dispatch::Pending) => {}
            Err(e) => self.reply_error(client_id, &e, Some(request_type), request_id),
        }
    }

    fn dispatch(
        &mut self,
        client_id: &ClientId,
        request: ClientRequest,
        request_id: Option<String>,
    ) -> Result<Dispatch, HubError> {
        let role = self
            .sessions
            .get(client_id)
            .ok_or(HubError::NotRegistered)?
            .role;
        if request.requires_registration() && role.is_none() {
            return Err(HubError::NotRegistered);
        }

        match request {
            ClientRequest::Register(payload) => {
                self.handle_register(client_id, payload, request_id)
            }
            ClientRequest::GetStreamers => {
                let streamers = self.streamer_summaries();
                self.send_to(
                    client_id,
                    ServerMessage::StreamerList(StreamerList {
                        request_id,
                        streamers,
                    }),
                );
                Ok(Dispatch::Replied)
            }
            ClientRequest::GetProducers(payload) => {
                let producers = self.producer_entries(payload.client_id.as_ref());
                self.send_to(
                    client_id,
                    ServerMessage::ProducerList(ProducerList {
                        request_id,
                        producers,
                    }),
                );
                Ok(Dispatch::Replied)
            }
            ClientRequest::CreateTransport(payload) => {
                let direction = payload.direction;
                self.start_operation(
                    client_id,
                    OperationKey::CreateTransport(direction),
                    request_id,
                    move |adapter, owner| async move {
                        CompletionOutcome::TransportCreated(
                            adapter.create_transport(&owner, direction).await,
                        )
                    },
                )
            }
            ClientRequest::ConnectTransport(payload) => {
                let key = OperationKey::ConnectTransport(payload.transport_id.clone());
                self.start_operation(client_id, key, request_id, move |adapter, owner| async move {
                    let result = adapter
                        .connect_transport(&owner, &payload.transport_id, &payload.dtls_parameters)
                        .await;
                    CompletionOutcome::TransportConnected {
                        transport_id: payload.transport_id,
                        result,
                    }
                })
            }
            ClientRequest::Produce(payload) => {
                if role != Some(Role::Streamer) {
                    return Err(HubError::PermissionDenied(
                        "only streamers can produce".to_string(),
                    ));
                }
                let key = OperationKey::Produce(payload.transport_id.clone(), payload.kind);
                self.start_operation(client_id, key, request_id, move |adapter, owner| async move {
                    let result = adapter
                        .produce(
                            &owner,
                            &payload.transport_id,
                            payload.kind,
                            &payload.rtp_parameters,
                        )
                        .await;
                    CompletionOutcome::Produced {
                        kind: payload.kind,
                        result,
                    }
                })
            }
            ClientRequest::Consume(payload) => {
                let key = OperationKey::Consume(payload.producer_id.clone());
                self.start_operation(client_id, key, request_id, move |adapter, owner| async move {
                    let result = adapter
                        .consume(
                            &owner,
                            &payload.transport_id,
                            &payload.producer_id,
                            &payload.rtp_capabilities,
                            true,
                        )
                        .await;
                    CompletionOutcome::Consumed {
                        producer_id: payload.producer_id,
                        result,
                    }
                })
            }
            ClientRequest::ResumeConsumer(payload) => {
                let key = OperationKey::ResumeConsumer(payload.consumer_id.clone());
                self.start_operation(client_id, key, request_id, move |adapter, owner| async move {
                    let result = adapter.resume_consumer(&owner, &payload.consumer_id).await;
                    CompletionOutcome::ConsumerResumed {
                        consumer_id: payload.consumer_id,
                        result,
                    }
                })
            }
            ClientRequest::PanZoom(payload) => self.handle_pan_zoom(client_id, role, payload),
            ClientRequest::StopStreaming => {
                self.handle_stop_streaming(client_id, role, request_id)
            }
        }
    }

    /// Record a pending operation and run `op` against the adapter off-loop.
    fn start_operation<F, Fut>(
        &mut self,
        client_id: &ClientId,
        key: OperationKey,
        request_id: Option<String>,
        op: F,
    ) -> Result<Dispatch, HubError>
    where
        F: FnOnce(MediaAdapter, Owner) -> Fut,
        Fut: Future<Output = CompletionOutcome> + Send + 'static,
    {
        let correlation_id = self.pending.insert(
            client_id,
            key.clone(),
            request_id,
            self.settings.request_timeout,
        )?;

        let work = op(self.adapter.clone(), Owner::Client(client_id.clone()));
        let completions = self.completions_tx.clone();
        let client_id = client_id.clone();
        tokio::spawn(async move {
            let outcome = work.await;
            let _ = completions.send(Completion {
                client_id,
                key,
                correlation_id,
                outcome,
            });
        });

        Ok(Dispatch::Pending)
    }

    fn handle_register(
        &mut self,
        client_id: &ClientId,
        payload: RegisterPayload,
        request_id: Option<String>,
    ) -> Result<Dispatch, HubError> {
        if let Some(role) = self.sessions.get(client_id).and_then(|s| s.role) {
            return Err(HubError::AlreadyRegistered(role.to_string()));
        }
        if !self.token_accepted(payload.token.as_ref()) {
            warn!(target: "hub.actor.hub", client_id = %client_id, "Register rejected, bad access token");
            return Err(HubError::Unauthorized);
        }

        let role = payload.role;
        let name = payload
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| default_name(role, client_id), str::to_string);

        let Some(session) = self.sessions.get_mut(client_id) else {
            return Err(HubError::NotRegistered);
        };
        session.role = Some(role);
        session.name.clone_from(&name);
        let connection = session.connection.clone();

        connection.try_send(ServerMessage::Registered(Registered {
            request_id,
            client_id: client_id.clone(),
            role,
            name: name.clone(),
        }));

        match role {
            Role::Streamer => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.streamers.insert(
                    client_id.clone(),
                    StreamerRecord {
                        name: name.clone(),
                        seq,
                        transports: Vec::new(),
                        producers: Vec::new(),
                    },
                );
                self.broadcast(&broadcast::streamer_joined(client_id, &name));
            }
            Role::Viewer => {
                self.viewers.insert(client_id.clone());
                connection.try_send(ServerMessage::StreamerList(StreamerList {
                    request_id: None,
                    streamers: self.streamer_summaries(),
                }));
            }
        }

        self.publish_counts();
        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            role = %role,
            name = %name,
            "Client registered"
        );
        Ok(Dispatch::Replied)
    }

    fn token_accepted(&self, presented: Option<&SecretString>) -> bool {
        let Some(expected) = &self.settings.access_token else {
            return true;
        };
        presented.is_some_and(|token| {
            constant_time_eq(
                token.expose_secret().as_bytes(),
                expected.expose_secret().as_bytes(),
            )
        })
    }

    fn handle_pan_zoom(
        &mut self,
        client_id: &ClientId,
        role: Option<Role>,
        payload: PanZoomPayload,
    ) -> Result<Dispatch, HubError> {
        if role != Some(Role::Viewer) {
            return Err(HubError::PermissionDenied(
                "only viewers can send pan-zoom".to_string(),
            ));
        }

        let target = self
            .sessions
            .get(&payload.target_id)
            .filter(|s| s.role == Some(Role::Streamer));
        match target {
            Some(session) => {
                session
                    .connection
                    .try_send(ServerMessage::PanZoomCommand(PanZoomCommand {
                        from_id: client_id.clone(),
                        zoom: payload.zoom,
                        pan_x: payload.pan_x,
                        pan_y: payload.pan_y,
                    }));
            }
            None => {
                debug!(
                    target: "hub.actor.hub",
                    client_id = %client_id,
                    target_id = %payload.target_id,
                    "Pan-zoom target is not a live streamer, ignored"
                );
            }
        }
        Ok(Dispatch::Replied)
    }

    fn handle_stop_streaming(
        &mut self,
        client_id: &ClientId,
        role: Option<Role>,
        request_id: Option<String>,
    ) -> Result<Dispatch, HubError> {
        if role != Some(Role::Streamer) {
            return Err(HubError::PermissionDenied(
                "only streamers can stop streaming".to_string(),
            ));
        }

        // Their completions arrive later and are released as late.
        let abandoned = self.pending.drain_client(client_id);
        let discarded = abandoned.len();
        for (key, op) in abandoned {
            self.reply_error(
                client_id,
                &HubError::ResourceNotFound(format!(
                    "{} abandoned by stop-streaming",
                    key.request_type()
                )),
                Some(key.request_type()),
                op.request_id,
            );
        }
        let correlation_id = self.pending.insert(
            client_id,
            OperationKey::StopStreaming,
            request_id,
            self.settings.request_timeout,
        )?;

        self.retire_streamer(client_id);
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.role = None;
            session.blocked = true;
        }
        self.publish_counts();

        let adapter = self.adapter.clone();
        let completions = self.completions_tx.clone();
        let owner_id = client_id.clone();
        tokio::spawn(async move {
            let released = adapter.cleanup(&Owner::Client(owner_id.clone())).await;
            let _ = completions.send(Completion {
                client_id: owner_id,
                key: OperationKey::StopStreaming,
                correlation_id,
                outcome: CompletionOutcome::StreamingStopped { released },
            });
        });

        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            discarded_operations = discarded,
            "Streamer stopping"
        );
        Ok(Dispatch::Pending)
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    async fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            client_id,
            key,
            correlation_id,
            outcome,
        } = completion;
        let request_type = key.request_type();
        let pending = self.pending.complete(&client_id, &key, correlation_id);

        if let CompletionOutcome::StreamingStopped { released } = outcome {
            self.finish_stop_streaming(&client_id, pending, released)
                .await;
            return;
        }

        let Some(op) = pending else {
            self.release_late(&client_id, request_type, outcome);
            return;
        };
        prom::record_message_latency(request_type, op.started_at.elapsed());
        let request_id = op.request_id;

        let reply = match outcome {
            CompletionOutcome::TransportCreated(result) => result.map(|descriptor| {
                if let Some(record) = self.streamers.get_mut(&client_id) {
                    record.transports.push(descriptor.id.clone());
                }
                ServerMessage::TransportCreated(TransportCreated {
                    request_id: request_id.clone(),
                    id: descriptor.id,
                    direction: descriptor.direction,
                    ice_parameters: descriptor.ice_parameters,
                    ice_candidates: descriptor.ice_candidates,
                    dtls_parameters: descriptor.dtls_parameters,
                })
            }),
            CompletionOutcome::TransportConnected {
                transport_id,
                result,
            } => result.map(|()| {
                ServerMessage::TransportConnected(TransportConnected {
                    request_id: request_id.clone(),
                    id: transport_id,
                })
            }),
            CompletionOutcome::Produced { kind, result } => match result {
                Ok(producer_id) => {
                    self.accept_producer(&client_id, producer_id, kind, request_id.clone())
                }
                Err(e) => Err(e),
            },
            CompletionOutcome::Consumed {
                producer_id,
                result,
            } => result.map(|descriptor| {
                ServerMessage::Consumed(Consumed {
                    request_id: request_id.clone(),
                    id: descriptor.id,
                    client_id: self.streamer_of(&producer_id),
                    producer_id,
                    kind: descriptor.kind,
                    rtp_parameters: descriptor.rtp_parameters,
                    paused: descriptor.paused,
                })
            }),
            CompletionOutcome::ConsumerResumed {
                consumer_id,
                result,
            } => result.map(|()| {
                ServerMessage::ConsumerResumed(ConsumerResumed {
                    request_id: request_id.clone(),
                    id: consumer_id,
                })
            }),
            CompletionOutcome::StreamingStopped { .. } => return,
        };

        match reply {
            Ok(message) => {
                self.send_to(&client_id, message);
            }
            Err(e) => {
                if matches!(e, HubError::EngineFatal(_)) {
                    error!(target: "hub.actor.hub", client_id = %client_id, error = %e, "Engine failure during request");
                }
                self.reply_error(&client_id, &e, Some(request_type), request_id);
            }
        }
    }

    /// Register a confirmed producer on its streamer and announce it.
    fn accept_producer(
        &mut self,
        client_id: &ClientId,
        producer_id: ProducerId,
        kind: MediaKind,
        request_id: Option<String>,
    ) -> Result<ServerMessage, HubError> {
        let Some(record) = self.streamers.get_mut(client_id) else {
            self.close_resource(client_id, LateResource::Producer(producer_id));
            return Err(HubError::ResourceNotFound(
                "streamer is no longer registered".to_string(),
            ));
        };
        record.producers.push((producer_id.clone(), kind));
        let name = record.name.clone();

        self.broadcast(&broadcast::new_producer(client_id, &producer_id, kind, &name));
        if kind == MediaKind::Video {
            self.recorder.submit_start(RecordingRequest {
                producer_id: producer_id.clone(),
                client_id: client_id.clone(),
                streamer_name: name,
            });
        }

        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );
        Ok(ServerMessage::Produced(Produced {
            request_id,
            id: producer_id,
            kind,
        }))
    }

    async fn finish_stop_streaming(
        &mut self,
        client_id: &ClientId,
        op: Option<PendingOperation>,
        released: usize,
    ) {
        if !self.sessions.contains_key(client_id) {
            debug!(target: "hub.actor.hub", client_id = %client_id, "Streaming stopped after disconnect");
            return;
        }

        self.adapter.attach(Owner::Client(client_id.clone())).await;
        if let Some(session) = self.sessions.get_mut(client_id) {
            session.blocked = false;
        }
        // Sent even when the request already timed out, so the client
        // learns the release finished.
        let request_id = op.and_then(|op| {
            prom::record_message_latency(
                OperationKey::StopStreaming.request_type(),
                op.started_at.elapsed(),
            );
            op.request_id
        });
        self.send_to(
            client_id,
            ServerMessage::StreamingStopped(StreamingStopped { request_id }),
        );

        info!(target: "hub.actor.hub", client_id = %client_id, released, "Streaming stopped");
        self.replay_backlog(client_id);
    }

    /// Dispatch frames queued during a stop, until empty or blocked again.
    fn replay_backlog(&mut self, client_id: &ClientId) {
        loop {
            let frame = {
                let Some(session) = self.sessions.get_mut(client_id) else {
                    return;
                };
                if session.blocked {
                    return;
                }
                let Some(frame) = session.backlog.pop_front() else {
                    return;
                };
                frame
            };
            self.dispatch_frame(client_id, &frame);
        }
    }

    /// A completion whose request timed out or was discarded. Anything it
    /// created is closed again.
    fn release_late(&self, client_id: &ClientId, request_type: &str, outcome: CompletionOutcome) {
        let resource = match outcome {
            CompletionOutcome::TransportCreated(Ok(descriptor)) => {
                LateResource::Transport(descriptor.id)
            }
            CompletionOutcome::Produced {
                result: Ok(producer_id),
                ..
            } => LateResource::Producer(producer_id),
            CompletionOutcome::Consumed {
                result: Ok(descriptor),
                ..
            } => LateResource::Consumer(descriptor.id),
            _ => {
                debug!(target: "hub.actor.hub", client_id = %client_id, request_type, "Late completion ignored");
                return;
            }
        };
        info!(
            target: "hub.actor.hub",
            client_id = %client_id,
            request_type,
            "Releasing resource from late completion"
        );
        self.close_resource(client_id, resource);
    }

    fn close_resource(&self, client_id: &ClientId, resource: LateResource) {
        let adapter = self.adapter.clone();
        let owner = Owner::Client(client_id.clone());
        tokio::spawn(async move {
            let result = match resource {
                LateResource::Transport(id) => adapter.close_transport(&owner, &id).await,
                LateResource::Producer(id) => adapter.close_producer(&owner, &id).await,
                LateResource::Consumer(id) => adapter.close_consumer(&owner, &id).await,
            };
            if let Err(e) = result {
                debug!(target: "hub.actor.hub", owner = %owner, error = %e, "Resource already released");
            }
        });
    }

    fn expire_pending(&mut self) {
        for (client_id, key, op) in self.pending.expire(Instant::now()) {
            let request_type = key.request_type();
            prom::record_operation_timeout(request_type);
            warn!(
                target: "hub.actor.hub",
                client_id = %client_id,
                operation = request_type,
                correlation_id = %op.correlation_id,
                "Pending operation timed out"
            );
            self.reply_error(
                &client_id,
                &HubError::Timeout(format!("{request_type} timed out")),
                Some(request_type),
                op.request_id,
            );
        }
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    fn handle_resource_event(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::ProducerClosed {
                owner: Owner::Client(client_id),
                producer_id,
            } => {
                let removed = self.streamers.get_mut(&client_id).is_some_and(|record| {
                    let before = record.producers.len();
                    record.producers.retain(|(id, _)| id != &producer_id);
                    record.producers.len() != before
                });
                if removed {
                    self.broadcast(&broadcast::producer_closed(&client_id, &producer_id));
                }
                self.recorder.submit_stop(producer_id);
            }
            ResourceEvent::ConsumerClosed {
                owner: Owner::Client(client_id),
                consumer_id,
                producer_id,
            } => {
                self.send_to(
                    &client_id,
                    ServerMessage::ConsumerClosed(ConsumerClosed {
                        consumer_id,
                        producer_id,
                    }),
                );
            }
            ResourceEvent::ConsumerClosed {
                owner: Owner::Capture(producer_id),
                ..
            } => {
                self.recorder.submit_stop(producer_id);
            }
            ResourceEvent::ProducerClosed {
                owner: Owner::Capture(_),
                ..
            } => {}
            ResourceEvent::EngineFailed { reason } => {
                error!(
                    target: "hub.actor.hub",
                    reason = %reason,
                    "Media engine failed, shutting down"
                );
                self.fatal_token.cancel();
            }
        }
    }

    // ------------------------------------------------------------------
    // Registry views
    // ------------------------------------------------------------------

    fn ordered_streamers(&self) -> Vec<(&ClientId, &StreamerRecord)> {
        let mut streamers: Vec<_> = self.streamers.iter().collect();
        streamers.sort_by_key(|(_, record)| record.seq);
        streamers
    }

    fn streamer_summaries(&self) -> Vec<StreamerSummary> {
        self.ordered_streamers()
            .into_iter()
            .map(|(client_id, record)| StreamerSummary {
                client_id: client_id.clone(),
                name: record.name.clone(),
                producers: record
                    .producers
                    .iter()
                    .map(|(id, kind)| ProducerSummary {
                        id: id.clone(),
                        kind: *kind,
                    })
                    .collect(),
            })
            .collect()
    }

    fn producer_entries(&self, only: Option<&ClientId>) -> Vec<ProducerListEntry> {
        self.ordered_streamers()
            .into_iter()
            .filter(|(client_id, _)| only.is_none_or(|id| id == *client_id))
            .flat_map(|(client_id, record)| {
                record
                    .producers
                    .iter()
                    .map(move |(producer_id, kind)| ProducerListEntry {
                        client_id: client_id.clone(),
                        producer_id: producer_id.clone(),
                        kind: *kind,
                        name: record.name.clone(),
                    })
            })
            .collect()
    }

    fn streamer_of(&self, producer_id: &ProducerId) -> Option<ClientId> {
        self.streamers
            .iter()
            .find(|(_, record)| record.producers.iter().any(|(id, _)| id == producer_id))
            .map(|(client_id, _)| client_id.clone())
    }

    fn topology(&self) -> TopologySnapshot {
        TopologySnapshot {
            connections: self.sessions.len(),
            viewers: self.viewers.len(),
            streamers: self
                .ordered_streamers()
                .into_iter()
                .map(|(client_id, record)| StreamerInfo {
                    client_id: client_id.clone(),
                    name: record.name.clone(),
                    origin_address: self.sessions.get(client_id).and_then(|s| s.origin),
                    transport_count: record.transports.len(),
                    producer_count: record.producers.len(),
                })
                .collect(),
            unregistered: self.sessions.values().filter(|s| s.role.is_none()).count(),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_to(&self, client_id: &ClientId, message: ServerMessage) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|session| session.connection.try_send(message))
    }

    fn reply_error(
        &self,
        client_id: &ClientId,
        error: &HubError,
        request_type: Option<&str>,
        request_id: Option<String>,
    ) {
        debug!(
            target: "hub.actor.hub",
            client_id = %client_id,
            kind = error.kind().as_str(),
            request_type = request_type.unwrap_or("-"),
            error = %error,
            "Request failed"
        );
        self.send_to(
            client_id,
            ServerMessage::error(
                error.client_message(),
                error.error_code(),
                request_type,
                request_id,
            ),
        );
    }

    fn broadcast(&self, message: &ServerMessage) {
        broadcast::to_viewers(
            self.viewers
                .iter()
                .filter_map(|id| self.sessions.get(id))
                .map(|session| &session.connection),
            message,
        );
    }

    fn publish_counts(&self) {
        self.metrics.set_connections(self.sessions.len());
        self.metrics
            .set_roles(self.streamers.len(), self.viewers.len());
    }
}

/// A resource created by a request that is no longer wanted.
enum LateResource {
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

/// Display name used when `register` carries none.
fn default_name(role: Role, client_id: &ClientId) -> String {
    let short: String = client_id.as_str().chars().take(8).collect();
    match role {
        Role::Streamer => format!("Camera {short}"),
        Role::Viewer => format!("Viewer {short}"),
    }
}
