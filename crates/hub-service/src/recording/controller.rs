//! `RecordingControllerActor` - owns every recording session.
//!
//! The hub submits start and stop requests without waiting; tests and the
//! presence reporter use the request-reply methods. Supervisor reports come
//! back through an internal channel polled by the same loop, so the session
//! table only ever changes inside this actor.

use super::encoder::EncoderLauncher;
use super::ports::{PortAllocator, PortPair};
use super::supervisor::{SessionUpdate, Supervisor, SupervisorReport};
use super::{RecordingOutcome, RecordingState};
use crate::actors::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::RecordingConfig;
use crate::errors::HubError;
use crate::media::MediaAdapter;
use crate::observability::metrics as prom;

use chrono::{DateTime, Utc};
use common::types::{ClientId, ProducerId};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const RECORDER_CHANNEL_BUFFER: usize = 500;

/// Longest display-name segment used in output file names.
const MAX_NAME_LEN: usize = 48;

/// What to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingRequest {
    pub producer_id: ProducerId,
    /// Streamer owning the producer.
    pub client_id: ClientId,
    pub streamer_name: String,
}

/// Public view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub session_id: Uuid,
    pub producer_id: ProducerId,
    pub client_id: ClientId,
    pub streamer_name: String,
    pub state: RecordingState,
    /// Known once the encoder is spawned.
    pub output_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(RecordingSummary),
    /// A live session already exists for the producer; nothing was spawned.
    Existing(RecordingSummary),
    /// Recording is disabled (configuration or missing encoder).
    Disabled,
    Failed(String),
}

/// Controller status for presence reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub enabled: bool,
    /// Encoder version line, when the probe succeeded.
    pub encoder: Option<String>,
    pub sessions: Vec<RecordingSummary>,
}

impl RecordingStatus {
    /// Sessions not yet stopped.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state != RecordingState::Stopped)
            .count()
    }
}

#[derive(Debug)]
enum RecorderMessage {
    Start {
        request: RecordingRequest,
        respond_to: Option<oneshot::Sender<StartOutcome>>,
    },
    Stop {
        producer_id: ProducerId,
        respond_to: Option<oneshot::Sender<bool>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<RecordingStatus>,
    },
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the `RecordingControllerActor`.
#[derive(Clone, Debug)]
pub struct RecordingControllerHandle {
    sender: mpsc::Sender<RecorderMessage>,
    cancel_token: CancellationToken,
}

impl RecordingControllerHandle {
    /// Start recording a producer and wait for the outcome.
    pub async fn start(&self, request: RecordingRequest) -> Result<StartOutcome, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecorderMessage::Start {
                request,
                respond_to: Some(tx),
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Request a recording without waiting. Requests keep submission order.
    pub fn submit_start(&self, request: RecordingRequest) {
        self.submit(RecorderMessage::Start {
            request,
            respond_to: None,
        });
    }

    /// Stop a producer's recording and wait. Returns whether a live session
    /// was found.
    pub async fn stop(&self, producer_id: ProducerId) -> Result<bool, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecorderMessage::Stop {
                producer_id,
                respond_to: Some(tx),
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Request a stop without waiting.
    pub fn submit_stop(&self, producer_id: ProducerId) {
        self.submit(RecorderMessage::Stop {
            producer_id,
            respond_to: None,
        });
    }

    pub async fn status(&self) -> Result<RecordingStatus, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecorderMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop every session and wait for their stop sequences, at most `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RecorderMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    fn submit(&self, message: RecorderMessage) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(target: "hub.recording", "Recorder mailbox full, queueing request");
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(message).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(target: "hub.recording", "Recorder stopped, request ignored");
            }
        }
    }
}

struct SessionEntry {
    summary: RecordingSummary,
    ports: PortPair,
    started: Instant,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// The `RecordingControllerActor` implementation.
pub struct RecordingControllerActor {
    config: RecordingConfig,
    launcher: Arc<dyn EncoderLauncher>,
    adapter: MediaAdapter,
    receiver: mpsc::Receiver<RecorderMessage>,
    reports_tx: mpsc::UnboundedSender<SupervisorReport>,
    reports_rx: mpsc::UnboundedReceiver<SupervisorReport>,
    cancel_token: CancellationToken,
    sessions: HashMap<ProducerId, SessionEntry>,
    ports: PortAllocator,
    enabled: bool,
    encoder_version: Option<String>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RecordingControllerActor {
    /// Spawn the controller.
    ///
    /// The encoder is probed before the first request is handled; when the
    /// probe fails every start reports [`StartOutcome::Disabled`].
    pub fn spawn(
        config: RecordingConfig,
        launcher: Arc<dyn EncoderLauncher>,
        adapter: MediaAdapter,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RecordingControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(RECORDER_CHANNEL_BUFFER);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let actor = Self {
            ports: PortAllocator::new(config.port_min, config.port_max),
            config,
            launcher,
            adapter,
            receiver,
            reports_tx,
            reports_rx,
            cancel_token: cancel_token.clone(),
            sessions: HashMap::new(),
            enabled: false,
            encoder_version: None,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Recorder, "recorder"),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RecordingControllerHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "hub.actor.recorder")]
    async fn run(mut self) {
        self.probe_encoder().await;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "hub.recording", "Recording controller cancelled");
                    let deadline = self.config.flush_delay + self.config.kill_timeout;
                    self.stop_all_and_wait(deadline).await;
                    break;
                }

                Some(report) = self.reports_rx.recv() => {
                    self.handle_report(report);
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "hub.recording", "Recorder channel closed, exiting");
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

        info!(
            target: "hub.recording",
            remaining = self.sessions.len(),
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "Recording controller stopped"
        );
    }

    async fn probe_encoder(&mut self) {
        if !self.config.enabled {
            info!(target: "hub.recording", "Recording disabled by configuration");
            return;
        }
        match self.launcher.probe().await {
            Ok(version) => {
                info!(target: "hub.recording", encoder = %version, "Encoder available, recording enabled");
                self.enabled = true;
                self.encoder_version = Some(version);
            }
            Err(e) => {
                warn!(target: "hub.recording", error = %e, "Encoder unavailable, recording disabled");
            }
        }
    }

    /// Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RecorderMessage) -> bool {
        match message {
            RecorderMessage::Start {
                request,
                respond_to,
            } => {
                let outcome = self.handle_start(request);
                if let Some(tx) = respond_to {
                    let _ = tx.send(outcome);
                }
                false
            }
            RecorderMessage::Stop {
                producer_id,
                respond_to,
            } => {
                let found = self.handle_stop(&producer_id);
                if let Some(tx) = respond_to {
                    let _ = tx.send(found);
                }
                false
            }
            RecorderMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
                false
            }
            RecorderMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.stop_all_and_wait(deadline).await;
                let _ = respond_to.send(());
                true
            }
        }
    }

    fn handle_start(&mut self, request: RecordingRequest) -> StartOutcome {
        if !self.enabled {
            debug!(target: "hub.recording", producer_id = %request.producer_id, "Recording disabled, start ignored");
            return StartOutcome::Disabled;
        }

        if let Some(existing) = self.sessions.get(&request.producer_id) {
            debug!(
                target: "hub.recording",
                producer_id = %request.producer_id,
                state = ?existing.summary.state,
                "Recording already exists for producer"
            );
            return StartOutcome::Existing(existing.summary.clone());
        }

        let Some(ports) = self.ports.allocate() else {
            warn!(
                target: "hub.recording",
                producer_id = %request.producer_id,
                in_use = self.ports.in_use(),
                "No free capture ports"
            );
            prom::record_recording_stop(RecordingOutcome::Failed.as_str(), Duration::ZERO);
            return StartOutcome::Failed(super::RecordingError::PortsExhausted.to_string());
        };

        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stem = output_stem(&request.streamer_name, started_at, &request.producer_id);
        let stop = self.cancel_token.child_token();

        let supervisor = Supervisor {
            producer_id: request.producer_id.clone(),
            session_id,
            stem,
            ports,
            config: self.config.clone(),
            adapter: self.adapter.clone(),
            launcher: Arc::clone(&self.launcher),
            stop: stop.clone(),
            reports: self.reports_tx.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        let summary = RecordingSummary {
            session_id,
            producer_id: request.producer_id.clone(),
            client_id: request.client_id,
            streamer_name: request.streamer_name,
            state: RecordingState::Starting,
            output_path: None,
            started_at,
        };

        info!(
            target: "hub.recording",
            producer_id = %summary.producer_id,
            session_id = %session_id,
            rtp_port = ports.rtp,
            "Recording starting"
        );

        self.sessions.insert(
            request.producer_id,
            SessionEntry {
                summary: summary.clone(),
                ports,
                started: Instant::now(),
                stop,
                task,
            },
        );
        prom::set_recordings_active(self.sessions.len());

        StartOutcome::Started(summary)
    }

    fn handle_stop(&mut self, producer_id: &ProducerId) -> bool {
        let Some(entry) = self.sessions.get_mut(producer_id) else {
            return false;
        };
        if entry.summary.state != RecordingState::Stopping {
            entry.summary.state = RecordingState::Stopping;
            entry.stop.cancel();
            debug!(target: "hub.recording", producer_id = %producer_id, "Recording stop requested");
        }
        true
    }

    fn handle_report(&mut self, report: SupervisorReport) {
        let Some(entry) = self.sessions.get_mut(&report.producer_id) else {
            return;
        };
        if entry.summary.session_id != report.session_id {
            return;
        }

        match report.update {
            SessionUpdate::Spawned { output_path } => {
                entry.summary.output_path = Some(output_path);
            }
            SessionUpdate::Active => {
                if entry.summary.state == RecordingState::Starting {
                    entry.summary.state = RecordingState::Active;
                }
            }
            SessionUpdate::Stopped { outcome, frames } => {
                if let Some(entry) = self.sessions.remove(&report.producer_id) {
                    self.finish(entry, outcome, frames);
                }
            }
        }
    }

    fn finish(&mut self, entry: SessionEntry, outcome: RecordingOutcome, frames: u64) {
        self.ports.release(entry.ports);
        let duration = entry.started.elapsed();
        prom::record_recording_stop(outcome.as_str(), duration);
        prom::set_recordings_active(self.sessions.len());

        let output = entry
            .summary
            .output_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        if frames == 0 && outcome != RecordingOutcome::Failed {
            warn!(
                target: "hub.recording",
                producer_id = %entry.summary.producer_id,
                outcome = outcome.as_str(),
                output = %output,
                "Recording stopped with no frames"
            );
        } else {
            info!(
                target: "hub.recording",
                producer_id = %entry.summary.producer_id,
                outcome = outcome.as_str(),
                frames,
                duration_secs = duration.as_secs(),
                output = %output,
                "Recording stopped"
            );
        }
    }

    fn status(&self) -> RecordingStatus {
        let mut sessions: Vec<RecordingSummary> = self
            .sessions
            .values()
            .map(|entry| entry.summary.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        RecordingStatus {
            enabled: self.enabled,
            encoder: self.encoder_version.clone(),
            sessions,
        }
    }

    /// Stop every session, then wait for their reports until `deadline`.
    /// Supervisors still running after that are aborted, which drops (and
    /// kills) their encoder.
    async fn stop_all_and_wait(&mut self, deadline: Duration) {
        let producers: Vec<ProducerId> = self.sessions.keys().cloned().collect();
        for producer_id in &producers {
            self.handle_stop(producer_id);
        }
        if self.sessions.is_empty() {
            return;
        }

        info!(
            target: "hub.recording",
            sessions = self.sessions.len(),
            deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
            "Waiting for recordings to stop"
        );

        let drained = tokio::time::timeout(deadline, async {
            while !self.sessions.is_empty() {
                match self.reports_rx.recv().await {
                    Some(report) => self.handle_report(report),
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            for (producer_id, entry) in self.sessions.drain() {
                error!(
                    target: "hub.recording",
                    producer_id = %producer_id,
                    "Recording did not stop in time, aborting"
                );
                entry.task.abort();
                self.ports.release(entry.ports);
                prom::record_recording_stop(RecordingOutcome::Killed.as_str(), entry.started.elapsed());
            }
            prom::set_recordings_active(0);
        }
    }
}

/// `<name>_<UTC timestamp>_<producer id prefix>`, safe for any filesystem.
fn output_stem(name: &str, started_at: DateTime<Utc>, producer_id: &ProducerId) -> String {
    let mut safe: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    if safe.chars().all(|c| c == '_') {
        safe = "stream".to_string();
    }
    let prefix: String = producer_id
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    format!("{safe}_{}_{prefix}", started_at.format("%Y%m%dT%H%M%SZ"))
}
