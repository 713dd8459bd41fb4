//! Per-session recording supervisor.
//!
//! Runs one session from capture setup to encoder exit and reports each
//! transition to the controller. All delays are tokio timers.

use super::encoder::{EncoderExit, EncoderHandle, EncoderJob, EncoderLauncher, EncoderProcess};
use super::ports::PortPair;
use super::sdp::{self, CaptureCodec};
use super::{RecordingError, RecordingOutcome};
use crate::config::RecordingConfig;
use crate::media::{MediaAdapter, Owner};

use common::types::{ConsumerId, ProducerId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A transition reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SupervisorReport {
    pub producer_id: ProducerId,
    pub session_id: Uuid,
    pub update: SessionUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum SessionUpdate {
    /// Encoder running, writing to `output_path`.
    Spawned { output_path: PathBuf },
    /// First frame progress seen.
    Active,
    Stopped {
        outcome: RecordingOutcome,
        frames: u64,
    },
}

/// Everything a supervisor needs, moved into its task.
pub(super) struct Supervisor {
    pub producer_id: ProducerId,
    pub session_id: Uuid,
    /// File name stem shared by the SDP and the output.
    pub stem: String,
    pub ports: PortPair,
    pub config: RecordingConfig,
    pub adapter: MediaAdapter,
    pub launcher: Arc<dyn EncoderLauncher>,
    pub stop: CancellationToken,
    pub reports: mpsc::UnboundedSender<SupervisorReport>,
}

struct Prepared {
    handle: EncoderHandle,
    consumer_id: ConsumerId,
}

enum RunEnd {
    StopRequested,
    Exited(Result<EncoderExit, RecordingError>),
}

impl Supervisor {
    #[instrument(
        skip_all,
        name = "hub.recording.session",
        fields(producer_id = %self.producer_id, session_id = %self.session_id)
    )]
    pub(super) async fn run(self) {
        let owner = Owner::Capture(self.producer_id.clone());
        let mut sdp_path = None;

        let prepared = match self.prepare(&owner, &mut sdp_path).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(
                    target: "hub.recording",
                    producer_id = %self.producer_id,
                    error = %e,
                    "Recording setup failed"
                );
                self.release_capture(&owner, sdp_path.as_ref()).await;
                self.report(SessionUpdate::Stopped {
                    outcome: RecordingOutcome::Failed,
                    frames: 0,
                });
                return;
            }
        };

        let Prepared {
            handle,
            consumer_id,
        } = prepared;
        let EncoderHandle {
            mut process,
            mut diagnostics,
        } = handle;

        let mut frames = 0u64;
        let mut active = false;
        let mut resumed = false;
        let grace = tokio::time::sleep(self.config.start_delay);
        tokio::pin!(grace);

        let end = loop {
            tokio::select! {
                biased;

                () = self.stop.cancelled() => break RunEnd::StopRequested,

                exit = process.wait() => break RunEnd::Exited(exit),

                () = &mut grace, if !resumed => {
                    resumed = true;
                    match self.adapter.resume_consumer(&owner, &consumer_id).await {
                        Ok(()) => debug!(
                            target: "hub.recording",
                            producer_id = %self.producer_id,
                            "Capture consumer resumed"
                        ),
                        Err(e) => warn!(
                            target: "hub.recording",
                            producer_id = %self.producer_id,
                            error = %e,
                            "Failed to resume capture consumer"
                        ),
                    }
                }

                Some(progress) = diagnostics.recv() => {
                    frames = progress.frames;
                    if !active {
                        active = true;
                        info!(
                            target: "hub.recording",
                            producer_id = %self.producer_id,
                            "Recording active"
                        );
                        self.report(SessionUpdate::Active);
                    }
                }
            }
        };

        let outcome = match end {
            RunEnd::StopRequested => {
                self.stop_sequence(&owner, &consumer_id, process.as_mut(), sdp_path.as_ref())
                    .await
            }
            RunEnd::Exited(exit) => {
                warn!(
                    target: "hub.recording",
                    producer_id = %self.producer_id,
                    exit = ?exit,
                    frames,
                    "Encoder exited unexpectedly"
                );
                self.release_capture(&owner, sdp_path.as_ref()).await;
                RecordingOutcome::Crashed
            }
        };

        while let Ok(progress) = diagnostics.try_recv() {
            frames = progress.frames;
        }

        self.report(SessionUpdate::Stopped { outcome, frames });
    }

    /// Capture transport, paused consumer, SDP file, encoder.
    async fn prepare(
        &self,
        owner: &Owner,
        sdp_path: &mut Option<PathBuf>,
    ) -> Result<Prepared, RecordingError> {
        let capture_ip = self.config.capture_ip;
        self.adapter.attach(owner.clone()).await;

        let transport_id = self
            .adapter
            .create_plain_transport(owner, capture_ip)
            .await
            .map_err(|e| RecordingError::Capture(e.to_string()))?;

        let consumer = self
            .adapter
            .consume(
                owner,
                &transport_id,
                &self.producer_id,
                &self.adapter.capabilities(),
                true,
            )
            .await
            .map_err(|e| RecordingError::Capture(e.to_string()))?;

        let codec = CaptureCodec::from_rtp_parameters(&consumer.rtp_parameters)?;
        let container = codec.container()?;

        self.adapter
            .connect_plain_transport(
                owner,
                &transport_id,
                SocketAddr::new(capture_ip, self.ports.rtp),
                self.ports.rtcp,
            )
            .await
            .map_err(|e| RecordingError::Capture(e.to_string()))?;

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| RecordingError::Io(format!("{}: {e}", self.config.output_dir.display())))?;

        let path = self.config.output_dir.join(format!("{}.sdp", self.stem));
        tokio::fs::write(&path, sdp::render(&codec, capture_ip, self.ports))
            .await
            .map_err(|e| RecordingError::Io(format!("{}: {e}", path.display())))?;
        *sdp_path = Some(path.clone());

        let output_path = self
            .config
            .output_dir
            .join(format!("{}.{}", self.stem, container.extension()));
        let job = EncoderJob {
            sdp_path: path,
            output_path: output_path.clone(),
        };
        let handle = self.launcher.launch(&job).await?;

        info!(
            target: "hub.recording",
            producer_id = %self.producer_id,
            codec = %codec.name,
            rtp_port = self.ports.rtp,
            pid = ?handle.process.pid(),
            output = %output_path.display(),
            "Encoder started"
        );
        self.report(SessionUpdate::Spawned { output_path });

        Ok(Prepared {
            handle,
            consumer_id: consumer.id,
        })
    }

    /// Consumer close, flush delay, graceful stop, capture close, SDP
    /// removal, bounded wait, kill.
    async fn stop_sequence(
        &self,
        owner: &Owner,
        consumer_id: &ConsumerId,
        process: &mut dyn EncoderProcess,
        sdp_path: Option<&PathBuf>,
    ) -> RecordingOutcome {
        debug!(target: "hub.recording", producer_id = %self.producer_id, "Stopping recording");

        if let Err(e) = self.adapter.close_consumer(owner, consumer_id).await {
            debug!(target: "hub.recording", error = %e, "Capture consumer already closed");
        }

        tokio::time::sleep(self.config.flush_delay).await;

        if let Err(e) = process.signal_stop() {
            warn!(target: "hub.recording", error = %e, "Graceful stop signal failed");
        }

        self.release_capture(owner, sdp_path).await;

        match tokio::time::timeout(self.config.kill_timeout, process.wait()).await {
            Ok(exit) => {
                debug!(target: "hub.recording", exit = ?exit, "Encoder exited after stop signal");
                RecordingOutcome::Completed
            }
            Err(_) => {
                warn!(
                    target: "hub.recording",
                    producer_id = %self.producer_id,
                    timeout_ms = u64::try_from(self.config.kill_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Encoder did not exit after stop signal, killing"
                );
                if let Err(e) = process.kill().await {
                    warn!(target: "hub.recording", error = %e, "Encoder kill failed");
                }
                RecordingOutcome::Killed
            }
        }
    }

    async fn release_capture(&self, owner: &Owner, sdp_path: Option<&PathBuf>) {
        self.adapter.cleanup(owner).await;
        if let Some(path) = sdp_path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                debug!(target: "hub.recording", path = %path.display(), error = %e, "Capture description not removed");
            }
        }
    }

    fn report(&self, update: SessionUpdate) {
        let _ = self.reports.send(SupervisorReport {
            producer_id: self.producer_id.clone(),
            session_id: self.session_id,
            update,
        });
    }
}
