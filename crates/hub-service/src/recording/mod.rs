//! Recording lifecycle.
//!
//! One recording session per video producer. A session captures the
//! producer through a dedicated plain RTP transport owned by
//! [`Owner::Capture`](crate::media::Owner::Capture), describes the stream to
//! an external encoder with an SDP file and supervises the encoder until it
//! exits.
//!
//! ```text
//! Idle -> Starting -> Active -> Stopping -> Stopped
//!            |                                 ^
//!            +------ failure / crash ----------+
//! ```
//!
//! The [`RecordingControllerActor`] owns the session table. Each session runs
//! in its own supervisor task, which reports state changes back to the
//! controller's mailbox.

mod controller;
pub mod encoder;
pub mod ports;
pub mod sdp;
mod supervisor;

pub use controller::{
    RecordingControllerActor, RecordingControllerHandle, RecordingRequest, RecordingStatus,
    RecordingSummary, StartOutcome,
};
pub use encoder::{
    EncoderExit, EncoderHandle, EncoderJob, EncoderLauncher, EncoderProcess, EncoderProgress,
    FfmpegLauncher,
};

use crate::errors::HubError;

use serde::Serialize;
use thiserror::Error;

/// Recording subsystem errors. Isolated to one session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordingError {
    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("encoder spawn failed: {0}")]
    Spawn(String),

    #[error("encoder process error: {0}")]
    Process(String),

    #[error("capture setup failed: {0}")]
    Capture(String),

    #[error("codec {0} cannot be recorded without transcoding")]
    UnsupportedCodec(String),

    #[error("no free capture ports")]
    PortsExhausted,

    #[error("file error: {0}")]
    Io(String),
}

impl From<RecordingError> for HubError {
    fn from(err: RecordingError) -> Self {
        HubError::Recording(err.to_string())
    }
}

/// Recording session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// Capture and encoder being set up, or waiting for the first frame.
    Starting,
    /// Encoder has reported frames.
    Active,
    /// Stop sequence running.
    Stopping,
    Stopped,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingOutcome {
    /// Encoder exited after the graceful stop signal.
    Completed,
    /// Encoder ignored the stop signal and was killed.
    Killed,
    /// Encoder exited on its own while recording.
    Crashed,
    /// Capture or encoder setup failed.
    Failed,
}

impl RecordingOutcome {
    /// Label for `hub_recording_stops_total`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordingOutcome::Completed => "completed",
            RecordingOutcome::Killed => "killed",
            RecordingOutcome::Crashed => "crashed",
            RecordingOutcome::Failed => "failed",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_error_maps_to_internal_client_error() {
        let err: HubError = RecordingError::PortsExhausted.into();
        assert_eq!(err.error_code(), 6);
        assert_eq!(err.client_message(), "An internal error occurred");
    }
}
