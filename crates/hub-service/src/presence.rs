//! Presence reporting.
//!
//! Pull query over the hub topology and the recording controller, served as
//! `GET /api/info` next to the signaling endpoint.

use crate::actors::{HubActorHandle, StreamerInfo};
use crate::errors::HubError;
use crate::recording::{RecordingControllerHandle, RecordingSummary};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

/// Recording side of a [`PresenceReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingPresence {
    /// `"enabled"` or `"disabled"`.
    pub status: &'static str,
    pub encoder: Option<String>,
    pub active_count: usize,
    pub sessions: Vec<RecordingSummary>,
}

/// Snapshot served by `/api/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceReport {
    pub hub_id: String,
    pub connections: usize,
    pub viewer_count: usize,
    pub streamers: Vec<StreamerInfo>,
    pub recording: RecordingPresence,
}

/// Builds presence reports from the two actors.
#[derive(Clone, Debug)]
pub struct PresenceReporter {
    hub_id: String,
    hub: HubActorHandle,
    recorder: RecordingControllerHandle,
}

impl PresenceReporter {
    #[must_use]
    pub fn new(hub_id: String, hub: HubActorHandle, recorder: RecordingControllerHandle) -> Self {
        Self {
            hub_id,
            hub,
            recorder,
        }
    }

    /// # Errors
    ///
    /// `Internal` if either actor has stopped.
    pub async fn report(&self) -> Result<PresenceReport, HubError> {
        let topology = self.hub.topology().await?;
        let status = self.recorder.status().await?;

        Ok(PresenceReport {
            hub_id: self.hub_id.clone(),
            connections: topology.connections,
            viewer_count: topology.viewers,
            streamers: topology.streamers,
            recording: RecordingPresence {
                status: if status.enabled { "enabled" } else { "disabled" },
                active_count: status.active_count(),
                encoder: status.encoder,
                sessions: status.sessions,
            },
        })
    }
}

/// Router serving `GET /api/info`.
pub fn presence_router(reporter: PresenceReporter) -> Router {
    Router::new()
        .route("/api/info", get(info_handler))
        .with_state(reporter)
}

async fn info_handler(
    State(reporter): State<PresenceReporter>,
) -> Result<Json<PresenceReport>, StatusCode> {
    reporter.report().await.map(Json).map_err(|e| {
        warn!(target: "hub.presence", error = %e, "Presence report unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })
}
