//! Probe endpoints.
//!
//! - `GET /health` - 200 unless the hub has failed
//! - `GET /ready` - 200 with `{"status":"serving"}` while the signaling
//!   listener accepts connections, 503 with the current phase otherwise
//!
//! `/metrics` is merged onto the same router in `main.rs`.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase of the hub process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubPhase {
    /// Servers are not bound yet.
    Starting,
    Serving,
    /// Shutdown in progress; sessions and recordings are being closed.
    Draining,
    /// The media engine died.
    Failed,
}

impl HubPhase {
    const fn to_u8(self) -> u8 {
        match self {
            HubPhase::Starting => 0,
            HubPhase::Serving => 1,
            HubPhase::Draining => 2,
            HubPhase::Failed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => HubPhase::Starting,
            1 => HubPhase::Serving,
            2 => HubPhase::Draining,
            _ => HubPhase::Failed,
        }
    }
}

/// Shared phase read by the probe handlers.
#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Starts in [`HubPhase::Starting`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(HubPhase::Starting.to_u8()),
        }
    }

    pub fn set_phase(&self, phase: HubPhase) {
        self.phase.store(phase.to_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> HubPhase {
        HubPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.phase() != HubPhase::Failed
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == HubPhase::Serving
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    status: HubPhase,
}

/// Router with `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let phase = state.phase();
    let code = if phase == HubPhase::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadinessBody { status: phase }))
}
