//! Observability for the hub: health probes and Prometheus metrics.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Access tokens and SDP bodies are never logged.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hub_connections_active` | Gauge | none |
//! | `hub_streamers_active` / `hub_viewers_active` | Gauge | none |
//! | `hub_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `hub_message_latency_seconds` | Histogram | `message_type` |
//! | `hub_messages_dropped_total` | Counter | `actor_type` |
//! | `hub_operation_timeouts_total` | Counter | `operation` |
//! | `hub_actor_panics_total` | Counter | `actor_type` |
//! | `hub_recordings_active` | Gauge | none |
//! | `hub_recording_stops_total` | Counter | `outcome` |
//! | `hub_recording_duration_seconds` | Histogram | none |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, HubPhase};
pub use metrics::init_metrics_recorder;
