//! Camera Hub Service Library
//!
//! Signaling and recording orchestrator for a camera hub. Streamers publish
//! camera tracks, viewers subscribe to them, and every video track is
//! recorded to disk by an external encoder.
//!
//! # Architecture
//!
//! ```text
//! WebSocket (/ws) ──> HubActor ──> MediaAdapter ──> MediaEngine
//!                        │  ▲            │
//!                        │  └ resource ──┘
//!                        │    events
//!                        └──> RecordingControllerActor ──> encoder processes
//! ```
//!
//! - The `HubActor` owns every registry (sessions, streamers, viewers,
//!   pending operations) and is the only place they change
//! - The `MediaAdapter` tags engine resources with their owner and turns
//!   engine-initiated closures into owner-resolved events
//! - The `RecordingControllerActor` runs one supervised encoder per video
//!   producer
//!
//! # Modules
//!
//! - [`actors`] - Hub and connection actors, pending operation table
//! - [`broadcast`] - Topology fan-out to viewers
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-facing codes
//! - [`media`] - Media engine seam and resource lifecycle adapter
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`presence`] - `/api/info` topology and recording report
//! - [`recording`] - Recording lifecycle controller
//! - [`signaling`] - Wire protocol
//! - [`transport`] - WebSocket endpoint

pub mod actors;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod presence;
pub mod recording;
pub mod signaling;
pub mod transport;
