//! Camera Hub
//!
//! Signaling and recording orchestrator for camera streamers and viewers.
//!
//! # Servers
//!
//! - HTTP server for signaling (`/ws`) and presence (`/api/info`)
//!   (default: 0.0.0.0:3000)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Initialize logging from `RUST_LOG` / `HUB_LOG_JSON`
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Start the media engine and resource lifecycle adapter
//! 5. Spawn the recording controller (probes the encoder)
//! 6. Spawn the hub actor
//! 7. Start health and signaling servers
//! 8. Wait for a shutdown signal or a media engine failure
//!
//! # Shutdown Flow
//!
//! 1. Mark not ready
//! 2. Close every session (releases media resources, stops recordings)
//! 3. Wait for recording stop sequences, bounded by the encoder timeouts
//! 4. Cancel the root token (servers and remaining tasks)

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::config::{ObservabilityConfig, DEFAULT_LOG_FILTER};
use hub_service::actors::{ActorMetrics, ActorType, HubActor, HubDependencies, HubSettings};
use hub_service::config::Config;
use hub_service::media::{LoopbackEngine, MediaAdapter, MediaEngine};
use hub_service::observability::{health_router, init_metrics_recorder, HealthState, HubPhase};
use hub_service::presence::{presence_router, PresenceReporter};
use hub_service::recording::{EncoderLauncher, FfmpegLauncher, RecordingControllerActor};
use hub_service::transport::{signaling_router, SignalingState};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Extra time granted to recording stop sequences on shutdown.
const RECORDING_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for each background task after the root token fires.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let env_vars: HashMap<String, String> = std::env::vars().collect();
    let observability = ObservabilityConfig::from_vars(&env_vars);
    let filter = EnvFilter::try_new(&observability.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json_layer = observability
        .json_logs
        .then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!observability.json_logs).then(|| tracing_subscriber::fmt::layer());
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    info!("Starting Camera Hub");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        hub_id = %config.hub_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        max_connections = config.max_connections,
        request_timeout_ms = config.request_timeout.as_millis(),
        recording_enabled = config.recording.enabled,
        recording_dir = %config.recording.output_dir.display(),
        access_token = config.access_token.is_some(),
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let actor_metrics = ActorMetrics::new();

    // Root token: cancelled on shutdown, or by the hub when the engine fails
    let root_token = CancellationToken::new();

    // Media engine and resource lifecycle adapter
    let (engine, engine_events) = LoopbackEngine::new();
    let (adapter, resource_events, adapter_task) = MediaAdapter::spawn(
        Arc::new(engine) as Arc<dyn MediaEngine>,
        engine_events,
        root_token.child_token(),
    );
    info!("Media engine started");

    // Recording controller
    let launcher: Arc<dyn EncoderLauncher> =
        Arc::new(FfmpegLauncher::new(config.recording.encoder_path.clone()));
    let (recorder, recorder_task) = RecordingControllerActor::spawn(
        config.recording.clone(),
        launcher,
        adapter.clone(),
        root_token.child_token(),
        Arc::clone(&actor_metrics),
    );

    // Hub actor
    let (hub, hub_task) = HubActor::spawn(
        HubSettings::from_config(&config),
        HubDependencies {
            adapter,
            resource_events,
            recorder: recorder.clone(),
            metrics: Arc::clone(&actor_metrics),
        },
        root_token.child_token(),
        root_token.clone(),
    );
    info!("Actor system initialized");

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = root_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let reporter = PresenceReporter::new(config.hub_id.clone(), hub.clone(), recorder.clone());
    let signaling_app = signaling_router(SignalingState { hub: hub.clone() })
        .merge(presence_router(reporter))
        .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = root_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(
            signaling_listener,
            signaling_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signaling_shutdown_token.cancelled().await;
            info!("Signaling server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_phase(HubPhase::Serving);
    info!("Camera Hub running - press Ctrl+C to shutdown");

    let engine_failed = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = root_token.cancelled() => {
            error!("Media engine failed, shutting down");
            true
        }
    };

    // Stop advertising readiness before sessions are closed
    health_state.set_phase(if engine_failed {
        HubPhase::Failed
    } else {
        HubPhase::Draining
    });

    // Close sessions first so recordings get their stop requests
    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "Hub shutdown error");
    }

    let recording_deadline =
        config.recording.flush_delay + config.recording.kill_timeout + RECORDING_SHUTDOWN_GRACE;
    if let Err(e) = recorder.shutdown(recording_deadline).await {
        warn!(error = %e, "Recording controller shutdown error");
    }

    root_token.cancel();

    join_task("hub", hub_task, Some(ActorType::Hub), &actor_metrics).await;
    join_task("recorder", recorder_task, Some(ActorType::Recorder), &actor_metrics).await;
    join_task("media-adapter", adapter_task, None, &actor_metrics).await;

    if engine_failed {
        return Err("media engine failed".into());
    }

    info!("Camera Hub shutdown complete");
    Ok(())
}

/// Wait for a background task, counting actor panics.
async fn join_task(
    name: &str,
    task: JoinHandle<()>,
    actor_type: Option<ActorType>,
    metrics: &ActorMetrics,
) {
    match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            error!(task = name, "Task panicked");
            if let Some(actor_type) = actor_type {
                metrics.record_panic(actor_type);
            }
        }
        Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
        Err(_) => warn!(task = name, "Task did not stop in time"),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
