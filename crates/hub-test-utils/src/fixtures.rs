//! Hub fixtures.
//!
//! [`TestHub`] wires a [`MockEngine`], the media adapter, a recording
//! controller driven by a [`MockEncoderLauncher`] and the hub actor, the
//! same way the binary does. [`TestClient`] plays the role of a signaling
//! connection: it feeds JSON frames to the hub and reads back what the
//! connection actor would have written to the socket.

use crate::mock_encoder::MockEncoderLauncher;
use crate::mock_engine::MockEngine;

use common::secret::SecretString;
use common::types::ClientId;
use hub_service::actors::{
    ActorMetrics, ConnectionActorHandle, HubActor, HubActorHandle, HubDependencies, HubSettings,
};
use hub_service::config::RecordingConfig;
use hub_service::media::{MediaAdapter, MediaEngine};
use hub_service::recording::{
    EncoderLauncher, RecordingControllerActor, RecordingControllerHandle, RecordingStatus,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a client waits for an expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client listens before declaring it received nothing.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(200);

const OUTBOUND_BUFFER: usize = 256;

/// VP8 send parameters accepted by the loopback engine.
#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 96,
            "clockRate": 90000,
            "parameters": {},
        }],
        "encodings": [{ "ssrc": 11_111_111 }],
    })
}

/// Opus send parameters accepted by the loopback engine.
#[must_use]
pub fn opus_rtp_parameters() -> Value {
    json!({
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2,
        }],
        "encodings": [{ "ssrc": 22_222_222 }],
    })
}

/// Client DTLS parameters.
#[must_use]
pub fn client_dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }],
    })
}

/// Builder for [`TestHub`].
#[derive(Debug)]
pub struct TestHubBuilder {
    max_connections: usize,
    request_timeout: Duration,
    access_token: Option<String>,
    recording_enabled: bool,
    encoder: MockEncoderLauncher,
    start_delay: Duration,
    flush_delay: Duration,
    kill_timeout: Duration,
    port_range: (u16, u16),
}

impl Default for TestHubBuilder {
    fn default() -> Self {
        Self {
            max_connections: 100,
            request_timeout: Duration::from_secs(5),
            access_token: None,
            recording_enabled: true,
            encoder: MockEncoderLauncher::default(),
            start_delay: Duration::from_millis(100),
            flush_delay: Duration::from_millis(200),
            kill_timeout: Duration::from_secs(2),
            port_range: (21000, 21099),
        }
    }
}

impl TestHubBuilder {
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_string());
        self
    }

    /// Turn recording off in configuration.
    #[must_use]
    pub fn recording_disabled(mut self) -> Self {
        self.recording_enabled = false;
        self
    }

    #[must_use]
    pub fn encoder(mut self, encoder: MockEncoderLauncher) -> Self {
        self.encoder = encoder;
        self
    }

    #[must_use]
    pub fn kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    #[must_use]
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Inclusive capture port range.
    #[must_use]
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = (min, max);
        self
    }

    /// Spawn everything. Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> TestHub {
        let dir = tempfile::tempdir().unwrap();
        let root = CancellationToken::new();
        let metrics = ActorMetrics::new();

        let (engine, engine_events) = MockEngine::new();
        let (adapter, resource_events, adapter_task) = MediaAdapter::spawn(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            engine_events,
            root.child_token(),
        );

        let recording = RecordingConfig {
            enabled: self.recording_enabled,
            output_dir: dir.path().to_path_buf(),
            port_min: self.port_range.0,
            port_max: self.port_range.1,
            start_delay: self.start_delay,
            flush_delay: self.flush_delay,
            kill_timeout: self.kill_timeout,
            ..RecordingConfig::default()
        };
        let (recorder, recorder_task) = RecordingControllerActor::spawn(
            recording.clone(),
            Arc::new(self.encoder.clone()) as Arc<dyn EncoderLauncher>,
            adapter.clone(),
            root.child_token(),
            Arc::clone(&metrics),
        );

        let settings = HubSettings {
            hub_id: "hub-test".to_string(),
            max_connections: self.max_connections,
            request_timeout: self.request_timeout,
            access_token: self.access_token.map(SecretString::from),
        };
        let (hub, hub_task) = HubActor::spawn(
            settings,
            HubDependencies {
                adapter: adapter.clone(),
                resource_events,
                recorder: recorder.clone(),
                metrics: Arc::clone(&metrics),
            },
            root.child_token(),
            root.clone(),
        );

        TestHub {
            hub,
            recorder,
            adapter,
            engine,
            encoder: self.encoder,
            metrics,
            recording,
            root,
            tasks: vec![hub_task, recorder_task, adapter_task],
            dir,
        }
    }
}

/// A running hub with mock media and encoder.
pub struct TestHub {
    pub hub: HubActorHandle,
    pub recorder: RecordingControllerHandle,
    pub adapter: MediaAdapter,
    pub engine: Arc<MockEngine>,
    pub encoder: MockEncoderLauncher,
    pub metrics: Arc<ActorMetrics>,
    pub recording: RecordingConfig,
    /// Cancelled on teardown, or by the hub when the engine fails.
    pub root: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    dir: TempDir,
}

impl TestHub {
    #[must_use]
    pub fn builder() -> TestHubBuilder {
        TestHubBuilder::default()
    }

    /// Recording output directory.
    #[must_use]
    pub fn recording_dir(&self) -> &Path {
        self.dir.path()
    }

    /// Connect a client and consume its `welcome`.
    pub async fn connect(&self, id: &str) -> TestClient {
        let mut client = self.try_connect(id).await.expect("connect refused");
        let welcome = client.expect("welcome").await;
        assert_eq!(welcome["payload"]["clientId"], id);
        client.capabilities = welcome["payload"]["mediaCapabilities"].clone();
        client
    }

    /// Connect without consuming `welcome`.
    pub async fn try_connect(
        &self,
        id: &str,
    ) -> Result<TestClient, hub_service::errors::HubError> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let client_id = ClientId::from(id);
        let connection = self.hub.connect(client_id.clone(), None, tx).await?;
        Ok(TestClient {
            id: client_id,
            hub: self.hub.clone(),
            connection,
            rx,
            capabilities: Value::Null,
            next_request: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Current recording status.
    pub async fn recordings(&self) -> RecordingStatus {
        self.recorder.status().await.unwrap()
    }

    /// Poll recording status until `check` holds, failing after `timeout`.
    pub async fn wait_for_recordings<F>(&self, timeout: Duration, check: F) -> RecordingStatus
    where
        F: Fn(&RecordingStatus) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let status = self.recordings().await;
                if check(&status) {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("recording status never reached the expected state")
    }

    /// Let spawned tasks (cleanups, completions) run to quiescence.
    pub async fn settle(&self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Cancel everything and wait for the actors to exit.
    pub async fn teardown(self) {
        self.root.cancel();
        for task in self.tasks {
            let _ = tokio::time::timeout(FRAME_TIMEOUT, task).await;
        }
    }
}

/// A signaling client connected through channels instead of a socket.
pub struct TestClient {
    pub id: ClientId,
    hub: HubActorHandle,
    pub connection: ConnectionActorHandle,
    rx: mpsc::Receiver<String>,
    /// Capabilities from `welcome`, used as consume capabilities.
    pub capabilities: Value,
    next_request: Arc<AtomicU64>,
}

impl TestClient {
    /// Send a raw text frame.
    pub async fn send_raw(&self, frame: &str) {
        self.hub
            .inbound(self.id.clone(), frame.to_string())
            .await
            .unwrap();
    }

    /// Send `{type, payload}` as-is.
    pub async fn send(&self, message_type: &str, payload: Value) {
        let frame = json!({ "type": message_type, "payload": payload });
        self.send_raw(&frame.to_string()).await;
    }

    /// Send a request with a fresh `requestId`, which is returned.
    pub async fn request(&self, message_type: &str, mut payload: Value) -> String {
        let request_id = format!(
            "{}-{}",
            self.id,
            self.next_request.fetch_add(1, Ordering::SeqCst)
        );
        if let Some(object) = payload.as_object_mut() {
            object.insert("requestId".to_string(), Value::String(request_id.clone()));
        }
        self.send(message_type, payload).await;
        request_id
    }

    /// Next frame, failing after [`FRAME_TIMEOUT`].
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(FRAME_TIMEOUT, self.rx.recv())
            .await
            .unwrap_or_else(|_| panic!("{}: timed out waiting for a frame", self.id))
            .unwrap_or_else(|| panic!("{}: connection closed", self.id));
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame, which must have type `message_type`.
    pub async fn expect(&mut self, message_type: &str) -> Value {
        let frame = self.recv().await;
        assert_eq!(
            frame["type"], message_type,
            "{}: unexpected frame {frame}",
            self.id
        );
        frame
    }

    /// Skip frames until one of type `message_type` arrives.
    pub async fn recv_until(&mut self, message_type: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == message_type {
                return frame;
            }
        }
    }

    /// Reply matching `request_id`, skipping unrelated frames. Fails on an
    /// `error` for the same request.
    pub async fn reply(&mut self, message_type: &str, request_id: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["payload"]["requestId"] != request_id {
                continue;
            }
            assert_eq!(
                frame["type"], message_type,
                "{}: request {request_id} failed: {frame}",
                self.id
            );
            return frame;
        }
    }

    /// `error` reply matching `request_id`, skipping unrelated frames.
    pub async fn error_for(&mut self, request_id: &str) -> Value {
        self.reply("error", request_id).await
    }

    /// Assert nothing arrives within [`SILENCE_WINDOW`]. A closed connection
    /// counts as silent.
    pub async fn assert_silent(&mut self) {
        if let Ok(Some(text)) = tokio::time::timeout(SILENCE_WINDOW, self.rx.recv()).await {
            panic!("{}: expected silence, got {text}", self.id);
        }
    }

    /// Drain whatever has already arrived.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    /// Whether the hub closed this client's outbound channel.
    pub async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(FRAME_TIMEOUT, async {
                while self.rx.recv().await.is_some() {}
            })
            .await,
            Ok(())
        )
    }

    /// Register as a streamer and return the `registered` payload.
    pub async fn register_streamer(&mut self, name: &str) -> Value {
        let request_id = self
            .request("register", json!({ "role": "streamer", "name": name }))
            .await;
        self.reply("registered", &request_id).await["payload"].clone()
    }

    /// Register as a viewer and return the initial `streamer-list` payload.
    pub async fn register_viewer(&mut self) -> Value {
        let request_id = self.request("register", json!({ "role": "viewer" })).await;
        self.reply("registered", &request_id).await;
        self.expect("streamer-list").await["payload"].clone()
    }

    /// Create a transport (`"send"` or `"recv"`) and return its id.
    pub async fn create_transport(&mut self, direction: &str) -> String {
        let request_id = self
            .request("create-transport", json!({ "direction": direction }))
            .await;
        let reply = self.reply("transport-created", &request_id).await;
        reply["payload"]["id"].as_str().unwrap().to_string()
    }

    pub async fn connect_transport(&mut self, transport_id: &str) {
        let request_id = self
            .request(
                "connect-transport",
                json!({
                    "transportId": transport_id,
                    "dtlsParameters": client_dtls_parameters(),
                }),
            )
            .await;
        self.reply("transport-connected", &request_id).await;
    }

    /// Produce `"video"` (VP8) or `"audio"` (Opus) and return the producer id.
    pub async fn produce(&mut self, transport_id: &str, kind: &str) -> String {
        let rtp_parameters = if kind == "audio" {
            opus_rtp_parameters()
        } else {
            vp8_rtp_parameters()
        };
        let request_id = self
            .request(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                }),
            )
            .await;
        let reply = self.reply("produced", &request_id).await;
        reply["payload"]["id"].as_str().unwrap().to_string()
    }

    /// Consume a producer and return the `consumed` payload.
    pub async fn consume(&mut self, transport_id: &str, producer_id: &str) -> Value {
        let request_id = self
            .request(
                "consume",
                json!({
                    "transportId": transport_id,
                    "producerId": producer_id,
                    "rtpCapabilities": self.capabilities.clone(),
                }),
            )
            .await;
        self.reply("consumed", &request_id).await["payload"].clone()
    }

    /// Send transport, connected, with one producer of `kind`.
    pub async fn publish(&mut self, kind: &str) -> (String, String) {
        let transport_id = self.create_transport("send").await;
        self.connect_transport(&transport_id).await;
        let producer_id = self.produce(&transport_id, kind).await;
        (transport_id, producer_id)
    }

    /// Report the connection closed, as the socket layer would.
    pub async fn disconnect(self) {
        self.hub.disconnect(self.id.clone()).await.unwrap();
    }
}
