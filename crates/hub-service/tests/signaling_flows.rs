//! End-to-end signaling scenarios through the hub actor.
//!
//! Clients talk to the hub over channels (see `hub_test_utils::TestClient`),
//! backed by the loopback engine and a scripted encoder.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::time::Duration;

use common::types::{ClientId, ConsumerId, ProducerId};
use hub_service::media::Owner;
use hub_service::recording::{RecordingRequest, StartOutcome};
use hub_test_utils::{MockEncoderLauncher, TestHub};
use serde_json::json;

const RECORDING_WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Topology broadcasts
// ============================================================================

#[tokio::test]
async fn test_viewer_receives_exactly_one_new_producer() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Front Door").await;

    let joined = viewer.expect("streamer-joined").await;
    assert_eq!(joined["payload"]["clientId"], "camera-1");
    assert_eq!(joined["payload"]["name"], "Front Door");

    let (_transport, producer_id) = camera.publish("video").await;

    let announced = viewer.expect("new-producer").await;
    assert_eq!(announced["payload"]["kind"], "video");
    assert_eq!(announced["payload"]["clientId"], "camera-1");
    assert_eq!(announced["payload"]["producerId"], producer_id.as_str());
    assert_eq!(announced["payload"]["name"], "Front Door");
    viewer.assert_silent().await;

    hub.teardown().await;
}

#[tokio::test]
async fn test_streamer_list_keeps_registration_order() {
    let hub = TestHub::builder().build();

    let mut zeta = hub.connect("camera-z").await;
    zeta.register_streamer("Zeta").await;
    let mut alpha = hub.connect("camera-a").await;
    alpha.register_streamer("Alpha").await;

    let (zeta_transport, zeta_video) = zeta.publish("video").await;
    let zeta_audio = zeta.produce(&zeta_transport, "audio").await;
    let (_alpha_transport, alpha_video) = alpha.publish("video").await;

    let mut viewer = hub.connect("viewer-1").await;
    let snapshot = viewer.register_viewer().await;
    let streamers = snapshot["streamers"].as_array().unwrap();

    assert_eq!(streamers.len(), 2);
    assert_eq!(streamers[0]["clientId"], "camera-z");
    assert_eq!(streamers[0]["name"], "Zeta");
    let zeta_producers: Vec<_> = streamers[0]["producers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(zeta_producers, vec![zeta_video, zeta_audio]);

    assert_eq!(streamers[1]["clientId"], "camera-a");
    assert_eq!(streamers[1]["producers"][0]["id"], alpha_video.as_str());
    assert_eq!(streamers[1]["producers"][0]["kind"], "video");

    hub.teardown().await;
}

#[tokio::test]
async fn test_get_producers_filters_by_client() {
    let hub = TestHub::builder().build();
    let mut first = hub.connect("camera-1").await;
    first.register_streamer("One").await;
    let (_t1, first_video) = first.publish("video").await;
    let mut second = hub.connect("camera-2").await;
    second.register_streamer("Two").await;
    second.publish("audio").await;

    // Allowed before registering.
    let mut observer = hub.connect("observer").await;
    let all = observer.request("get-producers", json!({})).await;
    let reply = observer.reply("producer-list", &all).await;
    assert_eq!(reply["payload"]["producers"].as_array().unwrap().len(), 2);

    let only = observer
        .request("get-producers", json!({ "clientId": "camera-1" }))
        .await;
    let reply = observer.reply("producer-list", &only).await;
    let producers = reply["payload"]["producers"].as_array().unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0]["producerId"], first_video.as_str());
    assert_eq!(producers[0]["name"], "One");

    hub.teardown().await;
}

// ============================================================================
// Stop streaming
// ============================================================================

#[tokio::test]
async fn test_stop_streaming_then_register_again() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Front Door").await;
    camera.publish("video").await;
    viewer.expect("streamer-joined").await;
    viewer.expect("new-producer").await;

    let stop = camera.request("stop-streaming", json!({})).await;
    camera.reply("streaming-stopped", &stop).await;

    let left = viewer.expect("streamer-left").await;
    assert_eq!(left["payload"]["clientId"], "camera-1");
    viewer.assert_silent().await;

    let topology = hub.hub.topology().await.unwrap();
    assert!(topology.streamers.is_empty());
    assert_eq!(topology.unregistered, 1);
    assert_eq!(hub.engine.counts().await.producers, 0);

    let registered = camera.register_streamer("Front Door").await;
    assert_eq!(registered["role"], "streamer");
    viewer.expect("streamer-joined").await;

    hub.teardown().await;
}

#[tokio::test]
async fn test_frames_sent_during_stop_are_replayed_in_order() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    camera.publish("video").await;

    let stop = camera.request("stop-streaming", json!({})).await;
    let again = camera
        .request("register", json!({ "role": "streamer", "name": "Porch" }))
        .await;

    let stopped = camera.recv().await;
    assert_eq!(stopped["type"], "streaming-stopped");
    assert_eq!(stopped["payload"]["requestId"], stop.as_str());

    let registered = camera.recv().await;
    assert_eq!(registered["type"], "registered");
    assert_eq!(registered["payload"]["requestId"], again.as_str());

    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.streamers.len(), 1);
    assert_eq!(topology.streamers[0].producer_count, 0);

    hub.teardown().await;
}

#[tokio::test]
async fn test_stop_streaming_from_viewer_is_rejected() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    let stop = viewer.request("stop-streaming", json!({})).await;
    let error = viewer.error_for(&stop).await;
    assert_eq!(error["payload"]["code"], 3);
    assert_eq!(error["payload"]["requestType"], "stop-streaming");

    hub.teardown().await;
}

// ============================================================================
// Edge policies
// ============================================================================

#[tokio::test]
async fn test_pan_zoom_forwarded_to_live_streamer() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    viewer
        .send(
            "pan-zoom",
            json!({ "targetId": "camera-1", "zoom": 2.5, "panX": 0.25, "panY": -0.5 }),
        )
        .await;

    let command = camera.expect("pan-zoom-command").await;
    assert_eq!(command["payload"]["fromId"], "viewer-1");
    assert_eq!(command["payload"]["zoom"], 2.5);
    assert_eq!(command["payload"]["panX"], 0.25);
    assert_eq!(command["payload"]["panY"], -0.5);
    viewer.assert_silent().await;

    hub.teardown().await;
}

#[tokio::test]
async fn test_pan_zoom_to_disconnected_target_is_silent() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    viewer.expect("streamer-joined").await;

    camera.disconnect().await;
    viewer.expect("streamer-left").await;

    viewer
        .send("pan-zoom", json!({ "targetId": "camera-1", "zoom": 1.0 }))
        .await;
    viewer
        .send("pan-zoom", json!({ "targetId": "never-existed", "zoom": 1.0 }))
        .await;
    viewer.assert_silent().await;

    hub.teardown().await;
}

#[tokio::test]
async fn test_consume_unknown_producer_errors_only_to_requester() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let mut bystander = hub.connect("viewer-2").await;
    bystander.register_viewer().await;
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    let recv = viewer.create_transport("recv").await;
    let consume = viewer
        .request(
            "consume",
            json!({
                "transportId": recv,
                "producerId": "no-such-producer",
                "rtpCapabilities": viewer.capabilities.clone(),
            }),
        )
        .await;

    let error = viewer.error_for(&consume).await;
    assert_eq!(error["payload"]["code"], 4);
    assert_eq!(error["payload"]["requestType"], "consume");

    camera.assert_silent().await;
    bystander.assert_silent().await;
    hub.teardown().await;
}

#[tokio::test]
async fn test_duplicate_register_leaves_state_unchanged() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;

    let again = camera
        .request("register", json!({ "role": "viewer" }))
        .await;
    let error = camera.error_for(&again).await;
    assert_eq!(error["payload"]["code"], 5);

    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.streamers.len(), 1);
    assert_eq!(topology.viewers, 0);

    hub.teardown().await;
}

#[tokio::test]
async fn test_viewer_cannot_produce() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let send = viewer.create_transport("send").await;

    let produce = viewer
        .request(
            "produce",
            json!({
                "transportId": send,
                "kind": "video",
                "rtpParameters": hub_test_utils::vp8_rtp_parameters(),
            }),
        )
        .await;
    let error = viewer.error_for(&produce).await;
    assert_eq!(error["payload"]["code"], 3);
    assert_eq!(hub.engine.produce_calls(), 0);

    hub.teardown().await;
}

#[tokio::test]
async fn test_transport_of_another_client_is_not_found() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let send = camera.create_transport("send").await;

    let mut intruder = hub.connect("camera-2").await;
    intruder.register_streamer("Intruder").await;
    let connect = intruder
        .request(
            "connect-transport",
            json!({
                "transportId": send,
                "dtlsParameters": hub_test_utils::client_dtls_parameters(),
            }),
        )
        .await;
    let error = intruder.error_for(&connect).await;
    assert_eq!(error["payload"]["code"], 4);

    hub.teardown().await;
}

// ============================================================================
// In-flight operations
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_same_operation_twice_is_rejected_while_pending() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;

    hub.engine.set_transport_delay(Duration::from_secs(1));
    let first = camera
        .request("create-transport", json!({ "direction": "send" }))
        .await;
    let second = camera
        .request("create-transport", json!({ "direction": "send" }))
        .await;
    // A different direction is a different operation.
    let recv = camera
        .request("create-transport", json!({ "direction": "recv" }))
        .await;

    let error = camera.error_for(&second).await;
    assert_eq!(error["payload"]["code"], 5);
    assert_eq!(error["payload"]["requestType"], "create-transport");

    // Both completions land after the same delay, in either order.
    let mut answered = Vec::new();
    for _ in 0..2 {
        let frame = camera.expect("transport-created").await;
        answered.push(frame["payload"]["requestId"].as_str().unwrap().to_string());
    }
    answered.sort();
    let mut expected = vec![first, recv];
    expected.sort();
    assert_eq!(answered, expected);
    assert_eq!(hub.engine.counts().await.transports, 2);

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_streaming_answers_abandoned_requests() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;

    hub.engine.set_transport_delay(Duration::from_millis(300));
    let create = camera
        .request("create-transport", json!({ "direction": "send" }))
        .await;
    let stop = camera.request("stop-streaming", json!({})).await;

    let error = camera.recv().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["requestId"], create.as_str());
    assert_eq!(error["payload"]["requestType"], "create-transport");
    assert_eq!(error["payload"]["code"], 4);
    camera.reply("streaming-stopped", &stop).await;

    // The transport created after the stop is closed, not announced.
    tokio::time::sleep(Duration::from_secs(1)).await;
    hub.settle().await;
    assert_eq!(hub.engine.counts().await.transports, 0);
    camera.assert_silent().await;

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_stop_streaming_still_reports_completion() {
    let hub = TestHub::builder()
        .recording_disabled()
        .request_timeout(Duration::from_secs(1))
        .build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    camera.publish("video").await;

    // Producer and transport each take 2 s to close.
    hub.engine.set_close_delay(Duration::from_secs(2));
    let stop = camera.request("stop-streaming", json!({})).await;

    let error = camera.error_for(&stop).await;
    assert_eq!(error["payload"]["code"], 10);
    assert_eq!(error["payload"]["requestType"], "stop-streaming");

    let stopped = camera.expect("streaming-stopped").await;
    assert!(stopped["payload"]["requestId"].is_null());
    assert_eq!(hub.engine.counts().await.producers, 0);

    let registered = camera.register_streamer("Porch").await;
    assert_eq!(registered["role"], "streamer");

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_consume_releases_late_consumer() {
    let hub = TestHub::builder().recording_disabled().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;

    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let recv = viewer.create_transport("recv").await;

    hub.engine.set_consume_delay(Duration::from_secs(1));
    viewer
        .request(
            "consume",
            json!({
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": viewer.capabilities.clone(),
            }),
        )
        .await;
    viewer.disconnect().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    hub.settle().await;

    assert!(hub
        .adapter
        .owned(&Owner::Client(ClientId::from("viewer-1")))
        .await
        .is_none());
    let counts = hub.engine.counts().await;
    assert_eq!(counts.consumers, 0);
    assert_eq!(counts.producers, 1);

    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.viewers, 0);
    assert_eq!(topology.connections, 1);
    camera.assert_silent().await;

    hub.teardown().await;
}

// ============================================================================
// Consumers
// ============================================================================

#[tokio::test]
async fn test_consume_resume_and_engine_closure() {
    let hub = TestHub::builder().recording_disabled().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;

    let (_send, producer_id) = camera.publish("video").await;
    viewer.expect("new-producer").await;

    let recv = viewer.create_transport("recv").await;
    viewer.connect_transport(&recv).await;
    let consumed = viewer.consume(&recv, &producer_id).await;
    assert_eq!(consumed["paused"], true);
    assert_eq!(consumed["producerId"], producer_id.as_str());
    assert_eq!(consumed["clientId"], "camera-1");
    assert_eq!(consumed["kind"], "video");
    let consumer_id = consumed["id"].as_str().unwrap().to_string();

    let resume = viewer
        .request("resume-consumer", json!({ "consumerId": consumer_id }))
        .await;
    viewer.reply("consumer-resumed", &resume).await;
    assert_eq!(
        hub.engine
            .consumer_paused(&ConsumerId::from(consumer_id.as_str()))
            .await,
        Some(false)
    );

    // The engine closes the producer on its own.
    assert!(
        hub.engine
            .close_producer_externally(&ProducerId::from(producer_id.as_str()))
            .await
    );
    let closed = viewer.recv_until("producer-closed").await;
    assert_eq!(closed["payload"]["producerId"], producer_id.as_str());
    let consumer_closed = viewer.recv_until("consumer-closed").await;
    assert_eq!(consumer_closed["payload"]["consumerId"], consumer_id.as_str());

    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.streamers[0].producer_count, 0);

    hub.teardown().await;
}

// ============================================================================
// Disconnect and cleanup
// ============================================================================

#[tokio::test]
async fn test_streamer_disconnect_stops_every_recording() {
    let hub = TestHub::builder().build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Garage").await;

    let (send, _first) = camera.publish("video").await;
    camera.produce(&send, "video").await;
    camera.produce(&send, "audio").await;

    hub.wait_for_recordings(RECORDING_WAIT, |s| s.sessions.len() == 2)
        .await;
    assert_eq!(hub.encoder.launches(), 2);

    camera.disconnect().await;
    viewer.recv_until("streamer-left").await;

    hub.wait_for_recordings(RECORDING_WAIT, |s| s.sessions.is_empty())
        .await;
    assert_eq!(hub.encoder.stop_signals(), 2);
    assert_eq!(hub.encoder.running(), 0);

    hub.settle().await;
    let topology = hub.hub.topology().await.unwrap();
    assert!(topology.streamers.is_empty());
    assert_eq!(topology.connections, 1);
    assert!(hub
        .adapter
        .owned(&Owner::Client(ClientId::from("camera-1")))
        .await
        .is_none());
    let counts = hub.engine.counts().await;
    assert_eq!(counts.producers, 0);
    assert_eq!(counts.consumers, 0);
    // Only the viewer's session is left, and it holds no transports.
    assert_eq!(counts.transports, 0);

    hub.teardown().await;
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let hub = TestHub::builder().recording_disabled().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    camera.publish("video").await;

    camera.disconnect().await;
    hub.settle().await;

    let owner = Owner::Client(ClientId::from("camera-1"));
    let before = hub.engine.close_calls();
    assert!(before.total() > 0);

    assert_eq!(hub.adapter.cleanup(&owner).await, 0);
    assert_eq!(hub.adapter.cleanup(&owner).await, 0);
    assert_eq!(hub.engine.close_calls(), before);

    // A late duplicate disconnect is ignored as well.
    hub.hub
        .disconnect(ClientId::from("camera-1"))
        .await
        .unwrap();
    hub.settle().await;
    assert_eq!(hub.engine.close_calls(), before);

    hub.teardown().await;
}

#[tokio::test]
async fn test_no_duplicate_recording_per_producer() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;

    hub.wait_for_recordings(RECORDING_WAIT, |s| s.sessions.len() == 1)
        .await;

    let outcome = hub
        .recorder
        .start(RecordingRequest {
            producer_id: ProducerId::from(producer_id.as_str()),
            client_id: ClientId::from("camera-1"),
            streamer_name: "Porch".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Existing(_)));

    hub.settle().await;
    assert_eq!(hub.encoder.launches(), 1);
    assert_eq!(hub.recordings().await.sessions.len(), 1);

    hub.teardown().await;
}

#[tokio::test]
async fn test_audio_producer_is_not_recorded() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    camera.publish("audio").await;

    hub.settle().await;
    assert_eq!(hub.encoder.launches(), 0);
    assert!(hub.recordings().await.sessions.is_empty());

    hub.teardown().await;
}

#[tokio::test]
async fn test_encoder_absent_disables_recording() {
    let hub = TestHub::builder()
        .encoder(MockEncoderLauncher::builder().unavailable().build())
        .build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    camera.publish("video").await;

    hub.settle().await;
    let status = hub.recordings().await;
    assert!(!status.enabled);
    assert!(status.encoder.is_none());
    assert_eq!(status.active_count(), 0);
    assert_eq!(hub.encoder.launches(), 0);

    hub.teardown().await;
}

#[tokio::test]
async fn test_engine_failure_cancels_root_token() {
    let hub = TestHub::builder().build();
    let _camera = hub.connect("camera-1").await;

    hub.engine.fail("worker died").await;

    tokio::time::timeout(Duration::from_secs(5), hub.root.cancelled())
        .await
        .expect("engine failure should cancel the root token");

    hub.teardown().await;
}
