//! Recording lifecycle through the hub, with a scripted encoder.
//!
//! Runs on a paused clock: start delays, flush delays and kill timeouts
//! elapse instantly once every task is idle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::path::Path;
use std::time::Duration;

use common::types::{ClientId, ProducerId};
use hub_service::media::Owner;
use hub_service::recording::{RecordingRequest, RecordingState, StartOutcome};
use hub_test_utils::{MockEncoderLauncher, TestHub};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(30);

fn files_with_extension(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|e| e == extension))
        .count()
}

// ============================================================================
// Normal lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recording_becomes_active_then_stops_gracefully() {
    let hub = TestHub::builder().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Back Yard").await;
    let (_send, producer_id) = camera.publish("video").await;

    let status = hub
        .wait_for_recordings(WAIT, |s| {
            s.sessions
                .first()
                .is_some_and(|r| r.state == RecordingState::Active)
        })
        .await;
    let session = status.sessions.first().unwrap();
    assert_eq!(session.producer_id.as_str(), producer_id);
    assert_eq!(session.client_id.as_str(), "camera-1");
    assert_eq!(session.streamer_name, "Back Yard");
    assert!(session.output_path.is_some());
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 1);

    // Capture resources belong to the recording, not the streamer.
    let owned = hub
        .adapter
        .owned(&Owner::Capture(ProducerId::from(producer_id.as_str())))
        .await
        .unwrap();
    assert_eq!(owned.transports, 1);
    assert_eq!(owned.consumers, 1);

    assert!(hub
        .recorder
        .stop(ProducerId::from(producer_id.as_str()))
        .await
        .unwrap());
    hub.wait_for_recordings(WAIT, |s| s.sessions.is_empty())
        .await;

    assert_eq!(hub.encoder.stop_signals(), 1);
    assert_eq!(hub.encoder.kills(), 0);
    assert_eq!(hub.encoder.running(), 0);
    assert_eq!(files_with_extension(hub.recording_dir(), "webm"), 1);
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 0);
    assert!(hub
        .adapter
        .owned(&Owner::Capture(ProducerId::from(producer_id.as_str())))
        .await
        .is_none());

    // The live stream is untouched.
    assert_eq!(hub.engine.counts().await.producers, 1);

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_of_unknown_producer_is_a_no_op() {
    let hub = TestHub::builder().build();
    assert!(!hub
        .recorder
        .stop(ProducerId::from("never-recorded"))
        .await
        .unwrap());
    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stubborn_encoder_is_killed() {
    let hub = TestHub::builder()
        .encoder(MockEncoderLauncher::builder().ignore_stop().build())
        .kill_timeout(Duration::from_secs(3))
        .build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;
    hub.wait_for_recordings(WAIT, |s| s.active_count() == 1)
        .await;

    hub.recorder
        .stop(ProducerId::from(producer_id.as_str()))
        .await
        .unwrap();
    hub.wait_for_recordings(WAIT, |s| s.sessions.is_empty())
        .await;

    assert_eq!(hub.encoder.stop_signals(), 1);
    assert_eq!(hub.encoder.kills(), 1);
    assert_eq!(hub.encoder.running(), 0);
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 0);

    hub.teardown().await;
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_encoder_crash_leaves_live_stream_untouched() {
    let hub = TestHub::builder()
        .encoder(
            MockEncoderLauncher::builder()
                .crash_after(Duration::from_secs(2))
                .build(),
        )
        .build();
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;
    viewer.expect("streamer-joined").await;
    viewer.expect("new-producer").await;

    let encoder = hub.encoder.clone();
    hub.wait_for_recordings(WAIT, |s| {
        encoder.launches() == 1 && s.sessions.is_empty()
    })
    .await;

    assert_eq!(hub.encoder.running(), 0);
    assert_eq!(hub.encoder.stop_signals(), 0);
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 0);

    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.streamers[0].producer_count, 1);
    assert_eq!(
        hub.adapter
            .producer_owner(&ProducerId::from(producer_id.as_str()))
            .await,
        Some(Owner::Client(ClientId::from("camera-1")))
    );
    viewer.assert_silent().await;
    camera.assert_silent().await;

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_launch_failure_releases_capture() {
    let hub = TestHub::builder()
        .encoder(MockEncoderLauncher::builder().fail_launch().build())
        .build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;

    let encoder = hub.encoder.clone();
    hub.wait_for_recordings(WAIT, |s| {
        encoder.jobs().len() == 1 && s.sessions.is_empty()
    })
    .await;

    assert_eq!(hub.encoder.launches(), 0);
    assert!(hub
        .adapter
        .owned(&Owner::Capture(ProducerId::from(producer_id.as_str())))
        .await
        .is_none());
    let counts = hub.engine.counts().await;
    assert_eq!(counts.consumers, 0);
    assert_eq!(counts.producers, 1);
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 0);

    // The streamer can still be watched.
    let mut viewer = hub.connect("viewer-1").await;
    viewer.register_viewer().await;
    let recv = viewer.create_transport("recv").await;
    let consumed = viewer.consume(&recv, &producer_id).await;
    assert_eq!(consumed["producerId"], producer_id.as_str());

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_port_exhaustion_fails_second_recording() {
    let hub = TestHub::builder().port_range(21000, 21001).build();
    let mut first = hub.connect("camera-1").await;
    first.register_streamer("One").await;
    first.publish("video").await;
    hub.wait_for_recordings(WAIT, |s| s.sessions.len() == 1)
        .await;

    let mut second = hub.connect("camera-2").await;
    second.register_streamer("Two").await;
    let (_send, producer_id) = second.publish("video").await;

    let outcome = hub
        .recorder
        .start(RecordingRequest {
            producer_id: ProducerId::from(producer_id.as_str()),
            client_id: ClientId::from("camera-2"),
            streamer_name: "Two".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Failed(_)));

    hub.settle().await;
    assert_eq!(hub.encoder.launches(), 1);
    assert_eq!(hub.recordings().await.sessions.len(), 1);

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recording_disabled_by_configuration() {
    let hub = TestHub::builder().recording_disabled().build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let (_send, producer_id) = camera.publish("video").await;

    let outcome = hub
        .recorder
        .start(RecordingRequest {
            producer_id: ProducerId::from(producer_id.as_str()),
            client_id: ClientId::from("camera-1"),
            streamer_name: "Porch".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Disabled);
    assert!(!hub.recordings().await.enabled);
    assert_eq!(hub.encoder.launches(), 0);

    hub.teardown().await;
}

// ============================================================================
// Shutdown and timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recorder_shutdown_stops_every_session() {
    let hub = TestHub::builder().build();
    let mut first = hub.connect("camera-1").await;
    first.register_streamer("One").await;
    first.publish("video").await;
    let mut second = hub.connect("camera-2").await;
    second.register_streamer("Two").await;
    second.publish("video").await;
    hub.wait_for_recordings(WAIT, |s| s.active_count() == 2)
        .await;

    hub.recorder.shutdown(Duration::from_secs(10)).await.unwrap();

    assert_eq!(hub.encoder.stop_signals(), 2);
    assert_eq!(hub.encoder.running(), 0);
    assert_eq!(files_with_extension(hub.recording_dir(), "sdp"), 0);

    hub.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_produce_is_released_when_it_completes() {
    let hub = TestHub::builder()
        .request_timeout(Duration::from_secs(2))
        .build();
    let mut camera = hub.connect("camera-1").await;
    camera.register_streamer("Porch").await;
    let send = camera.create_transport("send").await;
    camera.connect_transport(&send).await;

    hub.engine.set_produce_delay(Duration::from_secs(30));
    let produce = camera
        .request(
            "produce",
            json!({
                "transportId": send,
                "kind": "video",
                "rtpParameters": hub_test_utils::vp8_rtp_parameters(),
            }),
        )
        .await;

    let error = camera.error_for(&produce).await;
    assert_eq!(error["payload"]["code"], 10);
    assert_eq!(error["payload"]["requestType"], "produce");

    tokio::time::sleep(Duration::from_secs(30)).await;
    hub.settle().await;

    assert_eq!(hub.engine.produce_calls(), 1);
    assert_eq!(hub.engine.counts().await.producers, 0);
    assert_eq!(hub.encoder.launches(), 0);
    let topology = hub.hub.topology().await.unwrap();
    assert_eq!(topology.streamers[0].producer_count, 0);
    camera.assert_silent().await;

    hub.teardown().await;
}
