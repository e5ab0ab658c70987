use mockito::{Matcher, Server};
use tempfile::tempdir;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use video_telemetry::persistence::FileSnapshotStore;
use video_telemetry::retry::{FailureKind, RetryItem, RetrySnapshot};
use video_telemetry::{
    EventType, HarvestOutcome, HarvesterService, TelemetryConfig, TelemetryEvent,
};

fn pipeline_config(collector_url: &str) -> TelemetryConfig {
    let mut config = TelemetryConfig::default();
    config.endpoint.collector_url = collector_url.to_string();
    config.endpoint.license_key = "lk-test".to_string();
    config.endpoint.app_id = "player-under-test".to_string();
    config.endpoint.page_reference = "session-1".to_string();
    config
}

fn playback_event(action: &str) -> TelemetryEvent {
    TelemetryEvent::new(EventType::VideoAction, action)
        .with_attribute("contentTitle", "clip")
        .with_attribute("playhead", 0)
}

#[tokio::test]
async fn pipeline_delivers_buffered_events() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::PartialJsonString(
            r#"{"events":[{"actionName":"CONTENT_START"}]}"#.to_string(),
        ))
        .with_status(202)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::new(pipeline_config(&server.url()), cancel)
        .expect("failed to create harvester");
    tokio::spawn(service.run());

    handle
        .insert(playback_event("CONTENT_START"))
        .expect("insert failed");
    let outcome = handle.force_harvest().await.expect("harvest failed");

    assert_eq!(
        outcome,
        HarvestOutcome::Completed {
            chunks_sent: 1,
            chunks_retried: 0,
            chunks_dropped: 0,
        }
    );
    mock.assert_async().await;

    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.buffer_events, 0);
    assert_eq!(metrics.events_added, 1);
    assert_eq!(metrics.requests_succeeded, 1);

    // A reset zeroes every counter on the surface, retry counters included.
    handle.reset_metrics().expect("reset failed");
    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.events_added, 0);
    assert_eq!(metrics.requests_succeeded, 0);
    assert_eq!(metrics.retry_items_discarded, 0);
    assert_eq!(metrics.retry_items_exhausted, 0);
}

#[tokio::test]
async fn retryable_failure_is_redelivered_on_next_harvest() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", Matcher::Any)
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::new(pipeline_config(&server.url()), cancel)
        .expect("failed to create harvester");
    tokio::spawn(service.run());

    handle
        .insert(playback_event("CONTENT_ERROR"))
        .expect("insert failed");
    let outcome = handle.force_harvest().await.expect("harvest failed");
    assert_eq!(
        outcome,
        HarvestOutcome::Completed {
            chunks_sent: 0,
            chunks_retried: 1,
            chunks_dropped: 0,
        }
    );
    failing.assert_async().await;

    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.retry_items, 1);

    // The endpoint recovers; a later created mock takes precedence.
    let recovered = server
        .mock("POST", Matcher::Any)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    // The next harvest folds the stored event back in.
    let outcome = handle.force_harvest().await.expect("harvest failed");
    assert_eq!(
        outcome,
        HarvestOutcome::Completed {
            chunks_sent: 1,
            chunks_retried: 0,
            chunks_dropped: 0,
        }
    );
    recovered.assert_async().await;

    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.retry_items, 0);
}

#[tokio::test]
async fn terminal_failure_drops_the_chunk_permanently() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::new(pipeline_config(&server.url()), cancel)
        .expect("failed to create harvester");
    tokio::spawn(service.run());

    handle
        .insert(playback_event("CONTENT_START"))
        .expect("insert failed");
    let outcome = handle.force_harvest().await.expect("harvest failed");
    assert_eq!(
        outcome,
        HarvestOutcome::Completed {
            chunks_sent: 0,
            chunks_retried: 0,
            chunks_dropped: 1,
        }
    );
    mock.assert_async().await;

    // Nothing left to deliver, not even in the retry store.
    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.retry_items, 0);
    let outcome = handle.force_harvest().await.expect("harvest failed");
    assert_eq!(outcome, HarvestOutcome::NoEvents);
}

#[tokio::test]
async fn teardown_runs_a_final_harvest() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::new(pipeline_config(&server.url()), cancel.clone())
        .expect("failed to create harvester");
    let scheduler = tokio::spawn(service.run());

    handle
        .insert(playback_event("CONTENT_END"))
        .expect("insert failed");
    cancel.cancel();

    timeout(Duration::from_secs(5), scheduler)
        .await
        .expect("scheduler did not stop")
        .expect("scheduler panicked");
    mock.assert_async().await;
}

#[tokio::test]
async fn overflow_trigger_harvests_without_waiting_for_the_timer() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .with_status(202)
        .expect_at_least(1)
        .create_async()
        .await;

    let mut config = pipeline_config(&server.url());
    config.buffer.max_events = 10;
    // Keep the timer and the smart trigger out of the picture.
    config.harvest.base_interval = Duration::from_secs(600);
    config.harvest.min_interval = Duration::from_secs(600);
    config.harvest.max_interval = Duration::from_secs(600);
    config.harvest.smart_trigger_delay = Duration::from_secs(600);

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::new(config, cancel)
        .expect("failed to create harvester");
    tokio::spawn(service.run());

    // The ninth insert crosses the 90% overflow threshold.
    for n in 0..9 {
        handle
            .insert(playback_event(&format!("ACTION_{n}")))
            .expect("insert failed");
    }

    let mut drained = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(100)).await;
        let metrics = handle.metrics().await.expect("metrics failed");
        if metrics.buffer_events == 0 && metrics.requests_succeeded >= 1 {
            drained = true;
            break;
        }
    }
    assert!(drained, "overflow trigger never flushed the buffer");
    mock.assert_async().await;
}

#[tokio::test]
async fn persisted_retry_items_survive_a_restart() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Any)
        .match_body(Matcher::PartialJsonString(
            r#"{"events":[{"actionName":"CONTENT_BUFFER_START"}]}"#.to_string(),
        ))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let dir = tempdir().expect("failed to create temp dir");
    let slot = dir.path().join("retry-snapshot.json");

    // A previous run left one undelivered event behind.
    let event = playback_event("CONTENT_BUFFER_START");
    let size = event.serialized_size();
    let snapshot = RetrySnapshot {
        items: vec![RetryItem {
            event,
            size,
            retry_count: 1,
            first_failure_ms: 0,
            last_error: FailureKind::HttpStatus(503),
            next_attempt_ms: 0,
        }],
    };
    let mut seed_store = FileSnapshotStore::new(&slot);
    video_telemetry::persistence::RetrySnapshotStore::save(&mut seed_store, &snapshot)
        .expect("failed to seed snapshot");

    let cancel = CancellationToken::new();
    let (service, handle) = HarvesterService::with_snapshot_store(
        pipeline_config(&server.url()),
        cancel,
        Box::new(FileSnapshotStore::new(&slot)),
    )
    .expect("failed to create harvester");
    tokio::spawn(service.run());

    let metrics = handle.metrics().await.expect("metrics failed");
    assert_eq!(metrics.retry_items, 1);

    let outcome = handle.force_harvest().await.expect("harvest failed");
    assert_eq!(
        outcome,
        HarvestOutcome::Completed {
            chunks_sent: 1,
            chunks_retried: 0,
            chunks_dropped: 0,
        }
    );
    mock.assert_async().await;
}
