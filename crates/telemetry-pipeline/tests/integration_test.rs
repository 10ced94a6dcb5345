// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{
    eventually, retry, settle, sink, span_envelope, span_envelopes, trace_config, FailingSink,
    GatedSink, RecordingDeadLetter, RecordingSink,
};
use mockito::Matcher;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::dead_letter::DeadLetterReason;
use telemetry_pipeline::health::LifecycleState;
use telemetry_pipeline::{Config, IngestError, SignalKind, Supervisor};

#[tokio::test(start_paused = true)]
async fn test_batches_seal_by_size_then_by_age() {
    let recorder = RecordingSink::new();
    let config = trace_config(
        100,
        Duration::from_secs(5),
        vec![sink("recorder", retry(0, Duration::from_millis(10)))],
    );
    let supervisor = Supervisor::builder(config)
        .with_sink("recorder", recorder.clone())
        .start()
        .await
        .expect("start");

    let ids = supervisor
        .ingest()
        .submit_many(span_envelopes(250))
        .expect("accepted");
    assert_eq!(ids.len(), 250);
    settle(|| recorder.batches().len() == 2).await;
    assert_eq!(recorder.batch_sizes(), vec![100, 100]);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(recorder.batches().len(), 2, "the last batch is not old enough yet");

    tokio::time::sleep(Duration::from_millis(200)).await;
    settle(|| recorder.batches().len() == 3).await;
    assert_eq!(recorder.batch_sizes(), vec![100, 100, 50]);

    let sequences: Vec<u64> = recorder.batches().into_iter().map(|(seq, _)| seq).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    let snapshot = supervisor.metrics_snapshot();
    assert_eq!(snapshot.kind(SignalKind::Trace).ingested, 250);
    assert_eq!(snapshot.kind(SignalKind::Trace).batches_sealed, 3);
    assert_eq!(snapshot.pending_envelopes, 0);

    let report = supervisor.shutdown().await;
    assert_eq!(report.sealed_batches, 0);
    assert_eq!(recorder.envelope_count(), 250);
}

#[tokio::test(start_paused = true)]
async fn test_failing_sink_is_retried_then_dead_lettered() {
    let failing = FailingSink::new();
    let trail = RecordingDeadLetter::new();
    let config = trace_config(
        1,
        Duration::from_secs(5),
        vec![sink("collector", retry(3, Duration::from_millis(10)))],
    );
    let supervisor = Supervisor::builder(config)
        .with_sink("collector", failing.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");

    supervisor
        .ingest()
        .submit(span_envelope("GET /cart"))
        .expect("accepted");
    let metrics = Arc::clone(supervisor.metrics());
    let report = supervisor.shutdown().await;

    assert!(!report.forced);
    assert_eq!(failing.calls(), 4);
    let records = trail.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DeadLetterReason::RetriesExhausted);
    assert_eq!(records[0].attempts, 4);
    assert_eq!(records[0].envelope_count, 1);
    assert!(records[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));

    let snapshot = metrics.snapshot();
    let collector = snapshot.sink("collector").expect("registered sink");
    assert_eq!(collector.attempts, 4);
    assert_eq!(collector.retried, 3);
    assert_eq!(collector.dead_lettered_envelopes, 1);
    assert_eq!(collector.delivered_batches, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_sink_does_not_delay_healthy_sink() {
    let healthy = RecordingSink::new();
    let broken = FailingSink::new();
    let trail = RecordingDeadLetter::new();
    let config = trace_config(
        1,
        Duration::from_secs(5),
        vec![
            sink("healthy", retry(3, Duration::from_secs(1))),
            sink("broken", retry(3, Duration::from_secs(1))),
        ],
    );
    let supervisor = Supervisor::builder(config)
        .with_sink("healthy", healthy.clone())
        .with_sink("broken", broken.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");

    for i in 0..20 {
        supervisor
            .ingest()
            .submit(span_envelope(&format!("op-{i}")))
            .expect("accepted");
    }
    // No time passes while settling, so the broken sink is still waiting out its first backoff.
    settle(|| healthy.batches().len() == 20).await;
    assert_eq!(broken.calls(), 1);
    let report = supervisor.health();
    let broken_health = report
        .sinks
        .iter()
        .find(|s| s.sink_id.as_str() == "broken")
        .expect("broken sink reported");
    assert_eq!(broken_health.in_flight_batch, Some(0));
    assert_eq!(broken_health.queue_depth, 19);

    let report = supervisor.shutdown().await;
    assert!(report.forced);
    assert_eq!(report.pending_envelopes, 0);
    assert_eq!(healthy.envelope_count(), 20);
    assert_eq!(trail.envelopes_for("broken"), 20);
    assert_eq!(trail.envelopes_for("healthy"), 0);
    assert!(trail
        .reasons_for("broken")
        .contains(&DeadLetterReason::ShutdownDeadline));
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_recovers_after_cooldown() {
    let failing = FailingSink::new();
    let trail = RecordingDeadLetter::new();
    let mut policy = retry(0, Duration::from_millis(10));
    policy.circuit_failure_threshold = 2;
    policy.circuit_cooldown = Duration::from_secs(30);
    let config = trace_config(1, Duration::from_secs(5), vec![sink("collector", policy)]);
    let supervisor = Supervisor::builder(config)
        .with_sink("collector", failing.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");
    let ingest = Arc::clone(supervisor.ingest());

    ingest.submit_many(span_envelopes(2)).expect("accepted");
    settle(|| trail.len() == 2).await;
    assert_eq!(failing.calls(), 2);

    ingest.submit_many(span_envelopes(3)).expect("accepted");
    settle(|| trail.len() == 5).await;
    assert_eq!(failing.calls(), 2, "an open circuit makes no delivery attempts");
    assert_eq!(
        trail.reasons_for("collector"),
        vec![
            DeadLetterReason::RetriesExhausted,
            DeadLetterReason::RetriesExhausted,
            DeadLetterReason::CircuitOpen,
            DeadLetterReason::CircuitOpen,
            DeadLetterReason::CircuitOpen,
        ]
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    ingest.submit(span_envelope("trial")).expect("accepted");
    settle(|| trail.len() == 6).await;
    assert_eq!(failing.calls(), 3, "one trial batch after the cooldown");

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_recovers_once_batches_are_routed() {
    let gated = GatedSink::new();
    let mut config = trace_config(
        10,
        Duration::from_secs(1),
        vec![sink("gated", retry(0, Duration::from_millis(10)))],
    );
    config.buffer.high_water_mark = 4;
    let supervisor = Supervisor::builder(config)
        .with_sink("gated", gated.clone())
        .start()
        .await
        .expect("start");
    let ingest = Arc::clone(supervisor.ingest());

    ingest.submit_many(span_envelopes(4)).expect("accepted");
    let err = ingest.submit(span_envelope("overflow")).unwrap_err();
    assert_eq!(
        err,
        IngestError::BufferFull {
            pending: 4,
            high_water_mark: 4
        }
    );
    assert!(err.is_retryable());
    assert_eq!(supervisor.metrics_snapshot().buffer_full, 1);

    // The age seal hands the batch to the router even though the sink has not delivered it.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    settle(|| supervisor.health().pending_envelopes == 0).await;
    assert!(gated.recorded().batches().is_empty());
    ingest
        .submit(span_envelope("after routing"))
        .expect("accepted once the open batch was routed");

    gated.open();
    let report = supervisor.shutdown().await;
    assert!(!report.forced);
    assert_eq!(report.sealed_batches, 1);
    assert_eq!(gated.recorded().envelope_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_sink_sheds_its_own_copies() {
    let stalled = GatedSink::new();
    let healthy = RecordingSink::new();
    let trail = RecordingDeadLetter::new();
    let mut stalled_sink = sink("stalled", retry(0, Duration::from_millis(10)));
    stalled_sink.queue_capacity = 2;
    let mut config = trace_config(
        1,
        Duration::from_secs(5),
        vec![stalled_sink, sink("healthy", retry(0, Duration::from_millis(10)))],
    );
    config.buffer.high_water_mark = 4;
    let supervisor = Supervisor::builder(config)
        .with_sink("stalled", stalled.clone())
        .with_sink("healthy", healthy.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");

    for i in 0..10 {
        supervisor
            .ingest()
            .submit(span_envelope(&format!("op-{i}")))
            .expect("a stalled sink never refuses producers");
        settle(|| healthy.batches().len() == i + 1).await;
    }

    // One batch is in flight and two are queued; every later copy is shed for this sink only.
    let queue_full = trail
        .reasons_for("stalled")
        .into_iter()
        .filter(|reason| *reason == DeadLetterReason::QueueFull)
        .count();
    assert_eq!(queue_full, 7);
    assert!(trail.reasons_for("healthy").is_empty());
    assert_eq!(supervisor.metrics_snapshot().buffer_full, 0);
    let stalled_health = supervisor
        .health()
        .sinks
        .into_iter()
        .find(|s| s.sink_id.as_str() == "stalled")
        .expect("stalled sink reported");
    assert_eq!(stalled_health.in_flight_batch, Some(0));
    assert_eq!(stalled_health.queue_depth, 2);

    supervisor.shutdown().await;
    assert_eq!(healthy.envelope_count(), 10);
    assert_eq!(trail.envelopes_for("stalled"), 10);
}

#[tokio::test(start_paused = true)]
async fn test_healthy_sink_keeps_full_rate_under_sustained_load() {
    let healthy = RecordingSink::new();
    let broken = FailingSink::new();
    let trail = RecordingDeadLetter::new();
    let mut broken_sink = sink("broken", retry(3, Duration::from_secs(1)));
    broken_sink.queue_capacity = 4;
    let mut config = trace_config(
        1,
        Duration::from_secs(5),
        vec![sink("healthy", retry(0, Duration::from_millis(10))), broken_sink],
    );
    config.buffer.high_water_mark = 50;
    let supervisor = Supervisor::builder(config)
        .with_sink("healthy", healthy.clone())
        .with_sink("broken", broken.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");
    let ingest = Arc::clone(supervisor.ingest());

    let mut accepted = 0;
    for i in 0..200 {
        if ingest.submit(span_envelope(&format!("op-{i}"))).is_ok() {
            accepted += 1;
        }
        if i == 99 {
            settle(|| healthy.envelope_count() == 100).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(accepted, 200);
    settle(|| healthy.envelope_count() == 200).await;
    assert_eq!(supervisor.metrics_snapshot().buffer_full, 0);
    // Two seconds in, the broken sink is still retrying its first batch.
    assert!(broken.calls() < 5);

    supervisor.shutdown().await;
    assert_eq!(healthy.envelope_count(), 200);
    assert_eq!(trail.envelopes_for("broken"), 200);
    assert_eq!(trail.envelopes_for("healthy"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_accounts_for_every_accepted_envelope() {
    let recorder = RecordingSink::new();
    let failing = FailingSink::new();
    let trail = RecordingDeadLetter::new();
    let config = trace_config(
        10,
        Duration::from_secs(3600),
        vec![
            sink("recorder", retry(0, Duration::from_millis(10))),
            sink("failing", retry(1, Duration::from_millis(10))),
        ],
    );
    let supervisor = Supervisor::builder(config)
        .with_sink("recorder", recorder.clone())
        .with_sink("failing", failing.clone())
        .with_dead_letter(trail.clone())
        .start()
        .await
        .expect("start");
    let ingest = Arc::clone(supervisor.ingest());

    let accepted = ingest.submit_many(span_envelopes(25)).expect("accepted").len();
    let report = supervisor.shutdown().await;

    assert_eq!(report.sealed_batches, 1, "the partial batch is force-sealed");
    assert!(!report.forced);
    assert_eq!(report.pending_envelopes, 0);
    assert_eq!(recorder.batch_sizes(), vec![10, 10, 5]);
    assert_eq!(recorder.envelope_count() + trail.envelopes_for("recorder"), accepted);
    assert_eq!(failing.calls(), 6);
    assert_eq!(trail.envelopes_for("failing"), accepted);
    assert_eq!(
        ingest.submit(span_envelope("late")).unwrap_err(),
        IngestError::ShuttingDown
    );
}

#[tokio::test]
async fn test_http_ingest_to_http_sink() {
    let mut collector = mockito::Server::new_async().await;
    let mock = collector
        .mock("POST", "/v1/traces")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(serde_json::json!({"kind": "trace"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let document = format!(
        r#"
ingest:
  listen_address: "127.0.0.1:0"
pipelines:
  trace:
    batch_max_size: 2
    batch_max_age: 1h
    sinks:
      - id: collector
        protocol: http
        endpoint: "{}/v1/traces"
        timeout: 2s
        retry:
          max_retries: 0
"#,
        collector.url()
    );
    let config = Config::from_yaml_str(&document).expect("valid config");
    let supervisor = Supervisor::start(config).await.expect("start");
    assert_eq!(supervisor.state(), LifecycleState::Running);
    let addr = supervisor.local_addr().expect("listening");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/v1/envelopes"))
        .json(&serde_json::json!([
            {
                "kind": "trace",
                "resource_attributes": {"service.name": "checkout"},
                "payload": {
                    "trace_id": "5b8efff798038103d269b633813fc60c",
                    "span_id": "eee19b7ec3c1b174",
                    "name": "GET /cart",
                    "start_time_unix_nano": 1,
                    "end_time_unix_nano": 2
                }
            },
            {
                "kind": "trace",
                "payload": {
                    "trace_id": "5b8efff798038103d269b633813fc60c",
                    "span_id": "aaa19b7ec3c1b174",
                    "name": "SELECT cart",
                    "start_time_unix_nano": 1,
                    "end_time_unix_nano": 2
                }
            }
        ]))
        .send()
        .await
        .expect("request sent");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["accepted_ids"].as_array().map(Vec::len), Some(2));

    let metrics = Arc::clone(supervisor.metrics());
    eventually(|| {
        metrics
            .snapshot()
            .sink("collector")
            .is_some_and(|s| s.delivered_batches == 1)
    })
    .await;

    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["state"], "running");
    assert_eq!(health["sinks"][0]["sink_id"], "collector");

    let report = supervisor.shutdown().await;
    assert_eq!(report.sealed_batches, 0);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_file_dead_letter_trail_from_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let trail_path = dir.path().join("dead-letters.jsonl");
    let mut unreachable = sink("unreachable", retry(0, Duration::from_millis(10)));
    unreachable.protocol = telemetry_pipeline::SinkProtocol::Http;
    unreachable.endpoint = Some("http://127.0.0.1:9/v1/traces".to_string());
    unreachable.timeout = Duration::from_secs(2);
    let mut config = trace_config(1, Duration::from_secs(5), vec![unreachable]);
    config.dead_letter.path = Some(trail_path.clone());

    let supervisor = Supervisor::start(config).await.expect("start");
    supervisor
        .ingest()
        .submit(span_envelope("GET /cart"))
        .expect("accepted");
    let report = supervisor.shutdown().await;
    assert_eq!(report.pending_envelopes, 0);

    let contents = tokio::fs::read_to_string(&trail_path)
        .await
        .expect("trail written");
    let lines: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["sink_id"], "unreachable");
    assert_eq!(lines[0]["reason"], "retries_exhausted");
    assert_eq!(lines[0]["envelopes"][0]["payload"]["name"], "GET /cart");
}
