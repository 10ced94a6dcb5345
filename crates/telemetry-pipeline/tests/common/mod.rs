// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sinks and trails shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_pipeline::batch::Batch;
use telemetry_pipeline::config::{Config, PipelineConfig, RetryPolicy, SinkConfig, SinkProtocol};
use telemetry_pipeline::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use telemetry_pipeline::envelope::{Attributes, Span, SpanStatus};
use telemetry_pipeline::sink::Sink;
use telemetry_pipeline::{Envelope, SignalKind, SinkError};
use tokio::sync::Semaphore;

pub fn span_envelope(name: &str) -> Envelope {
    Envelope::new(Span {
        trace_id: "5b8efff798038103d269b633813fc60c".to_string(),
        span_id: "eee19b7ec3c1b174".to_string(),
        parent_span_id: None,
        name: name.to_string(),
        start_time_unix_nano: 1_000,
        end_time_unix_nano: 2_000,
        status: SpanStatus::Ok,
        attributes: Attributes::new(),
    })
    .with_resource_attribute("service.name", "checkout")
}

pub fn span_envelopes(count: usize) -> Vec<Envelope> {
    (0..count)
        .map(|i| span_envelope(&format!("op-{i}")))
        .collect()
}

/// Log sinks stand in for sinks the tests replace with [`RecordingSink`] and friends.
pub fn sink(id: &str, retry: RetryPolicy) -> SinkConfig {
    let mut sink = SinkConfig::new(id, SinkProtocol::Log);
    sink.retry = retry;
    sink
}

pub fn retry(max_retries: u32, backoff_base: Duration) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_base,
        backoff_cap: Duration::from_secs(60),
        ..RetryPolicy::default()
    }
}

pub fn trace_config(batch_max_size: usize, batch_max_age: Duration, sinks: Vec<SinkConfig>) -> Config {
    let mut config = Config::default();
    config.pipelines.insert(
        SignalKind::Trace,
        PipelineConfig {
            batch_max_size,
            batch_max_age,
            sinks,
        },
    );
    config
}

/// Yields until `condition` holds. Never lets a paused clock advance.
pub async fn settle(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Polls `condition` on the real clock for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[derive(Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<(u64, usize)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(sequence, envelope count)` of every delivered batch, in delivery order.
    pub fn batches(&self) -> Vec<(u64, usize)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().into_iter().map(|(_, len)| len).collect()
    }

    pub fn envelope_count(&self) -> usize {
        self.batch_sizes().into_iter().sum()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        self.batches
            .lock()
            .unwrap()
            .push((batch.sequence(), batch.len()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FailingSink {
    calls: AtomicUsize,
}

impl FailingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for FailingSink {
    async fn deliver(&self, _batch: &Batch) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Transient("connection refused".to_string()))
    }
}

/// Holds every delivery until permits are released.
pub struct GatedSink {
    gate: Semaphore,
    inner: Arc<RecordingSink>,
}

impl GatedSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            inner: RecordingSink::new(),
        })
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn recorded(&self) -> &RecordingSink {
        &self.inner
    }
}

#[async_trait]
impl Sink for GatedSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;
        permit.forget();
        self.inner.deliver(batch).await
    }
}

#[derive(Default)]
pub struct RecordingDeadLetter {
    records: Mutex<Vec<DeadLetter>>,
}

impl RecordingDeadLetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<DeadLetter> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn reasons_for(&self, sink_id: &str) -> Vec<DeadLetterReason> {
        self.records()
            .into_iter()
            .filter(|d| d.sink_id.as_ref().is_some_and(|id| id.as_str() == sink_id))
            .map(|d| d.reason)
            .collect()
    }

    pub fn envelopes_for(&self, sink_id: &str) -> usize {
        self.records()
            .into_iter()
            .filter(|d| d.sink_id.as_ref().is_some_and(|id| id.as_str() == sink_id))
            .map(|d| d.envelope_count)
            .sum()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetter {
    async fn record(&self, dead_letter: &DeadLetter, _batch: &Batch) {
        self.records.lock().unwrap().push(dead_letter.clone());
    }
}
