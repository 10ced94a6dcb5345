// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-sink delivery worker.
//!
//! Each exporter consumes its own bounded queue in FIFO order and owns its retry and circuit
//! breaker state, so a slow or failing sink never holds up the others. Every batch ends either
//! delivered or handed to the dead-letter trail.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::Batch;
use crate::circuit::CircuitBreaker;
use crate::config::{RetryPolicy, SinkId};
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::SignalKind;
use crate::errors::SinkError;
use crate::metrics::{MetricsRegistry, SinkCounters};
use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
    DeadLettered,
}

/// Delivery of one batch to one sink.
#[derive(Debug)]
pub struct Delivery {
    batch: Arc<Batch>,
    attempt_count: u32,
    state: DeliveryState,
    last_error: Option<SinkError>,
}

impl Delivery {
    fn new(batch: Arc<Batch>) -> Self {
        Self {
            batch,
            attempt_count: 0,
            state: DeliveryState::Pending,
            last_error: None,
        }
    }

    /// Delivery attempts made so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    #[must_use]
    pub fn state(&self) -> DeliveryState {
        self.state
    }
}

/// Latest view of an exporter, published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterStatus {
    pub sink_id: SinkId,
    pub kind: SignalKind,
    pub consecutive_failures: u32,
    pub circuit_open_until: Option<Instant>,
    /// Sequence of the batch currently being delivered.
    pub in_flight_batch: Option<u64>,
}

/// Sending half of an exporter's delivery queue.
#[derive(Debug, Clone)]
pub struct ExporterQueue {
    sink_id: SinkId,
    tx: mpsc::Sender<Arc<Batch>>,
    counters: Arc<SinkCounters>,
}

impl ExporterQueue {
    #[must_use]
    pub fn sink_id(&self) -> &SinkId {
        &self.sink_id
    }

    /// Queues a batch without waiting, handing it back if the queue is full or the exporter has
    /// stopped.
    pub fn try_enqueue(&self, batch: Arc<Batch>) -> Result<(), Arc<Batch>> {
        self.tx.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(batch) | mpsc::error::TrySendError::Closed(batch) => {
                batch
            }
        })
    }

    /// Batches waiting in the queue.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<SinkCounters> {
        &self.counters
    }

    pub(crate) fn downgrade(&self) -> mpsc::WeakSender<Arc<Batch>> {
        self.tx.downgrade()
    }
}

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub sink_id: SinkId,
    pub kind: SignalKind,
    pub retry: RetryPolicy,
    /// Upper bound on a single call to the sink.
    pub attempt_timeout: Duration,
    pub queue_capacity: usize,
}

pub struct Exporter {
    sink_id: SinkId,
    kind: SignalKind,
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    breaker: CircuitBreaker,
    rx: mpsc::Receiver<Arc<Batch>>,
    dead_letter: Arc<dyn DeadLetterSink>,
    counters: Arc<SinkCounters>,
    status: watch::Sender<ExporterStatus>,
    force_stop: CancellationToken,
}

impl Exporter {
    /// Builds an exporter with its queue and status channel.
    ///
    /// Closing every [`ExporterQueue`] lets the exporter finish the queued batches and return.
    /// Cancelling `force_stop` abandons the in-flight batch and dead-letters whatever is queued.
    pub fn new(
        config: ExporterConfig,
        sink: Arc<dyn Sink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        metrics: &MetricsRegistry,
        force_stop: CancellationToken,
    ) -> (Self, ExporterQueue, watch::Receiver<ExporterStatus>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let counters = metrics.register_sink(&config.sink_id, config.kind);
        let (status, status_rx) = watch::channel(ExporterStatus {
            sink_id: config.sink_id.clone(),
            kind: config.kind,
            consecutive_failures: 0,
            circuit_open_until: None,
            in_flight_batch: None,
        });
        let queue = ExporterQueue {
            sink_id: config.sink_id.clone(),
            tx,
            counters: Arc::clone(&counters),
        };
        let exporter = Self {
            sink_id: config.sink_id,
            kind: config.kind,
            sink,
            breaker: CircuitBreaker::new(
                config.retry.circuit_failure_threshold,
                config.retry.circuit_cooldown,
            ),
            retry: config.retry,
            attempt_timeout: config.attempt_timeout,
            rx,
            dead_letter,
            counters,
            status,
            force_stop,
        };
        (exporter, queue, status_rx)
    }

    pub async fn run(mut self) {
        debug!(sink = %self.sink_id, kind = %self.kind, "exporter started");
        loop {
            let batch = tokio::select! {
                biased;
                () = self.force_stop.cancelled() => break,
                batch = self.rx.recv() => batch,
            };
            let Some(batch) = batch else {
                debug!(sink = %self.sink_id, "delivery queue closed, exporter stopped");
                return;
            };
            self.process(batch).await;
        }

        self.rx.close();
        let mut abandoned = 0usize;
        while let Some(batch) = self.rx.recv().await {
            self.abandon(Delivery::new(batch), DeadLetterReason::ShutdownDeadline)
                .await;
            abandoned += 1;
        }
        warn!(
            sink = %self.sink_id,
            queued_batches = abandoned,
            "exporter forced to stop at shutdown deadline"
        );
    }

    async fn process(&mut self, batch: Arc<Batch>) {
        let mut delivery = Delivery::new(batch);
        if !self.breaker.allows_delivery(Instant::now()) {
            debug!(
                sink = %self.sink_id,
                batch = delivery.batch.sequence(),
                "circuit open, skipping delivery"
            );
            self.abandon(delivery, DeadLetterReason::CircuitOpen).await;
            return;
        }

        self.publish(Some(delivery.batch.sequence()));
        let reason = loop {
            delivery.state = DeliveryState::Pending;
            delivery.attempt_count += 1;
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                () = self.force_stop.cancelled() => break DeadLetterReason::ShutdownDeadline,
                result = tokio::time::timeout(self.attempt_timeout, self.sink.deliver(&delivery.batch)) => result,
            };
            self.counters.record_attempt(started.elapsed());
            let result = result.unwrap_or_else(|_| {
                Err(SinkError::Transient(format!(
                    "delivery attempt timed out after {}ms",
                    self.attempt_timeout.as_millis()
                )))
            });

            match result {
                Ok(()) => {
                    delivery.state = DeliveryState::Delivered;
                    self.breaker.record_success();
                    self.counters.record_delivered(delivery.batch.len());
                    debug!(
                        sink = %self.sink_id,
                        batch = delivery.batch.sequence(),
                        attempts = delivery.attempt_count,
                        "batch delivered"
                    );
                    self.publish(None);
                    return;
                }
                Err(e @ SinkError::Rejected(_)) => {
                    // The sink is reachable, so this is no reason to open the circuit.
                    self.breaker.record_success();
                    delivery.state = DeliveryState::Failed;
                    delivery.last_error = Some(e);
                    break DeadLetterReason::Rejected;
                }
                Err(e @ SinkError::Transient(_)) => {
                    debug!(
                        sink = %self.sink_id,
                        batch = delivery.batch.sequence(),
                        attempt = delivery.attempt_count,
                        "delivery failed: {e}"
                    );
                    delivery.state = DeliveryState::Failed;
                    delivery.last_error = Some(e);
                    let retries = delivery.attempt_count - 1;
                    if retries >= self.retry.max_retries {
                        if self.breaker.record_failure(Instant::now()) {
                            warn!(
                                sink = %self.sink_id,
                                consecutive_failures = self.breaker.consecutive_failures(),
                                cooldown_ms = self.retry.circuit_cooldown.as_millis(),
                                "circuit opened"
                            );
                        }
                        break DeadLetterReason::RetriesExhausted;
                    }
                    self.counters.record_retry();
                    let backoff = self.retry.backoff(retries);
                    tokio::select! {
                        biased;
                        () = self.force_stop.cancelled() => break DeadLetterReason::ShutdownDeadline,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };
        self.abandon(delivery, reason).await;
        self.publish(None);
    }

    async fn abandon(&self, mut delivery: Delivery, reason: DeadLetterReason) {
        delivery.state = DeliveryState::DeadLettered;
        let dead_letter = DeadLetter::new(Some(self.sink_id.clone()), &delivery.batch, reason)
            .with_attempts(delivery.attempt_count)
            .with_last_error(delivery.last_error.as_ref().map(ToString::to_string));
        if reason != DeadLetterReason::CircuitOpen {
            error!(
                sink = %self.sink_id,
                batch = dead_letter.batch_sequence,
                envelopes = dead_letter.envelope_count,
                attempts = dead_letter.attempts,
                %reason,
                "giving up on batch"
            );
        }
        self.dead_letter.record(&dead_letter, &delivery.batch).await;
        self.counters.record_dead_lettered(delivery.batch.len());
    }

    fn publish(&self, in_flight_batch: Option<u64>) {
        self.status.send_replace(ExporterStatus {
            sink_id: self.sink_id.clone(),
            kind: self.kind,
            consecutive_failures: self.breaker.consecutive_failures(),
            circuit_open_until: self.breaker.open_until(),
            in_flight_batch,
        });
    }
}
