// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::SignalKind;
use crate::exporter::ExporterQueue;

/// Fans each sealed batch out to every exporter of its kind.
///
/// The batch leaves the pending count here; from then on each sink's backlog is bounded by its own
/// queue. The batch is wrapped in an `Arc` and shared read-only. Enqueueing never waits, so one
/// full exporter queue cannot hold up the others. A copy that cannot be queued is dead-lettered
/// for that sink only.
pub struct Router {
    routes: HashMap<SignalKind, Vec<ExporterQueue>>,
    dead_letter: Arc<dyn DeadLetterSink>,
}

impl Router {
    #[must_use]
    pub fn new(dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            routes: HashMap::new(),
            dead_letter,
        }
    }

    pub fn add_route(&mut self, kind: SignalKind, queue: ExporterQueue) {
        self.routes.entry(kind).or_default().push(queue);
    }

    #[must_use]
    pub fn route_count(&self, kind: SignalKind) -> usize {
        self.routes.get(&kind).map_or(0, Vec::len)
    }

    /// Hands `batch` to each exporter of its kind. Returns the number of exporters that took it.
    pub async fn dispatch(&self, mut batch: Batch) -> usize {
        batch.release_pending();
        let kind = batch.kind();
        let batch = Arc::new(batch);
        let Some(queues) = self.routes.get(&kind).filter(|queues| !queues.is_empty()) else {
            warn!(%kind, batch = batch.sequence(), "no pipeline for batch kind");
            self.dead_letter
                .record(
                    &DeadLetter::new(None, &batch, DeadLetterReason::NoRoute),
                    &batch,
                )
                .await;
            return 0;
        };

        let mut queued = 0;
        for queue in queues {
            match queue.try_enqueue(Arc::clone(&batch)) {
                Ok(()) => queued += 1,
                Err(rejected) => {
                    warn!(
                        sink = %queue.sink_id(),
                        batch = rejected.sequence(),
                        "exporter queue unavailable, dead-lettering batch for this sink"
                    );
                    let dead_letter = DeadLetter::new(
                        Some(queue.sink_id().clone()),
                        &rejected,
                        DeadLetterReason::QueueFull,
                    );
                    self.dead_letter.record(&dead_letter, &rejected).await;
                    queue.counters().record_dead_lettered(rejected.len());
                }
            }
        }
        debug!(%kind, batch = batch.sequence(), sinks = queued, "dispatched batch");
        queued
    }

    /// Dispatches batches until every sender of `rx` is gone, then drops the exporter queues.
    pub async fn run(self, mut rx: mpsc::Receiver<Batch>) {
        debug!("router started");
        while let Some(batch) = rx.recv().await {
            self.dispatch(batch).await;
        }
        debug!("hand-off channel closed, router stopped");
    }
}
