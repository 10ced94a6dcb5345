// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::batch::Batch;
use crate::buffer::PendingCounter;
use crate::circuit::CircuitState;
use crate::config::SinkId;
use crate::envelope::SignalKind;
use crate::exporter::{ExporterQueue, ExporterStatus};
use crate::metrics::{MetricsRegistry, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl LifecycleState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkHealth {
    pub sink_id: SinkId,
    pub kind: SignalKind,
    pub circuit: CircuitState,
    /// Time left before an open circuit lets a trial batch through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_remaining_ms: Option<u64>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_batch: Option<u64>,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub state: LifecycleState,
    pub pending_envelopes: usize,
    pub high_water_mark: usize,
    pub sinks: Vec<SinkHealth>,
}

struct ExporterView {
    status: watch::Receiver<ExporterStatus>,
    // Weak so that health reporting never keeps an exporter's queue open.
    queue: mpsc::WeakSender<Arc<Batch>>,
}

/// Collects the observable state of a running pipeline.
pub struct StatusBoard {
    state: AtomicU8,
    exporters: Vec<ExporterView>,
    pending: PendingCounter,
    metrics: Arc<MetricsRegistry>,
}

impl StatusBoard {
    #[must_use]
    pub fn new(pending: PendingCounter, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Starting as u8),
            exporters: Vec::new(),
            pending,
            metrics,
        }
    }

    pub fn watch_exporter(&mut self, queue: &ExporterQueue, status: watch::Receiver<ExporterStatus>) {
        self.exporters.push(ExporterView {
            status,
            queue: queue.downgrade(),
        });
    }

    pub fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let now = Instant::now();
        let sinks = self
            .exporters
            .iter()
            .map(|view| {
                let status = view.status.borrow().clone();
                let circuit = CircuitState::at(status.circuit_open_until, now);
                let circuit_remaining_ms = status
                    .circuit_open_until
                    .filter(|until| now < *until)
                    .map(|until| u64::try_from((until - now).as_millis()).unwrap_or(u64::MAX));
                let queue_depth = view
                    .queue
                    .upgrade()
                    .map_or(0, |tx| tx.max_capacity() - tx.capacity());
                SinkHealth {
                    sink_id: status.sink_id,
                    kind: status.kind,
                    circuit,
                    circuit_remaining_ms,
                    consecutive_failures: status.consecutive_failures,
                    in_flight_batch: status.in_flight_batch,
                    queue_depth,
                }
            })
            .collect();
        HealthReport {
            state: self.state(),
            pending_envelopes: self.pending.current(),
            high_water_mark: self.pending.high_water_mark(),
            sinks,
        }
    }

    /// Metrics snapshot including the pending-envelope gauge.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.pending_envelopes = self.pending.current();
        snapshot
    }

    /// Prometheus text exposition of every collector, with the pending gauge refreshed.
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        self.metrics.set_pending(self.pending.current());
        self.metrics.render_prometheus()
    }
}
