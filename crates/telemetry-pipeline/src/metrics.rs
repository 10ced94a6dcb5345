// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters describing the engine itself.
//!
//! The registry is created by whoever assembles the pipeline and handed to each component, so
//! tests get a fresh set of collectors per run. Values read through
//! [`MetricsRegistry::snapshot`] are eventually consistent.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::SinkId;
use crate::envelope::SignalKind;

const NAMESPACE: &str = "telemetry_pipeline";

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Clone)]
struct SinkVecs {
    attempts: IntCounterVec,
    delivered_batches: IntCounterVec,
    delivered_envelopes: IntCounterVec,
    retries: IntCounterVec,
    dead_lettered_batches: IntCounterVec,
    dead_lettered_envelopes: IntCounterVec,
    latency: HistogramVec,
}

impl SinkVecs {
    fn reset(&self) {
        for vec in [
            &self.attempts,
            &self.delivered_batches,
            &self.delivered_envelopes,
            &self.retries,
            &self.dead_lettered_batches,
            &self.dead_lettered_envelopes,
        ] {
            vec.reset();
        }
        self.latency.reset();
    }
}

/// Delivery counters of one sink. Owned by the sink's exporter.
pub struct SinkCounters {
    sink: String,
    kind: SignalKind,
    vecs: SinkVecs,
}

impl fmt::Debug for SinkCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkCounters")
            .field("sink", &self.sink)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SinkCounters {
    fn labels(&self) -> [&str; 2] {
        [self.sink.as_str(), self.kind.as_str()]
    }

    fn counter(&self, vec: &IntCounterVec) -> IntCounter {
        vec.with_label_values(&self.labels())
    }

    /// Records one call to the sink and how long it took, whatever the outcome.
    pub fn record_attempt(&self, latency: Duration) {
        self.counter(&self.vecs.attempts).inc();
        self.vecs
            .latency
            .with_label_values(&self.labels())
            .observe(latency.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.counter(&self.vecs.retries).inc();
    }

    pub fn record_delivered(&self, envelopes: usize) {
        self.counter(&self.vecs.delivered_batches).inc();
        self.counter(&self.vecs.delivered_envelopes)
            .inc_by(envelopes as u64);
    }

    pub fn record_dead_lettered(&self, envelopes: usize) {
        self.counter(&self.vecs.dead_lettered_batches).inc();
        self.counter(&self.vecs.dead_lettered_envelopes)
            .inc_by(envelopes as u64);
    }

    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.counter(&self.vecs.attempts).get()
    }

    fn touch(&self) {
        for vec in [
            &self.vecs.attempts,
            &self.vecs.delivered_batches,
            &self.vecs.delivered_envelopes,
            &self.vecs.retries,
            &self.vecs.dead_lettered_batches,
            &self.vecs.dead_lettered_envelopes,
        ] {
            self.counter(vec);
        }
        self.vecs.latency.with_label_values(&self.labels());
    }

    fn snapshot(&self) -> SinkSnapshot {
        let latency = self.vecs.latency.with_label_values(&self.labels());
        SinkSnapshot {
            kind: self.kind,
            attempts: self.counter(&self.vecs.attempts).get(),
            delivered_batches: self.counter(&self.vecs.delivered_batches).get(),
            delivered_envelopes: self.counter(&self.vecs.delivered_envelopes).get(),
            retried: self.counter(&self.vecs.retries).get(),
            dead_lettered_batches: self.counter(&self.vecs.dead_lettered_batches).get(),
            dead_lettered_envelopes: self.counter(&self.vecs.dead_lettered_envelopes).get(),
            latency_count: latency.get_sample_count(),
            latency_sum_us: (latency.get_sample_sum() * 1_000_000.0).round() as u64,
        }
    }
}

/// Prometheus collectors for the whole pipeline, registered in a private [`Registry`].
pub struct MetricsRegistry {
    registry: Registry,
    ingested: IntCounterVec,
    rejected: IntCounterVec,
    sealed_batches: IntCounterVec,
    sealed_envelopes: IntCounterVec,
    dropped_batches: IntCounterVec,
    dropped_envelopes: IntCounterVec,
    buffer_full: IntCounter,
    pending_envelopes: IntGauge,
    sink_vecs: SinkVecs,
    sinks: Mutex<BTreeMap<SinkId, Arc<SinkCounters>>>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("sinks", &self.sinks)
            .finish_non_exhaustive()
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let vec = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let kind = &["kind"];
        let sink = &["sink", "kind"];

        let ingested = counter_vec(
            &registry,
            "ingested_envelopes_total",
            "Envelopes accepted by the ingest endpoint.",
            kind,
        )?;
        let rejected = counter_vec(
            &registry,
            "rejected_envelopes_total",
            "Envelopes rejected as invalid.",
            kind,
        )?;
        let sealed_batches = counter_vec(
            &registry,
            "sealed_batches_total",
            "Batches sealed by the buffer.",
            kind,
        )?;
        let sealed_envelopes = counter_vec(
            &registry,
            "sealed_envelopes_total",
            "Envelopes in sealed batches.",
            kind,
        )?;
        let dropped_batches = counter_vec(
            &registry,
            "dropped_batches_total",
            "Batches dropped without delivery or dead-lettering.",
            kind,
        )?;
        let dropped_envelopes = counter_vec(
            &registry,
            "dropped_envelopes_total",
            "Envelopes in dropped batches.",
            kind,
        )?;

        let sink_vecs = SinkVecs {
            attempts: counter_vec(
                &registry,
                "delivery_attempts_total",
                "Calls made to the sink.",
                sink,
            )?,
            delivered_batches: counter_vec(
                &registry,
                "delivered_batches_total",
                "Batches delivered to the sink.",
                sink,
            )?,
            delivered_envelopes: counter_vec(
                &registry,
                "delivered_envelopes_total",
                "Envelopes delivered to the sink.",
                sink,
            )?,
            retries: counter_vec(
                &registry,
                "retries_total",
                "Delivery retries after a failed attempt.",
                sink,
            )?,
            dead_lettered_batches: counter_vec(
                &registry,
                "dead_lettered_batches_total",
                "Batches abandoned to the dead-letter trail.",
                sink,
            )?,
            dead_lettered_envelopes: counter_vec(
                &registry,
                "dead_lettered_envelopes_total",
                "Envelopes abandoned to the dead-letter trail.",
                sink,
            )?,
            latency: {
                let histogram = HistogramVec::new(
                    HistogramOpts::new(
                        "delivery_latency_seconds",
                        "Time spent in delivery attempts.",
                    )
                    .namespace(NAMESPACE)
                    .buckets(LATENCY_BUCKETS.to_vec()),
                    sink,
                )?;
                registry.register(Box::new(histogram.clone()))?;
                histogram
            },
        };

        let buffer_full = IntCounter::with_opts(
            Opts::new(
                "buffer_full_total",
                "Submissions refused at the high-water mark.",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(buffer_full.clone()))?;

        let pending_envelopes = IntGauge::with_opts(
            Opts::new(
                "pending_envelopes",
                "Accepted envelopes not yet handed to their sinks.",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(pending_envelopes.clone()))?;

        let metrics = Self {
            registry,
            ingested,
            rejected,
            sealed_batches,
            sealed_envelopes,
            dropped_batches,
            dropped_envelopes,
            buffer_full,
            pending_envelopes,
            sink_vecs,
            sinks: Mutex::new(BTreeMap::new()),
        };
        metrics.touch_kinds();
        Ok(metrics)
    }

    fn kind_vecs(&self) -> [&IntCounterVec; 6] {
        [
            &self.ingested,
            &self.rejected,
            &self.sealed_batches,
            &self.sealed_envelopes,
            &self.dropped_batches,
            &self.dropped_envelopes,
        ]
    }

    /// Creates every per-kind series so idle kinds render as zero.
    fn touch_kinds(&self) {
        for kind in SignalKind::ALL {
            for vec in self.kind_vecs() {
                vec.with_label_values(&[kind.as_str()]);
            }
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_ingested(&self, kind: SignalKind, envelopes: usize) {
        self.ingested
            .with_label_values(&[kind.as_str()])
            .inc_by(envelopes as u64);
    }

    pub fn record_rejected(&self, kind: SignalKind) {
        self.rejected.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_buffer_full(&self) {
        self.buffer_full.inc();
    }

    pub fn record_sealed(&self, kind: SignalKind, envelopes: usize) {
        self.sealed_batches.with_label_values(&[kind.as_str()]).inc();
        self.sealed_envelopes
            .with_label_values(&[kind.as_str()])
            .inc_by(envelopes as u64);
    }

    /// Records a batch that left the pipeline without reaching either a sink or the dead-letter
    /// trail.
    pub fn record_dropped(&self, kind: SignalKind, envelopes: usize) {
        self.dropped_batches.with_label_values(&[kind.as_str()]).inc();
        self.dropped_envelopes
            .with_label_values(&[kind.as_str()])
            .inc_by(envelopes as u64);
    }

    pub fn set_pending(&self, envelopes: usize) {
        self.pending_envelopes
            .set(i64::try_from(envelopes).unwrap_or(i64::MAX));
    }

    /// Returns the counters of `sink_id`, creating them on first use.
    pub fn register_sink(&self, sink_id: &SinkId, kind: SignalKind) -> Arc<SinkCounters> {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let counters = sinks.entry(sink_id.clone()).or_insert_with(|| {
            Arc::new(SinkCounters {
                sink: sink_id.to_string(),
                kind,
                vecs: self.sink_vecs.clone(),
            })
        });
        counters.touch();
        Arc::clone(counters)
    }

    #[must_use]
    pub fn sink(&self, sink_id: &SinkId) -> Option<Arc<SinkCounters>> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sink_id)
            .cloned()
    }

    /// Zeroes every collector. Registered sinks stay registered.
    pub fn reset(&self) {
        for vec in self.kind_vecs() {
            vec.reset();
        }
        self.touch_kinds();
        self.buffer_full.reset();
        self.sink_vecs.reset();
        for counters in self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            counters.touch();
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let kinds = SignalKind::ALL
            .into_iter()
            .map(|kind| {
                let labels = [kind.as_str()];
                let snapshot = KindSnapshot {
                    ingested: self.ingested.with_label_values(&labels).get(),
                    rejected: self.rejected.with_label_values(&labels).get(),
                    batches_sealed: self.sealed_batches.with_label_values(&labels).get(),
                    envelopes_sealed: self.sealed_envelopes.with_label_values(&labels).get(),
                    batches_dropped: self.dropped_batches.with_label_values(&labels).get(),
                    envelopes_dropped: self.dropped_envelopes.with_label_values(&labels).get(),
                };
                (kind, snapshot)
            })
            .collect();
        let sinks = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, counters)| (id.clone(), counters.snapshot()))
            .collect();
        MetricsSnapshot {
            kinds,
            sinks,
            buffer_full: self.buffer_full.get(),
            pending_envelopes: 0,
        }
    }

    /// Renders every collector in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KindSnapshot {
    pub ingested: u64,
    pub rejected: u64,
    pub batches_sealed: u64,
    pub envelopes_sealed: u64,
    pub batches_dropped: u64,
    pub envelopes_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkSnapshot {
    pub kind: SignalKind,
    pub attempts: u64,
    pub delivered_batches: u64,
    pub delivered_envelopes: u64,
    pub retried: u64,
    pub dead_lettered_batches: u64,
    pub dead_lettered_envelopes: u64,
    pub latency_count: u64,
    pub latency_sum_us: u64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub kinds: BTreeMap<SignalKind, KindSnapshot>,
    pub sinks: BTreeMap<SinkId, SinkSnapshot>,
    pub buffer_full: u64,
    /// Filled in by the supervisor, which owns the pending counter.
    pub pending_envelopes: usize,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn kind(&self, kind: SignalKind) -> KindSnapshot {
        self.kinds.get(&kind).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn sink(&self, sink_id: &str) -> Option<&SinkSnapshot> {
        self.sinks.get(&SinkId::from(sink_id))
    }
}
