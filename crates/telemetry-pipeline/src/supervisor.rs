// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle orchestration.
//!
//! Startup builds everything downstream first and opens the ingest endpoint last, so nothing can
//! be accepted before it can be delivered. Shutdown runs the same chain in the other direction:
//! refuse new envelopes, force-seal open batches, let the router hand off what is sealed and give
//! exporters until the shutdown deadline to finish. Whatever is still queued at the deadline is
//! dead-lettered, so every accepted envelope is either delivered or accounted for.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BatchPolicy, BatchingBuffer, PendingCounter};
use crate::config::{Config, SinkId};
use crate::dead_letter::{DeadLetterSink, FileDeadLetter, LogDeadLetter};
use crate::errors::SupervisorError;
use crate::exporter::{Exporter, ExporterConfig};
use crate::health::{HealthReport, LifecycleState, StatusBoard};
use crate::ingest::IngestEndpoint;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::router::Router;
use crate::server::IngestServer;
use crate::sink::{build_sink, Sink};

/// Outcome of [`Supervisor::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Open batches force-sealed when ingestion stopped.
    pub sealed_batches: usize,
    /// Whether exporters had to be stopped at the shutdown deadline.
    pub forced: bool,
    /// Envelopes never handed to the router. Zero unless the router stopped early.
    pub pending_envelopes: usize,
}

/// Assembles a pipeline from a [`Config`], with optional programmatic overrides.
pub struct SupervisorBuilder {
    config: Config,
    sinks: HashMap<SinkId, Arc<dyn Sink>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl SupervisorBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sinks: HashMap::new(),
            dead_letter: None,
            metrics: None,
        }
    }

    /// Uses `sink` for the configured sink `sink_id` instead of building one from its protocol.
    #[must_use]
    pub fn with_sink(mut self, sink_id: impl Into<SinkId>, sink: Arc<dyn Sink>) -> Self {
        self.sinks.insert(sink_id.into(), sink);
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn start(mut self) -> Result<Supervisor, SupervisorError> {
        let config = self.config;
        config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(MetricsRegistry::new().map_err(SupervisorError::Metrics)?),
        };
        let dead_letter: Arc<dyn DeadLetterSink> = match (self.dead_letter, &config.dead_letter.path) {
            (Some(dead_letter), _) => dead_letter,
            (None, Some(path)) => Arc::new(
                FileDeadLetter::open(path)
                    .await
                    .map_err(SupervisorError::DeadLetter)?,
            ),
            (None, None) => Arc::new(LogDeadLetter),
        };

        let high_water_mark = config.buffer.high_water_mark;
        let pending = PendingCounter::new(high_water_mark);
        let force_stop = CancellationToken::new();
        let mut board = StatusBoard::new(pending.clone(), Arc::clone(&metrics));
        let mut router = Router::new(Arc::clone(&dead_letter));
        let mut exporters = Vec::new();

        for (kind, pipeline) in &config.pipelines {
            for sink_config in &pipeline.sinks {
                let sink = match self.sinks.remove(&sink_config.id) {
                    Some(sink) => sink,
                    None => build_sink(sink_config)?,
                };
                let (exporter, queue, status) = Exporter::new(
                    ExporterConfig {
                        sink_id: sink_config.id.clone(),
                        kind: *kind,
                        retry: sink_config.retry.clone(),
                        attempt_timeout: sink_config.timeout,
                        queue_capacity: sink_config.queue_capacity,
                    },
                    sink,
                    Arc::clone(&dead_letter),
                    &metrics,
                    force_stop.clone(),
                );
                board.watch_exporter(&queue, status);
                router.add_route(*kind, queue);
                exporters.push(exporter);
            }
        }
        for sink_id in self.sinks.keys() {
            warn!(sink = %sink_id, "ignoring sink override with no matching configured sink");
        }

        let (handoff_tx, handoff_rx) = mpsc::channel(high_water_mark);
        let buffer = Arc::new(BatchingBuffer::new(
            config.pipelines.iter().map(|(kind, pipeline)| {
                (
                    *kind,
                    BatchPolicy {
                        max_size: pipeline.batch_max_size,
                        max_age: pipeline.batch_max_age,
                    },
                )
            }),
            pending.clone(),
            handoff_tx,
            Arc::clone(&metrics),
        ));
        let ingest = Arc::new(IngestEndpoint::new(
            Arc::clone(&buffer),
            Arc::clone(&metrics),
            config.ingest.max_envelopes_per_request,
        ));
        let board = Arc::new(board);

        let server = match config.ingest.listen_address {
            Some(address) => Some(
                IngestServer::bind(
                    address,
                    Arc::clone(&ingest),
                    Arc::clone(&board),
                    config.ingest.max_request_bytes,
                )
                .await
                .map_err(|source| SupervisorError::Bind { address, source })?,
            ),
            None => None,
        };

        // Nothing below can fail: start the workers downstream first.
        let mut tasks = JoinSet::new();
        for exporter in exporters {
            tasks.spawn(exporter.run());
        }
        tasks.spawn(router.run(handoff_rx));

        let timer_cancel = CancellationToken::new();
        let mut timers = JoinSet::new();
        for kind in buffer.kinds() {
            timers.spawn(Arc::clone(&buffer).run_age_timer(kind, timer_cancel.clone()));
        }

        ingest.open();
        let mut local_addr = None;
        let server = server.map(|server| {
            local_addr = server.local_addr().ok();
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(server.serve(cancel.clone()));
            (cancel, handle)
        });

        board.set_state(LifecycleState::Running);
        info!(
            pipelines = config.pipelines.len(),
            high_water_mark,
            listen_address = ?local_addr,
            "telemetry pipeline started"
        );

        Ok(Supervisor {
            ingest,
            buffer,
            board,
            metrics,
            pending,
            local_addr,
            server,
            timer_cancel,
            timers,
            tasks,
            force_stop,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

pub struct Supervisor {
    ingest: Arc<IngestEndpoint>,
    buffer: Arc<BatchingBuffer>,
    board: Arc<StatusBoard>,
    metrics: Arc<MetricsRegistry>,
    pending: PendingCounter,
    local_addr: Option<SocketAddr>,
    server: Option<(CancellationToken, JoinHandle<std::io::Result<()>>)>,
    timer_cancel: CancellationToken,
    timers: JoinSet<()>,
    tasks: JoinSet<()>,
    force_stop: CancellationToken,
    shutdown_timeout: Duration,
}

impl Supervisor {
    #[must_use]
    pub fn builder(config: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(config)
    }

    /// Starts a pipeline with the sinks and dead-letter trail described by `config`.
    pub async fn start(config: Config) -> Result<Self, SupervisorError> {
        SupervisorBuilder::new(config).start().await
    }

    #[must_use]
    pub fn ingest(&self) -> &Arc<IngestEndpoint> {
        &self.ingest
    }

    /// Address of the HTTP listener, when one is configured.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.board.state()
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.board.health()
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.board.metrics()
    }

    /// Drains the pipeline and stops every task.
    pub async fn shutdown(mut self) -> ShutdownReport {
        info!("shutting down telemetry pipeline");
        self.board.set_state(LifecycleState::Draining);
        self.ingest.close();

        if let Some((cancel, handle)) = self.server.take() {
            cancel.cancel();
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("ingest listener failed: {e}"),
                Err(e) => error!("ingest listener task failed: {e}"),
            }
        }

        let sealed_batches = self.buffer.close();
        debug!(sealed_batches, "force-sealed open batches");
        self.timer_cancel.cancel();
        while self.timers.join_next().await.is_some() {}

        let deadline = Instant::now() + self.shutdown_timeout;
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("pipeline task failed: {e}");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                timeout_ms = self.shutdown_timeout.as_millis(),
                "shutdown deadline reached, dead-lettering undelivered batches"
            );
            self.force_stop.cancel();
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    error!("pipeline task failed: {e}");
                }
            }
        }

        self.board.set_state(LifecycleState::Stopped);
        let report = ShutdownReport {
            sealed_batches,
            forced: !drained,
            pending_envelopes: self.pending.current(),
        };
        info!(
            sealed_batches = report.sealed_batches,
            forced = report.forced,
            pending_envelopes = report.pending_envelopes,
            "telemetry pipeline stopped"
        );
        report
    }
}
