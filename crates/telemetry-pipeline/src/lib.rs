// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry pipeline engine.
//!
//! Producers push envelopes (spans, metric samples, log records) to the [`ingest`] endpoint,
//! which validates them and appends them to the per-kind [`buffer`]. Sealed batches are handed to
//! the [`router`], which fans each batch out to one [`exporter`] per configured sink. Exporters
//! retry independently, trip a circuit breaker on persistent failure and send anything they give
//! up on to the [`dead_letter`] trail. The [`supervisor`] wires everything together and owns the
//! drain-on-shutdown sequence.
//!
//! ```text
//!   Producer ──> IngestEndpoint ──> BatchingBuffer ──> Router ──┬──> Exporter(a) ──> Sink(a)
//!                                   (per-kind lanes)            ├──> Exporter(b) ──> Sink(b)
//!                                                               └──> ...
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod buffer;
pub mod circuit;
pub mod config;
pub mod dead_letter;
pub mod envelope;
pub mod errors;
pub mod exporter;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod router;
pub mod server;
pub mod sink;
pub mod supervisor;

pub use batch::Batch;
pub use config::{Config, PipelineConfig, RetryPolicy, SinkConfig, SinkId, SinkProtocol};
pub use envelope::{AttributeValue, Envelope, Payload, SignalKind};
pub use errors::{ConfigError, IngestError, SinkError, SupervisorError};
pub use ingest::{AcceptedId, IngestEndpoint};
pub use supervisor::{ShutdownReport, Supervisor};
