// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing entry point.
//!
//! Acceptance means the envelope is in the buffer, nothing more: delivery failures never surface
//! here. Producers only ever see the synchronous [`IngestError`] kinds.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

use crate::buffer::BatchingBuffer;
use crate::envelope::{Envelope, SignalKind, WireEnvelope};
use crate::errors::IngestError;
use crate::metrics::MetricsRegistry;

/// Acknowledgement for one accepted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AcceptedId(Uuid);

impl AcceptedId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AcceptedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub struct IngestEndpoint {
    buffer: Arc<BatchingBuffer>,
    metrics: Arc<MetricsRegistry>,
    accepting: AtomicBool,
    max_envelopes_per_request: usize,
}

impl IngestEndpoint {
    /// Creates a closed endpoint. Nothing is accepted until [`IngestEndpoint::open`] is called.
    #[must_use]
    pub fn new(
        buffer: Arc<BatchingBuffer>,
        metrics: Arc<MetricsRegistry>,
        max_envelopes_per_request: usize,
    ) -> Self {
        Self {
            buffer,
            metrics,
            accepting: AtomicBool::new(false),
            max_envelopes_per_request,
        }
    }

    pub fn open(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Refuses every later submission with [`IngestError::ShuttingDown`].
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn submit(&self, envelope: Envelope) -> Result<AcceptedId, IngestError> {
        let mut ids = self.submit_many(vec![envelope])?;
        ids.pop()
            .ok_or_else(|| IngestError::InvalidEnvelope("no envelope submitted".to_string()))
    }

    /// Accepts all of `envelopes` or none of them.
    ///
    /// Ids are returned in submission order. Envelopes of one kind keep their relative order in
    /// the buffer.
    pub fn submit_many(&self, envelopes: Vec<Envelope>) -> Result<Vec<AcceptedId>, IngestError> {
        if !self.is_accepting() {
            return Err(IngestError::ShuttingDown);
        }
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }
        if envelopes.len() > self.max_envelopes_per_request {
            return Err(IngestError::InvalidEnvelope(format!(
                "{} envelopes in one request, at most {} allowed",
                envelopes.len(),
                self.max_envelopes_per_request
            )));
        }
        for envelope in &envelopes {
            if let Err(e) = envelope.validate() {
                self.metrics.record_rejected(envelope.kind());
                return Err(e);
            }
        }
        if let Some(envelope) = envelopes.iter().find(|e| !self.buffer.handles(e.kind())) {
            self.metrics.record_rejected(envelope.kind());
            return Err(IngestError::UnknownKind(envelope.kind()));
        }

        let count = envelopes.len();
        let mut reservation = self.buffer.reserve(count).inspect_err(|_| {
            self.metrics.record_buffer_full();
        })?;

        let now = SystemTime::now();
        let mut by_kind: [Vec<Envelope>; 3] = Default::default();
        for mut envelope in envelopes {
            envelope.stamp(now);
            by_kind[envelope.kind().index()].push(envelope);
        }
        for (kind, group) in SignalKind::ALL.into_iter().zip(by_kind) {
            if group.is_empty() {
                continue;
            }
            let accepted = group.len();
            self.buffer.append(kind, group, &mut reservation)?;
            self.metrics.record_ingested(kind, accepted);
        }
        debug!(envelopes = count, "accepted envelopes");
        Ok((0..count).map(|_| AcceptedId::generate()).collect())
    }

    /// Parses wire envelopes and submits them as one request.
    pub fn submit_wire(&self, wire: Vec<WireEnvelope>) -> Result<Vec<AcceptedId>, IngestError> {
        if !self.is_accepting() {
            return Err(IngestError::ShuttingDown);
        }
        let envelopes = wire
            .into_iter()
            .map(Envelope::from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        self.submit_many(envelopes)
    }
}
