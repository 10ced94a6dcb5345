// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::time::Duration;
use tokio::time::Instant;

use crate::buffer::PendingCounter;
use crate::envelope::{Envelope, SignalKind};

/// An ordered group of envelopes of one kind.
///
/// A batch is open while the buffer appends to it and sealed once it reaches its size or age
/// threshold. After sealing it is shared read-only between the exporters of its pipeline. A batch
/// built by the buffer carries pending accounting until it is routed or dropped.
#[derive(Debug)]
pub struct Batch {
    kind: SignalKind,
    sequence: u64,
    envelopes: Vec<Envelope>,
    created_at: Instant,
    sealed: bool,
    pending: Option<PendingCounter>,
}

impl Batch {
    #[must_use]
    pub fn new(kind: SignalKind, sequence: u64) -> Self {
        Self {
            kind,
            sequence,
            envelopes: Vec::new(),
            created_at: Instant::now(),
            sealed: false,
            pending: None,
        }
    }

    pub(crate) fn tracked(kind: SignalKind, sequence: u64, pending: PendingCounter) -> Self {
        Self {
            kind,
            sequence,
            envelopes: Vec::new(),
            created_at: Instant::now(),
            sealed: false,
            pending: Some(pending),
        }
    }

    /// Appends an envelope, handing it back if the batch is sealed or of another kind.
    ///
    /// The age clock starts with the first envelope.
    pub fn push(&mut self, envelope: Envelope) -> Result<(), Envelope> {
        if self.sealed || envelope.kind() != self.kind {
            return Err(envelope);
        }
        if self.envelopes.is_empty() {
            self.created_at = Instant::now();
        }
        self.envelopes.push(envelope);
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Position of this batch among the batches of its kind, in creation order.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Releases this batch's envelopes from the pending count. Later calls do nothing.
    pub(crate) fn release_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.release(self.envelopes.len());
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.release_pending();
    }
}

impl Serialize for Batch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Batch", 3)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("sequence", &self.sequence)?;
        state.serialize_field("envelopes", &self.envelopes)?;
        state.end()
    }
}
