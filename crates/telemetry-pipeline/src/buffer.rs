// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching buffer: accumulates accepted envelopes into per-kind batches.
//!
//! Each configured kind owns a lane holding the open batch behind a narrow mutex that covers only
//! "append, or seal and swap in a fresh batch". Lanes never contend with each other. A batch is
//! sealed when it reaches `batch_max_size` or when its first envelope is older than
//! `batch_max_age`, whichever comes first; the age condition is enforced by one timer task per
//! lane so a partially filled batch is never held indefinitely.
//!
//! Sealed batches are pushed to the router over a bounded hand-off channel while the lane lock is
//! held, which keeps batches of one kind in creation order.
//!
//! Backpressure is a single high-water mark on the number of envelopes that were accepted but not
//! yet routed, across all kinds: envelopes in open batches and in sealed batches waiting on the
//! hand-off channel. The router releases a batch's envelopes before fanning it out, so a slow sink
//! only ever fills its own exporter queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::batch::Batch;
use crate::envelope::{Envelope, SignalKind};
use crate::errors::IngestError;
use crate::metrics::MetricsRegistry;

/// Count of accepted envelopes not yet handed to the router.
#[derive(Debug, Clone)]
pub struct PendingCounter {
    pending: Arc<AtomicUsize>,
    high_water_mark: usize,
}

impl PendingCounter {
    #[must_use]
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            high_water_mark,
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Reserves room for `count` envelopes, failing with `BufferFull` past the high-water mark.
    pub(crate) fn try_reserve(&self, count: usize) -> Result<Reservation, IngestError> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(count)
                    .filter(|total| *total <= self.high_water_mark)
            })
            .map(|_| Reservation {
                pending: self.clone(),
                remaining: count,
            })
            .map_err(|current| IngestError::BufferFull {
                pending: current,
                high_water_mark: self.high_water_mark,
            })
    }

    pub(crate) fn release(&self, count: usize) {
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::AcqRel);
        }
    }
}

/// Room reserved for envelopes on their way into a lane.
///
/// Envelopes that made it into a batch are committed; whatever is left is released on drop.
#[derive(Debug)]
pub(crate) struct Reservation {
    pending: PendingCounter,
    remaining: usize,
}

impl Reservation {
    pub(crate) fn commit(&mut self, count: usize) {
        self.remaining = self.remaining.saturating_sub(count);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pending.release(self.remaining);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_size: usize,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SealReason {
    Size,
    Age,
    Shutdown,
}

struct Lane {
    kind: SignalKind,
    policy: BatchPolicy,
    state: Mutex<LaneState>,
    first_envelope: Notify,
}

struct LaneState {
    open: Batch,
    next_sequence: u64,
    /// `None` once the lane is closed.
    handoff: Option<mpsc::Sender<Batch>>,
}

enum LaneDeadline {
    Closed,
    Idle,
    At(Instant),
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        // Lane state is left consistent at every point a panic could occur.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deadline(&self) -> LaneDeadline {
        let state = self.lock();
        if state.handoff.is_none() {
            LaneDeadline::Closed
        } else if state.open.is_empty() {
            LaneDeadline::Idle
        } else {
            LaneDeadline::At(state.open.created_at() + self.policy.max_age)
        }
    }
}

pub struct BatchingBuffer {
    lanes: HashMap<SignalKind, Lane>,
    pending: PendingCounter,
    metrics: Arc<MetricsRegistry>,
}

impl BatchingBuffer {
    /// Creates one lane per policy. Sealed batches go to `handoff`, which should be sized to the
    /// high-water mark so a hand-off never finds the channel full.
    pub fn new(
        policies: impl IntoIterator<Item = (SignalKind, BatchPolicy)>,
        pending: PendingCounter,
        handoff: mpsc::Sender<Batch>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let lanes = policies
            .into_iter()
            .map(|(kind, policy)| {
                let lane = Lane {
                    kind,
                    policy,
                    state: Mutex::new(LaneState {
                        open: Batch::tracked(kind, 0, pending.clone()),
                        next_sequence: 1,
                        handoff: Some(handoff.clone()),
                    }),
                    first_envelope: Notify::new(),
                };
                (kind, lane)
            })
            .collect();
        Self {
            lanes,
            pending,
            metrics,
        }
    }

    #[must_use]
    pub fn handles(&self, kind: SignalKind) -> bool {
        self.lanes.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = SignalKind> + '_ {
        self.lanes.keys().copied()
    }

    #[must_use]
    pub fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    /// Number of envelopes in the open batch of `kind`.
    #[must_use]
    pub fn open_len(&self, kind: SignalKind) -> usize {
        self.lanes.get(&kind).map_or(0, |lane| lane.lock().open.len())
    }

    pub(crate) fn reserve(&self, count: usize) -> Result<Reservation, IngestError> {
        self.pending.try_reserve(count)
    }

    /// Appends envelopes of one kind, in order, sealing as many batches as the size threshold
    /// requires.
    pub(crate) fn append(
        &self,
        kind: SignalKind,
        envelopes: Vec<Envelope>,
        reservation: &mut Reservation,
    ) -> Result<(), IngestError> {
        let lane = self.lanes.get(&kind).ok_or(IngestError::UnknownKind(kind))?;
        let mut state = lane.lock();
        if state.handoff.is_none() {
            return Err(IngestError::ShuttingDown);
        }
        for envelope in envelopes {
            let was_empty = state.open.is_empty();
            if let Err(rejected) = state.open.push(envelope) {
                return Err(IngestError::InvalidEnvelope(format!(
                    "{} envelope cannot join a {kind} batch",
                    rejected.kind()
                )));
            }
            reservation.commit(1);
            if was_empty {
                lane.first_envelope.notify_one();
            }
            if state.open.len() >= lane.policy.max_size {
                self.seal_locked(lane, &mut state, SealReason::Size);
            }
        }
        Ok(())
    }

    /// Seals the open batch of `kind` if it is non-empty and has reached its maximum age.
    pub fn seal_expired(&self, kind: SignalKind) -> bool {
        let Some(lane) = self.lanes.get(&kind) else {
            return false;
        };
        let mut state = lane.lock();
        if state.open.is_empty() || state.open.age() < lane.policy.max_age {
            return false;
        }
        self.seal_locked(lane, &mut state, SealReason::Age)
    }

    /// Refuses further appends, force-seals every open batch and releases the hand-off channel.
    ///
    /// Returns the number of batches sealed.
    pub fn close(&self) -> usize {
        let mut sealed = 0;
        for lane in self.lanes.values() {
            let mut state = lane.lock();
            if self.seal_locked(lane, &mut state, SealReason::Shutdown) {
                sealed += 1;
            }
            state.handoff = None;
            lane.first_envelope.notify_one();
        }
        sealed
    }

    fn seal_locked(&self, lane: &Lane, state: &mut LaneState, reason: SealReason) -> bool {
        if state.open.is_empty() {
            return false;
        }
        let fresh = Batch::tracked(lane.kind, state.next_sequence, self.pending.clone());
        state.next_sequence += 1;
        let mut batch = std::mem::replace(&mut state.open, fresh);
        batch.seal();

        self.metrics.record_sealed(lane.kind, batch.len());
        debug!(
            kind = %lane.kind,
            batch = batch.sequence(),
            envelopes = batch.len(),
            ?reason,
            "sealed batch"
        );

        let Some(handoff) = state.handoff.as_ref() else {
            error!(kind = %lane.kind, batch = batch.sequence(), "lane closed, dropping sealed batch");
            self.metrics.record_dropped(lane.kind, batch.len());
            return true;
        };
        if let Err(e) = handoff.try_send(batch) {
            let (cause, batch) = match e {
                mpsc::error::TrySendError::Full(batch) => ("hand-off channel full", batch),
                mpsc::error::TrySendError::Closed(batch) => ("router stopped", batch),
            };
            error!(
                kind = %lane.kind,
                batch = batch.sequence(),
                envelopes = batch.len(),
                "{cause}, dropping sealed batch"
            );
            self.metrics.record_dropped(lane.kind, batch.len());
        }
        true
    }

    /// Enforces the age threshold for one lane until the lane closes or `cancel` fires.
    pub async fn run_age_timer(self: Arc<Self>, kind: SignalKind, cancel: CancellationToken) {
        let Some(lane) = self.lanes.get(&kind) else {
            return;
        };
        debug!(%kind, "age timer started");
        loop {
            match lane.deadline() {
                LaneDeadline::Closed => break,
                LaneDeadline::Idle => {
                    tokio::select! {
                        _ = lane.first_envelope.notified() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                LaneDeadline::At(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            self.seal_expired(kind);
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!(%kind, "age timer stopped");
    }
}
