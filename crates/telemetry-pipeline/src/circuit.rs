// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Batches are dead-lettered without a delivery attempt.
    Open,
    /// Cool-down elapsed; the next batch is a trial.
    HalfOpen,
}

impl CircuitState {
    /// State of a circuit that is open until `open_until`, as seen at `now`.
    #[must_use]
    pub fn at(open_until: Option<Instant>, now: Instant) -> Self {
        match open_until {
            None => Self::Closed,
            Some(until) if now < until => Self::Open,
            Some(_) => Self::HalfOpen,
        }
    }
}

/// Consecutive-failure circuit breaker owned by a single exporter.
///
/// A failure is a batch that could not be delivered, not a single attempt. After
/// `failure_threshold` of them in a row the circuit opens for `cooldown`. The first batch after the
/// cool-down is delivered normally: success closes the circuit, failure opens it again.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    #[must_use]
    pub fn state(&self, now: Instant) -> CircuitState {
        CircuitState::at(self.open_until, now)
    }

    #[must_use]
    pub fn allows_delivery(&self, now: Instant) -> bool {
        self.state(now) != CircuitState::Open
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    /// Returns `true` if this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let trial_failed = self.open_until.is_some_and(|until| now >= until);
        if trial_failed || self.consecutive_failures >= self.failure_threshold {
            self.open_until = Some(now + self.cooldown);
            return true;
        }
        false
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }
}
