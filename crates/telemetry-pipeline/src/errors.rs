// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use crate::config::SinkId;
use crate::envelope::SignalKind;

/// Errors surfaced synchronously to producers by the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    /// The envelope is malformed. Retrying the same envelope will fail again.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// No pipeline is configured for the envelope's signal kind.
    #[error("no pipeline configured for signal kind `{0}`")]
    UnknownKind(SignalKind),

    /// The backpressure high-water mark was reached. Producers may retry after a delay.
    #[error("buffer full: {pending} envelopes pending, high-water mark is {high_water_mark}")]
    BufferFull {
        pending: usize,
        high_water_mark: usize,
    },

    /// The engine is draining and no longer accepts envelopes.
    #[error("ingest endpoint is shutting down")]
    ShuttingDown,
}

impl IngestError {
    /// Whether the producer may resubmit the same envelopes later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BufferFull { .. } | Self::ShuttingDown)
    }
}

/// Configuration problems. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Outcome of a failed `Sink::deliver` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The sink could not be reached or asked us to come back later.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The sink received the batch and refused it. Resending it cannot succeed.
    #[error("batch rejected by sink: {0}")]
    Rejected(String),
}

impl SinkError {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Rejected(msg) => msg,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind ingest listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build sink `{sink_id}`: {reason}")]
    Sink { sink_id: SinkId, reason: String },

    #[error("failed to open dead-letter trail: {0}")]
    DeadLetter(#[source] std::io::Error),

    #[error("failed to register pipeline metrics: {0}")]
    Metrics(#[source] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = IngestError::BufferFull {
            pending: 10,
            high_water_mark: 10,
        };
        assert_eq!(
            error.to_string(),
            "buffer full: 10 envelopes pending, high-water mark is 10"
        );
        assert_eq!(
            IngestError::UnknownKind(SignalKind::Log).to_string(),
            "no pipeline configured for signal kind `log`"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!IngestError::InvalidEnvelope("x".into()).is_retryable());
        assert!(!IngestError::UnknownKind(SignalKind::Trace).is_retryable());
        assert!(IngestError::ShuttingDown.is_retryable());
        assert!(IngestError::BufferFull {
            pending: 1,
            high_water_mark: 1
        }
        .is_retryable());
    }
}
