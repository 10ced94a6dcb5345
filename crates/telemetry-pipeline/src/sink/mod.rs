// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery capabilities, one per sink.
//!
//! The exporter only knows the [`Sink`] trait. New destinations are added by implementing it, and
//! [`build_sink`] maps a configured protocol to one of the built-in implementations.

use async_trait::async_trait;
use std::sync::Arc;

use crate::batch::Batch;
use crate::config::{SinkConfig, SinkProtocol};
use crate::errors::{SinkError, SupervisorError};

pub mod file;
pub mod http;
pub mod log;

pub use file::FileSink;
pub use http::HttpSink;
pub use log::LogSink;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one sealed batch. Called again with the same batch when a transient failure is
    /// retried.
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError>;
}

pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>, SupervisorError> {
    let sink: Arc<dyn Sink> = match config.protocol {
        SinkProtocol::Http => Arc::new(HttpSink::new(config)?),
        SinkProtocol::File => Arc::new(FileSink::new(config)?),
        SinkProtocol::Log => Arc::new(LogSink::new(config.id.clone())),
    };
    Ok(sink)
}

fn require_endpoint(config: &SinkConfig) -> Result<&str, SupervisorError> {
    config
        .endpoint
        .as_deref()
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| SupervisorError::Sink {
            sink_id: config.id.clone(),
            reason: "an endpoint is required".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_sink_requires_endpoint() {
        let config = SinkConfig::new("backend", SinkProtocol::Http);
        let Err(err) = build_sink(&config) else {
            panic!("http sink without endpoint should fail");
        };
        assert_eq!(
            err.to_string(),
            "failed to build sink `backend`: an endpoint is required"
        );
        assert!(build_sink(&SinkConfig::new("stdout", SinkProtocol::Log)).is_ok());
    }
}
