// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tracing::info;

use crate::batch::Batch;
use crate::config::SinkId;
use crate::errors::SinkError;
use crate::sink::Sink;

/// Writes a one-line summary of each batch. Never fails.
#[derive(Debug, Clone)]
pub struct LogSink {
    sink_id: SinkId,
}

impl LogSink {
    #[must_use]
    pub fn new(sink_id: SinkId) -> Self {
        Self { sink_id }
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        info!(
            sink = %self.sink_id,
            kind = %batch.kind(),
            batch = batch.sequence(),
            envelopes = batch.len(),
            "delivered batch"
        );
        Ok(())
    }
}
