// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::batch::Batch;
use crate::config::{SinkConfig, SinkId};
use crate::errors::{SinkError, SupervisorError};
use crate::sink::{require_endpoint, Sink};

/// Appends one JSON line per envelope to a local file.
///
/// The file is opened on first delivery and reopened after a write error, so a file that was
/// rotated or removed is recreated on the next attempt. A failed append is truncated away before
/// the error is returned, so a retried batch is written exactly once.
#[derive(Debug)]
pub struct FileSink {
    sink_id: SinkId,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SupervisorError> {
        let path = PathBuf::from(require_endpoint(config)?);
        Ok(Self::with_path(config.id.clone(), path))
    }

    #[must_use]
    pub fn with_path(sink_id: SinkId, path: PathBuf) -> Self {
        Self {
            sink_id,
            path,
            file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_lines(batch: &Batch) -> Result<Vec<u8>, SinkError> {
    let mut buf = Vec::new();
    for envelope in batch.envelopes() {
        serde_json::to_writer(&mut buf, envelope)
            .map_err(|e| SinkError::Rejected(format!("failed to serialize envelope: {e}")))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

async fn append(file: &mut File, lines: &[u8]) -> io::Result<()> {
    file.write_all(lines).await?;
    file.flush().await
}

/// Drops whatever a failed append left past `len`.
async fn truncate_to(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len).await
}

#[async_trait]
impl Sink for FileSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        let lines = encode_lines(batch)?;
        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    SinkError::Transient(format!("failed to open {}: {e}", self.path.display()))
                })?,
        };

        let start = file.metadata().await.map_err(|e| {
            SinkError::Transient(format!("failed to stat {}: {e}", self.path.display()))
        })?;
        if let Err(e) = append(&mut file, &lines).await {
            if let Err(truncate) = truncate_to(&file, start.len()).await {
                error!(
                    sink = %self.sink_id,
                    path = %self.path.display(),
                    "failed to roll back partial append: {truncate}"
                );
            }
            return Err(SinkError::Transient(format!(
                "failed to write {}: {e}",
                self.path.display()
            )));
        }
        *guard = Some(file);
        debug!(
            sink = %self.sink_id,
            batch = batch.sequence(),
            envelopes = batch.len(),
            "appended batch"
        );
        Ok(())
    }
}
