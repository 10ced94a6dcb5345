// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Terminal trail for batches the pipeline gave up on.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::batch::Batch;
use crate::config::SinkId;
use crate::envelope::{Envelope, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RetriesExhausted,
    CircuitOpen,
    Rejected,
    QueueFull,
    ShutdownDeadline,
    NoRoute,
}

impl DeadLetterReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Rejected => "rejected",
            Self::QueueFull => "queue_full",
            Self::ShutdownDeadline => "shutdown_deadline",
            Self::NoRoute => "no_route",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why and where a batch was abandoned. `sink_id` is `None` when the batch never reached a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub sink_id: Option<SinkId>,
    pub kind: SignalKind,
    pub batch_sequence: u64,
    pub envelope_count: usize,
    /// Delivery attempts made before giving up.
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
}

impl DeadLetter {
    #[must_use]
    pub fn new(sink_id: Option<SinkId>, batch: &Batch, reason: DeadLetterReason) -> Self {
        Self {
            sink_id,
            kind: batch.kind(),
            batch_sequence: batch.sequence(),
            envelope_count: batch.len(),
            attempts: 0,
            reason,
            last_error: None,
        }
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_last_error(mut self, last_error: Option<String>) -> Self {
        self.last_error = last_error;
        self
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records an abandoned batch. Must not fail: implementations log their own errors.
    async fn record(&self, dead_letter: &DeadLetter, batch: &Batch);
}

/// Writes each dead letter as a warning.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeadLetter;

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn record(&self, dead_letter: &DeadLetter, _batch: &Batch) {
        warn!(
            sink = dead_letter.sink_id.as_ref().map_or("-", SinkId::as_str),
            kind = %dead_letter.kind,
            batch = dead_letter.batch_sequence,
            envelopes = dead_letter.envelope_count,
            attempts = dead_letter.attempts,
            reason = %dead_letter.reason,
            last_error = dead_letter.last_error.as_deref().unwrap_or(""),
            "batch dead-lettered"
        );
    }
}

#[derive(Serialize)]
struct DeadLetterLine<'a> {
    #[serde(flatten)]
    dead_letter: &'a DeadLetter,
    envelopes: &'a [Envelope],
}

/// Appends each dead letter, envelopes included, as one JSON line.
#[derive(Debug)]
pub struct FileDeadLetter {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDeadLetter {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn record(&self, dead_letter: &DeadLetter, batch: &Batch) {
        let line = DeadLetterLine {
            dead_letter,
            envelopes: batch.envelopes(),
        };
        let mut bytes = match serde_json::to_vec(&line) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to serialize dead letter: {e}");
                return;
            }
        };
        bytes.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(&bytes).await {
            error!(
                path = %self.path.display(),
                batch = dead_letter.batch_sequence,
                "failed to write dead letter: {e}"
            );
            return;
        }
        if let Err(e) = file.flush().await {
            error!(path = %self.path.display(), "failed to flush dead-letter file: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::span;
    use tracing_test::traced_test;

    fn batch() -> Batch {
        let mut batch = Batch::new(SignalKind::Trace, 3);
        batch.push(Envelope::new(span("a"))).expect("open batch");
        batch.push(Envelope::new(span("b"))).expect("open batch");
        batch.seal();
        batch
    }

    #[tokio::test]
    #[traced_test]
    async fn test_log_dead_letter() {
        let batch = batch();
        let dead_letter = DeadLetter::new(
            Some(SinkId::from("backend")),
            &batch,
            DeadLetterReason::CircuitOpen,
        );
        LogDeadLetter.record(&dead_letter, &batch).await;
        assert!(logs_contain("batch dead-lettered"));
        assert!(logs_contain("reason=circuit_open"));
    }

    #[tokio::test]
    async fn test_file_dead_letter_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dead-letters.jsonl");
        let trail = FileDeadLetter::open(&path).await.expect("open");
        let batch = batch();

        let first = DeadLetter::new(
            Some(SinkId::from("backend")),
            &batch,
            DeadLetterReason::RetriesExhausted,
        )
        .with_attempts(4)
        .with_last_error(Some("connection refused".to_string()));
        trail.record(&first, &batch).await;
        trail
            .record(&DeadLetter::new(None, &batch, DeadLetterReason::NoRoute), &batch)
            .await;

        let contents = tokio::fs::read_to_string(&path).await.expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["sink_id"], "backend");
        assert_eq!(lines[0]["reason"], "retries_exhausted");
        assert_eq!(lines[0]["attempts"], 4);
        assert_eq!(lines[0]["batch_sequence"], 3);
        assert_eq!(lines[0]["envelopes"].as_array().map(Vec::len), Some(2));
        assert!(lines[1]["sink_id"].is_null());
        assert_eq!(lines[1]["reason"], "no_route");
    }
}
