// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static engine configuration, loaded once at startup.
//!
//! The document is YAML, read through figment and overridden by environment variables prefixed
//! with `TELEMETRY_PIPELINE_` (nested keys separated by `__`):
//!
//! ```yaml
//! buffer:
//!   high_water_mark: 10000
//! pipelines:
//!   trace:
//!     batch_max_size: 100
//!     batch_max_age: 5s
//!     sinks:
//!       - id: jaeger
//!         protocol: http
//!         endpoint: http://jaeger:4318/v1/traces
//!         retry:
//!           max_retries: 3
//!           backoff_base: 100ms
//! ```
//!
//! Any error here is fatal: the engine never runs partially configured.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::envelope::SignalKind;
use crate::errors::ConfigError;

pub const ENV_PREFIX: &str = "TELEMETRY_PIPELINE_";

const DEFAULT_BATCH_MAX_SIZE: usize = 512;
const DEFAULT_BATCH_MAX_AGE: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);
const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_SINK_QUEUE_CAPACITY: usize = 64;
const DEFAULT_HIGH_WATER_MARK: usize = 10_000;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_ENVELOPES_PER_REQUEST: usize = 1000;

/// Unique name of a sink across all pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SinkId(String);

impl SinkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestConfig,
    pub buffer: BufferConfig,
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
    pub dead_letter: DeadLetterConfig,
    pub pipelines: BTreeMap<SignalKind, PipelineConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            buffer: BufferConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            dead_letter: DeadLetterConfig::default(),
            pipelines: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// When unset no network listener is started and envelopes can only be submitted in-process.
    pub listen_address: Option<SocketAddr>,
    pub max_request_bytes: usize,
    pub max_envelopes_per_request: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            max_envelopes_per_request: DEFAULT_MAX_ENVELOPES_PER_REQUEST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of accepted envelopes not yet delivered or dead-lettered.
    pub high_water_mark: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// JSON-lines file receiving dead-lettered batches. Defaults to the log trail.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_max_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub batch_max_age: Duration,
    pub sinks: Vec<SinkConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_max_age: DEFAULT_BATCH_MAX_AGE,
            sinks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkProtocol {
    Http,
    File,
    Log,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkConfig {
    pub id: SinkId,
    pub protocol: SinkProtocol,
    /// URL for `http` sinks, file path for `file` sinks, ignored by `log` sinks.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Upper bound on a single delivery attempt.
    #[serde(
        default = "default_sink_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
    /// zstd level applied to `http` request bodies.
    #[serde(default)]
    pub compression_level: Option<i32>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Batches waiting for this sink. Batches routed to a full queue are dead-lettered.
    #[serde(default = "default_sink_queue_capacity")]
    pub queue_capacity: usize,
}

impl SinkConfig {
    pub fn new(id: impl Into<String>, protocol: SinkProtocol) -> Self {
        Self {
            id: SinkId::new(id),
            protocol,
            endpoint: None,
            timeout: DEFAULT_SINK_TIMEOUT,
            compression_level: None,
            headers: BTreeMap::new(),
            retry: RetryPolicy::default(),
            queue_capacity: DEFAULT_SINK_QUEUE_CAPACITY,
        }
    }
}

/// Per-sink retry, backoff and circuit-breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub backoff_base: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub backoff_cap: Duration,
    pub circuit_failure_threshold: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub circuit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            circuit_failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            circuit_cooldown: DEFAULT_CIRCUIT_COOLDOWN,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `backoff_base * 2^attempt`, capped at `backoff_cap`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

impl Config {
    /// Reads the YAML document at `path`, applies environment overrides and validates the result.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        Self::extract(Figment::new().merge(Yaml::file(path)))
    }

    /// Same as [`Config::load`] for an in-memory document.
    pub fn from_yaml_str(document: &str) -> Result<Config, ConfigError> {
        Self::extract(Figment::new().merge(Yaml::string(document)))
    }

    fn extract(figment: Figment) -> Result<Config, ConfigError> {
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipelines.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one pipeline must be configured".to_string(),
            ));
        }
        if self.buffer.high_water_mark == 0 {
            return Err(ConfigError::Invalid(
                "buffer.high_water_mark must be greater than 0".to_string(),
            ));
        }
        if self.ingest.max_envelopes_per_request == 0 {
            return Err(ConfigError::Invalid(
                "ingest.max_envelopes_per_request must be greater than 0".to_string(),
            ));
        }

        let mut sink_ids = HashSet::new();
        for (kind, pipeline) in &self.pipelines {
            if pipeline.batch_max_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pipelines.{kind}.batch_max_size must be greater than 0"
                )));
            }
            if pipeline.batch_max_age.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "pipelines.{kind}.batch_max_age must be greater than 0"
                )));
            }
            if pipeline.sinks.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pipelines.{kind} has no sinks"
                )));
            }
            for sink in &pipeline.sinks {
                if !sink_ids.insert(sink.id.clone()) {
                    return Err(ConfigError::Invalid(format!(
                        "sink id `{}` is used more than once",
                        sink.id
                    )));
                }
                validate_sink(kind, sink)?;
            }
        }
        Ok(())
    }
}

fn validate_sink(kind: &SignalKind, sink: &SinkConfig) -> Result<(), ConfigError> {
    let prefix = format!("pipelines.{kind}.sinks.{}", sink.id);
    let retry = &sink.retry;
    if retry.circuit_failure_threshold == 0 {
        return Err(ConfigError::Invalid(format!(
            "{prefix}: circuit_failure_threshold must be greater than 0"
        )));
    }
    if retry.backoff_base > retry.backoff_cap {
        return Err(ConfigError::Invalid(format!(
            "{prefix}: backoff_base must not exceed backoff_cap"
        )));
    }
    if sink.queue_capacity == 0 {
        return Err(ConfigError::Invalid(format!(
            "{prefix}: queue_capacity must be greater than 0"
        )));
    }
    if sink.timeout.is_zero() {
        return Err(ConfigError::Invalid(format!(
            "{prefix}: timeout must be greater than 0"
        )));
    }
    match sink.protocol {
        SinkProtocol::Http => match sink.endpoint.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "{prefix}: http sinks need an http:// or https:// endpoint"
                )))
            }
        },
        SinkProtocol::File => {
            if sink.endpoint.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid(format!(
                    "{prefix}: file sinks need a path endpoint"
                )));
            }
        }
        SinkProtocol::Log => {}
    }
    if let Some(level) = sink.compression_level {
        if !zstd::compression_level_range().contains(&level) {
            return Err(ConfigError::Invalid(format!(
                "{prefix}: compression_level {level} is out of range"
            )));
        }
    }
    Ok(())
}

fn default_sink_timeout() -> Duration {
    DEFAULT_SINK_TIMEOUT
}

fn default_sink_queue_capacity() -> usize {
    DEFAULT_SINK_QUEUE_CAPACITY
}

/// Reads a humantime duration such as `"250ms"` or `"1m 30s"`, or a bare number of milliseconds.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationValue {
        Millis(u64),
        Text(#[serde(with = "humantime_serde")] Duration),
    }

    Ok(match DurationValue::deserialize(deserializer)? {
        DurationValue::Millis(millis) => Duration::from_millis(millis),
        DurationValue::Text(duration) => duration,
    })
}
