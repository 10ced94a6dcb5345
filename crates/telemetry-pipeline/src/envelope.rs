// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope model: the canonical in-memory representation of one telemetry unit.
//!
//! An [`Envelope`] wraps exactly one [`Payload`] (a span, a metric sample or a log record), the
//! resource attributes describing the producing service and a wall-clock timestamp. The signal
//! kind is derived from the payload variant, so an envelope whose kind and payload disagree cannot
//! be constructed.
//!
//! Producers talking to the network listener send [`WireEnvelope`]s, which are converted with
//! [`Envelope::from_wire`]. Both paths end in [`Envelope::validate`].

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::IngestError;

const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Trace,
    Metric,
    Log,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Trace, SignalKind::Metric, SignalKind::Log];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Metric => "metric",
            Self::Log => "log",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Trace => 0,
            Self::Metric => 1,
            Self::Log => 2,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "metric" => Ok(Self::Metric),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown signal kind `{other}`")),
        }
    }
}

/// A scalar attribute value. Nested structures are rejected at ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;
        impl Visitor<'_> for ScalarVisitor {
            type Value = AttributeValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a scalar attribute value (string, number or bool)")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(AttributeValue::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(AttributeValue::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(match i64::try_from(v) {
                    Ok(v) => AttributeValue::Int(v),
                    Err(_) => AttributeValue::Double(v as f64),
                })
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(AttributeValue::Double(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(AttributeValue::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(AttributeValue::String(v))
            }
        }
        deserializer.deserialize_any(ScalarVisitor)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    #[default]
    Gauge,
    Sum,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub metric_type: MetricType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub body: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Span(Span),
    Metric(MetricSample),
    Log(LogRecord),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Span(_) => SignalKind::Trace,
            Self::Metric(_) => SignalKind::Metric,
            Self::Log(_) => SignalKind::Log,
        }
    }
}

impl From<Span> for Payload {
    fn from(span: Span) -> Self {
        Self::Span(span)
    }
}

impl From<MetricSample> for Payload {
    fn from(sample: MetricSample) -> Self {
        Self::Metric(sample)
    }
}

impl From<LogRecord> for Payload {
    fn from(record: LogRecord) -> Self {
        Self::Log(record)
    }
}

/// One telemetry unit plus its metadata.
///
/// Resource attributes are shared behind an `Arc` and never mutated once the envelope is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    kind: SignalKind,
    #[serde(
        rename = "timestamp_unix_nano",
        serialize_with = "serialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    timestamp: Option<SystemTime>,
    #[serde(skip_serializing_if = "attributes_empty")]
    resource_attributes: Arc<Attributes>,
    payload: Payload,
}

impl Envelope {
    pub fn new(payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            kind: payload.kind(),
            timestamp: None,
            resource_attributes: Arc::new(Attributes::new()),
            payload,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_resource_attributes(mut self, attributes: Attributes) -> Self {
        self.resource_attributes = Arc::new(attributes);
        self
    }

    #[must_use]
    pub fn with_resource_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        Arc::make_mut(&mut self.resource_attributes).insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    #[must_use]
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    #[must_use]
    pub fn timestamp_unix_nano(&self) -> Option<u64> {
        self.timestamp.map(unix_nanos)
    }

    #[must_use]
    pub fn resource_attributes(&self) -> &Attributes {
        &self.resource_attributes
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Sets the timestamp to `now` unless the producer already supplied one.
    pub(crate) fn stamp(&mut self, now: SystemTime) {
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }

    /// Checks the payload against the shape required by its kind.
    pub fn validate(&self) -> Result<(), IngestError> {
        match &self.payload {
            Payload::Span(span) => validate_span(span),
            Payload::Metric(sample) => validate_metric(sample),
            Payload::Log(record) => validate_log(record),
        }
    }

    /// Converts a wire envelope into a validated envelope.
    pub fn from_wire(wire: WireEnvelope) -> Result<Self, IngestError> {
        let kind = SignalKind::from_str(&wire.kind).map_err(IngestError::InvalidEnvelope)?;
        let resource_attributes = parse_attributes(&wire.resource_attributes)?;
        let payload = match kind {
            SignalKind::Trace => serde_json::from_value::<Span>(wire.payload).map(Payload::Span),
            SignalKind::Metric => {
                serde_json::from_value::<MetricSample>(wire.payload).map(Payload::Metric)
            }
            SignalKind::Log => serde_json::from_value::<LogRecord>(wire.payload).map(Payload::Log),
        }
        .map_err(|e| IngestError::InvalidEnvelope(format!("{kind} payload: {e}")))?;

        let mut envelope = Envelope::new(payload).with_resource_attributes(resource_attributes);
        if let Some(nanos) = wire.timestamp_unix_nano {
            envelope.timestamp = Some(UNIX_EPOCH + Duration::from_nanos(nanos));
        }
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Envelope as sent by producers over the network.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEnvelope {
    pub kind: String,
    #[serde(default)]
    pub timestamp_unix_nano: Option<u64>,
    #[serde(default)]
    pub resource_attributes: serde_json::Map<String, serde_json::Value>,
    pub payload: serde_json::Value,
}

fn parse_attributes(
    raw: &serde_json::Map<String, serde_json::Value>,
) -> Result<Attributes, IngestError> {
    raw.iter()
        .map(|(key, value)| {
            AttributeValue::deserialize(value)
                .map(|value| (key.clone(), value))
                .map_err(|_| {
                    IngestError::InvalidEnvelope(format!(
                        "resource attribute `{key}` must be a string, number or bool"
                    ))
                })
        })
        .collect()
}

fn validate_span(span: &Span) -> Result<(), IngestError> {
    validate_hex_id("trace_id", &span.trace_id, TRACE_ID_HEX_LEN)?;
    validate_hex_id("span_id", &span.span_id, SPAN_ID_HEX_LEN)?;
    if let Some(parent) = &span.parent_span_id {
        validate_hex_id("parent_span_id", parent, SPAN_ID_HEX_LEN)?;
    }
    if span.name.trim().is_empty() {
        return Err(IngestError::InvalidEnvelope(
            "span name must not be empty".to_string(),
        ));
    }
    if span.end_time_unix_nano < span.start_time_unix_nano {
        return Err(IngestError::InvalidEnvelope(format!(
            "span `{}` ends before it starts",
            span.name
        )));
    }
    Ok(())
}

fn validate_metric(sample: &MetricSample) -> Result<(), IngestError> {
    if sample.name.trim().is_empty() {
        return Err(IngestError::InvalidEnvelope(
            "metric name must not be empty".to_string(),
        ));
    }
    if !sample.value.is_finite() {
        return Err(IngestError::InvalidEnvelope(format!(
            "metric `{}` has a non-finite value",
            sample.name
        )));
    }
    Ok(())
}

fn validate_log(record: &LogRecord) -> Result<(), IngestError> {
    if let Some(trace_id) = &record.trace_id {
        validate_hex_id("trace_id", trace_id, TRACE_ID_HEX_LEN)?;
    }
    if let Some(span_id) = &record.span_id {
        validate_hex_id("span_id", span_id, SPAN_ID_HEX_LEN)?;
    }
    Ok(())
}

fn validate_hex_id(field: &str, id: &str, expected_len: usize) -> Result<(), IngestError> {
    if id.len() != expected_len || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IngestError::InvalidEnvelope(format!(
            "{field} must be {expected_len} hex characters, got `{id}`"
        )));
    }
    if id.bytes().all(|b| b == b'0') {
        return Err(IngestError::InvalidEnvelope(format!(
            "{field} must not be all zeros"
        )));
    }
    Ok(())
}

fn unix_nanos(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn serialize_timestamp<S: Serializer>(
    timestamp: &Option<SystemTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match timestamp {
        Some(ts) => serializer.serialize_u64(unix_nanos(*ts)),
        None => serializer.serialize_none(),
    }
}

fn attributes_empty(attributes: &Arc<Attributes>) -> bool {
    attributes.is_empty()
}
