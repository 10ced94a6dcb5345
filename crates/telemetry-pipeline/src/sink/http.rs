// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use crate::batch::Batch;
use crate::config::{SinkConfig, SinkId};
use crate::errors::{SinkError, SupervisorError};
use crate::sink::{require_endpoint, Sink};

/// POSTs each batch as a JSON document, optionally zstd-compressed.
#[derive(Debug, Clone)]
pub struct HttpSink {
    sink_id: SinkId,
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SupervisorError> {
        let invalid = |reason: String| SupervisorError::Sink {
            sink_id: config.id.clone(),
            reason,
        };
        let endpoint = require_endpoint(config)?.to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| invalid(format!("invalid header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid(format!("invalid value for header `{name}`: {e}")))?;
            headers.insert(name, value);
        }

        // The exporter bounds each attempt; the client timeout only backs it up.
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| invalid(format!("failed to build http client: {e}")))?;

        Ok(Self {
            sink_id: config.id.clone(),
            client,
            endpoint,
            headers,
            compression_level: config.compression_level,
        })
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, SinkError> {
        let body = serde_json::to_vec(batch)
            .map_err(|e| SinkError::Rejected(format!("failed to serialize batch: {e}")))?;
        match self.compression_level {
            Some(level) => zstd::encode_all(body.as_slice(), level)
                .map_err(|e| SinkError::Transient(format!("failed to compress batch: {e}"))),
            None => Ok(body),
        }
    }
}

/// 2xx is success; timeouts, throttling and server errors are worth retrying.
fn classify(status: StatusCode) -> Result<(), SinkError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(SinkError::Transient(format!("sink responded with {status}")))
    } else {
        Err(SinkError::Rejected(format!("sink responded with {status}")))
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        let body = self.encode(batch)?;
        debug!(
            sink = %self.sink_id,
            batch = batch.sequence(),
            bytes = body.len(),
            "sending batch"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("request failed: {e}")))?;
        classify(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkProtocol;
    use crate::envelope::tests::span;
    use crate::envelope::{Envelope, SignalKind};
    use mockito::{Matcher, Server};

    fn batch() -> Batch {
        let mut batch = Batch::new(SignalKind::Trace, 0);
        batch.push(Envelope::new(span("checkout"))).expect("open batch");
        batch.seal();
        batch
    }

    fn config(endpoint: String) -> SinkConfig {
        let mut config = SinkConfig::new("backend", SinkProtocol::Http);
        config.endpoint = Some(endpoint);
        config
    }

    #[tokio::test]
    async fn test_delivers_json_batch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/traces")
            .match_header("content-type", "application/json")
            .match_header("x-team", "observability")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "kind": "trace",
                "sequence": 0
            })))
            .with_status(200)
            .create_async()
            .await;

        let mut config = config(format!("{}/v1/traces", server.url()));
        config
            .headers
            .insert("x-team".to_string(), "observability".to_string());
        let sink = HttpSink::new(&config).expect("sink");
        sink.deliver(&batch()).await.expect("delivered");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_compresses_with_zstd() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("content-encoding", "zstd")
            .with_status(202)
            .create_async()
            .await;

        let mut config = config(server.url());
        config.compression_level = Some(3);
        let sink = HttpSink::new(&config).expect("sink");
        let body = sink.encode(&batch()).expect("encode");
        let decoded = zstd::decode_all(body.as_slice()).expect("zstd body");
        let value: serde_json::Value = serde_json::from_slice(&decoded).expect("json");
        assert_eq!(value["kind"], "trace");

        sink.deliver(&batch()).await.expect("delivered");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mut server = Server::new_async().await;
        let unavailable = server
            .mock("POST", "/unavailable")
            .with_status(503)
            .create_async()
            .await;
        let bad_request = server
            .mock("POST", "/bad")
            .with_status(400)
            .create_async()
            .await;

        let sink = HttpSink::new(&config(format!("{}/unavailable", server.url()))).expect("sink");
        assert!(matches!(
            sink.deliver(&batch()).await,
            Err(SinkError::Transient(_))
        ));
        let sink = HttpSink::new(&config(format!("{}/bad", server.url()))).expect("sink");
        assert!(matches!(
            sink.deliver(&batch()).await,
            Err(SinkError::Rejected(_))
        ));
        unavailable.assert_async().await;
        bad_request.assert_async().await;

        assert!(classify(StatusCode::TOO_MANY_REQUESTS).is_err());
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT),
            Err(SinkError::Transient(_))
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND),
            Err(SinkError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Port 9 (discard) is not expected to accept connections in the test environment.
        let sink = HttpSink::new(&config("http://127.0.0.1:9/".to_string())).expect("sink");
        assert!(matches!(
            sink.deliver(&batch()).await,
            Err(SinkError::Transient(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_header() {
        let mut config = config("http://localhost".to_string());
        config
            .headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(HttpSink::new(&config).is_err());
    }
}
