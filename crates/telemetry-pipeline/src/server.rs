// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP listener in front of the ingest endpoint.
//!
//! `POST /v1/envelopes` takes one JSON envelope or an array of them. `GET /health` and
//! `GET /metrics` expose the status board for scraping.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::http::{self, HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::envelope::WireEnvelope;
use crate::errors::IngestError;
use crate::health::StatusBoard;
use crate::ingest::IngestEndpoint;

pub const ENVELOPES_ENDPOINT_PATH: &str = "/v1/envelopes";
pub const HEALTH_ENDPOINT_PATH: &str = "/health";
pub const METRICS_ENDPOINT_PATH: &str = "/metrics";

type HttpResponse = Response<Full<Bytes>>;

struct ServerState {
    ingest: Arc<IngestEndpoint>,
    board: Arc<StatusBoard>,
    max_request_bytes: usize,
}

pub struct IngestServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl IngestServer {
    /// Binds the listener. Requests are only served once [`IngestServer::serve`] runs.
    pub async fn bind(
        address: SocketAddr,
        ingest: Arc<IngestEndpoint>,
        board: Arc<StatusBoard>,
        max_request_bytes: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                ingest,
                board,
                max_request_bytes,
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires, then drops every open connection.
    pub async fn serve(self, cancel: CancellationToken) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        if let Ok(address) = self.listener.local_addr() {
            info!("ingest listener serving on {address}");
        }

        loop {
            let conn = tokio::select! {
                () = cancel.cancelled() => break,
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let state = Arc::clone(&self.state);
            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { handle(&state, req).await }
            });
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }

        joinset.abort_all();
        debug!("ingest listener stopped");
        Ok(())
    }
}

async fn handle(state: &ServerState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::POST, ENVELOPES_ENDPOINT_PATH) => handle_envelopes(state, req).await,
        (&Method::GET, HEALTH_ENDPOINT_PATH) => json_response(
            StatusCode::OK,
            serde_json::to_string(&state.board.health())
                .unwrap_or_else(|e| json!({ "message": e.to_string() }).to_string()),
        ),
        (&Method::GET, METRICS_ENDPOINT_PATH) => match state.board.render_prometheus() {
            Ok(text) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
                .body(Full::new(Bytes::from(text))),
            Err(e) => log_and_create_http_response(
                &format!("Error rendering metrics: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        },
        (_, path) => log_and_create_http_response(
            &format!("Endpoint {path} not found"),
            StatusCode::NOT_FOUND,
        ),
    }
}

async fn handle_envelopes(state: &ServerState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    if let Some(response) =
        verify_request_content_length(req.headers(), state.max_request_bytes, "Error processing envelopes")
    {
        return response;
    }

    let body = Limited::new(req.into_body(), state.max_request_bytes);
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return log_and_create_http_response(
                "Error processing envelopes: Payload too large",
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error processing envelopes: failed to read request body: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let result = decode_body(&bytes).and_then(|wire| state.ingest.submit_wire(wire));
    match result {
        Ok(ids) => {
            debug!(envelopes = ids.len(), "accepted envelopes over http");
            json_response(
                StatusCode::ACCEPTED,
                json!({ "accepted_ids": ids }).to_string(),
            )
        }
        Err(e) => {
            let status = ingest_error_status(&e);
            let mut response = log_and_create_http_response(&e.to_string(), status)?;
            if status == StatusCode::TOO_MANY_REQUESTS {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            }
            Ok(response)
        }
    }
}

/// Accepts a single JSON envelope or a JSON array of envelopes.
fn decode_body(bytes: &[u8]) -> Result<Vec<WireEnvelope>, IngestError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| IngestError::InvalidEnvelope(format!("request body is not JSON: {e}")))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item)
                .map_err(|e| IngestError::InvalidEnvelope(format!("envelope {index}: {e}")))
        })
        .collect()
}

fn ingest_error_status(error: &IngestError) -> StatusCode {
    match error {
        IngestError::InvalidEnvelope(_) => StatusCode::BAD_REQUEST,
        IngestError::UnknownKind(_) => StatusCode::UNPROCESSABLE_ENTITY,
        IngestError::BufferFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        IngestError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn json_response(status: StatusCode, body: String) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
}

/// Logs `message` and returns it as `{"message": ...}` with the given status. Success statuses
/// log at debug, rejections caused by the producer at debug, everything else at error.
pub fn log_and_create_http_response(message: &str, status: StatusCode) -> http::Result<HttpResponse> {
    if status.is_success() || status.is_client_error() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    json_response(status, json!({ "message": message }).to_string())
}

/// Checks that `Content-Length` or `Transfer-Encoding` is present and that a declared length
/// does not exceed `max_content_length`. Returns the error response to send, if any.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let Some(content_length_header) = header_map.get(header::CONTENT_LENGTH) else {
        if header_map.contains_key(header::TRANSFER_ENCODING) {
            return None;
        }
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"),
            StatusCode::LENGTH_REQUIRED,
        ));
    };
    let Some(content_length) = content_length_header
        .to_str()
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    else {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Invalid Content-Length header"),
            StatusCode::BAD_REQUEST,
        ));
    };
    if content_length > max_content_length {
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }
    None
}
