//! Admission pipeline and reverse proxy.
//!
//! Structured endpoints carry the model name inside the JSON request
//! body. The body is teed: chunks are buffered until one complete JSON
//! value has been decoded, the `model` field is pulled out, and the
//! outbound body is rebuilt as the buffer followed by whatever the
//! decoder never consumed. The scheduler admits the request, the
//! request is forwarded to the backend's loopback port, and the hold on
//! the backend is released when the response body finishes streaming.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, BodyDataStream, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::scheduler::{Backend, FcfsScheduler, LockError};
use crate::server::AppState;

#[derive(Debug, Error)]
pub(crate) enum ExtractError {
    #[error("missing model key")]
    MissingModel,
    #[error("invalid request body: {0}")]
    Invalid(#[source] serde_json::Error),
    #[error("request body ended early")]
    Truncated,
    #[error("failed to read request body: {0}")]
    Read(#[source] axum::Error),
}

#[derive(Deserialize)]
struct ModelProbe {
    #[serde(default)]
    model: Option<String>,
}

/// Read chunks from `body` until they form one complete JSON value,
/// decode its `model` field, and return the buffered bytes. Bytes past
/// the first JSON value stay in the buffer and are forwarded verbatim.
pub(crate) async fn read_model_field(
    body: &mut BodyDataStream,
) -> Result<(String, Bytes), ExtractError> {
    let mut buffered = BytesMut::new();
    loop {
        if !buffered.is_empty() {
            let probed = serde_json::Deserializer::from_slice(&buffered)
                .into_iter::<ModelProbe>()
                .next();
            match probed {
                Some(Ok(probe)) => {
                    let model = probe.model.ok_or(ExtractError::MissingModel)?;
                    return Ok((model, buffered.freeze()));
                }
                Some(Err(e)) if e.is_eof() => {}
                Some(Err(e)) => return Err(ExtractError::Invalid(e)),
                None => {}
            }
        }

        match body.next().await {
            Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(ExtractError::Read(e)),
            None => return Err(ExtractError::Truncated),
        }
    }
}

/// One successful `lock`, released on drop. Dropping spawns the async
/// unlock so the release survives handler panics and mid-stream client
/// disconnects alike.
pub(crate) struct Lease {
    scheduler: Arc<FcfsScheduler>,
    backend: Arc<Backend>,
}

impl Lease {
    pub(crate) fn new(scheduler: Arc<FcfsScheduler>, backend: Arc<Backend>) -> Self {
        Self { scheduler, backend }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let scheduler = Arc::clone(&self.scheduler);
        let backend = Arc::clone(&self.backend);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                scheduler.unlock(&backend).await;
            });
        }
    }
}

/// Response body that keeps the scheduler lease alive until the client
/// has consumed (or abandoned) the stream.
struct LeasedBody {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    _lease: Lease,
}

impl Stream for LeasedBody {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Handle a structured endpoint: tee the body for the model name, admit
/// through the scheduler, and forward verbatim.
pub(crate) async fn proxy_model_request(state: AppState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let mut body = body.into_data_stream();

    let (model, buffered) = match read_model_field(&mut body).await {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "failed to determine model for request");
            return (StatusCode::BAD_REQUEST, "missing or invalid 'model' key").into_response();
        }
    };

    let outbound = stream::iter([Ok::<_, axum::Error>(buffered)]).chain(body);
    dispatch(state, &model, parts, reqwest::Body::wrap_stream(outbound), None).await
}

/// Admit `model` through the scheduler and forward the request. When
/// `target` is set it replaces the inbound path and query.
pub(crate) async fn dispatch(
    state: AppState,
    model: &str,
    parts: Parts,
    outbound_body: reqwest::Body,
    target: Option<String>,
) -> Response {
    let backend = match lock_or_reply(&state, model).await {
        Ok(backend) => backend,
        Err(response) => return response,
    };
    let lease = Lease::new(Arc::clone(&state.scheduler), Arc::clone(&backend));

    forward(&state, &backend, lease, parts, outbound_body, target).await
}

/// Admit `model` through the scheduler, translating failures into the
/// HTTP replies shared by every proxied endpoint. A cancelled or failed
/// start writes no response body; the client has either hung up or will
/// learn nothing useful from one.
///
/// Client disconnect is not delivered through the token here: axum
/// drops the handler future when the connection closes, which abandons
/// the `lock` call at its next await point before anything could read a
/// cancelled token. The token stays inert and the parameter exists for
/// callers that hold an explicit cancel signal.
pub(crate) async fn lock_or_reply(
    state: &AppState,
    model: &str,
) -> Result<Arc<Backend>, Response> {
    let ctx = CancellationToken::new();

    match state.scheduler.lock(&ctx, model).await {
        Ok(backend) => Ok(backend),
        Err(LockError::NoSuchModel) => {
            Err((StatusCode::BAD_REQUEST, "invalid model name").into_response())
        }
        Err(LockError::Cancelled) => Err(().into_response()),
        Err(e) => {
            error!(model, error = %e, "failed to start model");
            Err(().into_response())
        }
    }
}

/// Forward the request to the backend's loopback port and stream the
/// response back, preserving method, path, query, and headers (minus
/// hop-by-hop ones).
async fn forward(
    state: &AppState,
    backend: &Backend,
    lease: Lease,
    parts: Parts,
    body: reqwest::Body,
    target: Option<String>,
) -> Response {
    let base = match backend.base_url().await {
        Ok(base) => base,
        Err(e) => {
            error!(error = %e, "cannot proxy to backend");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let path_and_query = target.unwrap_or_else(|| {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    });

    let mut outbound = state
        .http
        .request(parts.method.clone(), format!("{base}{path_and_query}"))
        .body(body);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        outbound = outbound.header(name, value);
    }

    let upstream = match outbound.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, "backend request failed");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let mut response = Response::builder().status(upstream.status());
    if let Some(headers) = response.headers_mut() {
        copy_headers(upstream.headers(), headers);
    }

    let body = LeasedBody {
        inner: Box::pin(upstream.bytes_stream()),
        _lease: lease,
    };
    match response.body(Body::from_stream(body)) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build proxied response");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if is_hop_by_hop(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::TE
        || name == header::TRAILER
        || name == header::UPGRADE
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name.as_str() == "keep-alive"
}
