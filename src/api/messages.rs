use std::sync::Arc;
use std::time::Instant;

use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::observability::token_counter::log_request_usage;
use crate::protocol::anthropic::MessagesRequest;
use crate::protocol::openai_chat::ChatResponse;
use crate::protocol::request::{translate_request, TranslatedRequest};
use crate::protocol::response::translate_response;
use crate::state::AppState;
use crate::stream::reencode_stream;
use crate::transport::upstream_error;

/// `POST /v1/messages`.
pub async fn handler(state: Arc<AppState>, body: bytes::Bytes) -> Response {
    match handler_inner(state, body).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                ProxyError::Upstream { status, .. } => {
                    warn!(status = %status, "backend rejected request");
                }
                ProxyError::InvalidRequest(_) => debug!(error = %err, "invalid request"),
                _ => warn!(error = %err, "request failed"),
            }
            err.into_response()
        }
    }
}

async fn handler_inner(state: Arc<AppState>, body: bytes::Bytes) -> Result<Response, ProxyError> {
    let started_at = Instant::now();
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Failed to parse Anthropic request: {e}")))?;
    let translated = translate_request(&request, &state.config.upstream, &state.config.features);

    debug!(
        model = %translated.model,
        stream = translated.body.stream,
        url = %state.transport.chat_url(),
        "forwarding request"
    );
    let response = state.transport.send_chat(&translated.body).await?;
    if !response.status().is_success() {
        return Err(upstream_error(response).await);
    }

    if translated.body.stream {
        stream_response(response, translated.model).await
    } else {
        non_stream_response(response, &translated, started_at).await
    }
}

async fn non_stream_response(
    response: reqwest::Response,
    translated: &TranslatedRequest,
    started_at: Instant,
) -> Result<Response, ProxyError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| ProxyError::Transport(format!("Failed to read backend response: {e}")))?;
    let parsed: ChatResponse = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::Translation(format!("Invalid backend response: {e}")))?;

    let message = translate_response(&parsed, &translated.body.messages, &translated.model)?;
    log_request_usage(&message.model, &message.usage, started_at.elapsed(), false);

    let encoded = serde_json::to_vec(&message)
        .map_err(|e| ProxyError::Internal(format!("Failed to encode response: {e}")))?;
    Ok(ok_json_response(bytes::Bytes::from(encoded)))
}

/// Commit to an SSE reply only once the reencoder has produced its first frame.
async fn stream_response(response: reqwest::Response, model: String) -> Result<Response, ProxyError> {
    let mut frames = Box::pin(reencode_stream(response.bytes_stream(), model));
    let first = match frames.next().await {
        Some(Ok(first)) => first,
        Some(Err(err)) => return Err(err),
        None => {
            return Err(ProxyError::StreamAbort(
                "backend stream produced no output".to_string(),
            ))
        }
    };

    let body = axum::body::Body::from_stream(
        futures_util::stream::iter(std::iter::once(Ok::<bytes::Bytes, ProxyError>(first)))
            .chain(frames),
    );
    Ok(sse_ok_response(body))
}

#[inline]
fn ok_json_response(body_bytes: bytes::Bytes) -> Response {
    let mut response = Response::new(axum::body::Body::from(body_bytes));
    *response.status_mut() = http::StatusCode::OK;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

#[inline]
fn sse_ok_response(body: axum::body::Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}
