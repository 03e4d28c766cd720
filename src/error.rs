use axum::response::{IntoResponse, Response};

/// Error type shared by the translator, the stream reencoder and the handler.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Non-2xx backend reply. The body is handed back to the client untouched.
    #[error("Upstream error: status={status}")]
    Upstream {
        status: http::StatusCode,
        content_type: Option<http::HeaderValue>,
        body: bytes::Bytes,
    },
    /// A 2xx backend body that still carries an `error` field.
    #[error("{0}")]
    Backend(String),
    #[error("Malformed backend frame: {0}")]
    MalformedFrame(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Stream aborted: {0}")]
    StreamAbort(String),
    #[error("Protocol translation error: {0}")]
    Translation(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Status code used when the error is rendered as a JSON reply.
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        match self {
            ProxyError::InvalidRequest(_) => http::StatusCode::BAD_REQUEST,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Config(_)
            | ProxyError::Backend(_)
            | ProxyError::MalformedFrame(_)
            | ProxyError::Transport(_)
            | ProxyError::StreamAbort(_)
            | ProxyError::Translation(_)
            | ProxyError::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Render `{"error": message}` with the given status.
#[must_use]
pub fn error_json_response(status: http::StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Upstream {
                status,
                content_type,
                body,
            } => {
                let mut response = Response::new(axum::body::Body::from(body));
                *response.status_mut() = status;
                if let Some(content_type) = content_type {
                    response
                        .headers_mut()
                        .insert(http::header::CONTENT_TYPE, content_type);
                }
                response
            }
            other => error_json_response(other.status(), &other.to_string()),
        }
    }
}
