use std::time::Duration;

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::protocol::openai_chat::ChatRequest;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    timeout: Duration,
) -> Result<reqwest::Client, ProxyError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| ProxyError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// `{base_url}/v1/chat/completions`, tolerating a trailing slash on the base.
///
/// # Errors
///
/// Returns [`ProxyError::Config`] when the result is not a valid URL.
pub fn chat_completions_url(base_url: &str) -> Result<url::Url, ProxyError> {
    let raw = format!("{}{CHAT_COMPLETIONS_PATH}", base_url.trim_end_matches('/'));
    url::Url::parse(&raw)
        .map_err(|err| ProxyError::Config(format!("Invalid upstream URL {raw}: {err}")))
}

/// HTTP client for the chat completions backend.
///
/// The target URL and request headers are fixed at startup.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    chat_url: url::Url,
    headers: http::HeaderMap,
}

impl HttpTransport {
    /// Create a pooled transport for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an unusable URL or credential and
    /// [`ProxyError::Transport`] when the client cannot be built.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, ProxyError> {
        let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
        };
        let client = build_reqwest_client(
            server.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            Duration::from_secs(server.timeout),
        )?;

        let mut headers = http::HeaderMap::with_capacity(2);
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        if let Some(api_key) = upstream.api_key.as_deref() {
            let mut value = http::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| ProxyError::Config("API key is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(http::header::AUTHORIZATION, value);
        }

        Ok(Self {
            client,
            chat_url: chat_completions_url(&upstream.base_url)?,
            headers,
        })
    }

    #[must_use]
    pub fn chat_url(&self) -> &url::Url {
        &self.chat_url
    }

    /// POST a chat request. Any HTTP status counts as success here.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Internal`] if the body cannot be serialized and
    /// [`ProxyError::Transport`] when the request cannot be sent.
    pub async fn send_chat(&self, body: &ChatRequest) -> Result<reqwest::Response, ProxyError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| ProxyError::Internal(format!("Failed to encode request: {err}")))?;

        let mut request = reqwest::Request::new(http::Method::POST, self.chat_url.clone());
        *request.headers_mut() = self.headers.clone();
        *request.body_mut() = Some(reqwest::Body::from(payload));

        self.client.execute(request).await.map_err(|err| {
            ProxyError::Transport(format!("Request to {} failed: {err}", self.chat_url))
        })
    }
}

/// Consume a non-2xx backend response into a passthrough error.
pub async fn upstream_error(response: reqwest::Response) -> ProxyError {
    let status = response.status();
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .cloned();
    match response.bytes().await {
        Ok(body) => ProxyError::Upstream {
            status,
            content_type,
            body,
        },
        Err(err) => ProxyError::Transport(format!(
            "Failed to read upstream error body (status {status}): {err}"
        )),
    }
}
