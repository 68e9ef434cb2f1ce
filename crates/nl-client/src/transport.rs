//! Transport contract and the reqwest-backed implementation.
//!
//! The orchestrator talks to the wire exclusively through [`Transport`];
//! failures are typed so expected faults (connection loss, timeouts,
//! cancellation) can be logged without stack noise and mapped by parsers
//! into caller-facing errors.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use nl_common::{Body, ContentType, HttpMethod, ProgressCallback, ResponseType};

/// Per-call options resolved from the request and its business defaults.
#[derive(Clone)]
pub struct TransportOptions {
    pub method: HttpMethod,
    pub content_type: ContentType,
    pub response_type: ResponseType,
    pub headers: HashMap<String, String>,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub on_send: Option<ProgressCallback>,
    pub on_recv: Option<ProgressCallback>,
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("method", &self.method)
            .field("content_type", &self.content_type)
            .field("response_type", &self.response_type)
            .field("headers", &self.headers)
            .field("send_timeout", &self.send_timeout)
            .field("recv_timeout", &self.recv_timeout)
            .finish_non_exhaustive()
    }
}

/// What came back over the wire, before any parser has judged it.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub data: Option<Value>,
    pub text: Option<String>,
    pub bytes: Option<bytes::Bytes>,
}

impl RawResponse {
    pub fn is_http_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection, TLS, DNS, or I/O fault below the HTTP layer.
    Connection,
    /// Send or receive exceeded its budget.
    Timeout,
    /// The request's cancel token fired.
    Cancelled,
    Other,
}

/// Typed transport fault. `raw` carries whatever partial response was
/// observed before the failure, for diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
    pub raw: Option<RawResponse>,
}

impl TransportFailure {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Connection,
            message: message.into(),
            raw: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
            raw: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "request cancelled".to_string(),
            raw: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Other,
            message: message.into(),
            raw: None,
        }
    }
}

/// One HTTP round trip. Implementations must honor the cancel token and
/// return every HTTP response (any status) as `Ok`; `Err` is reserved for
/// faults where no usable response exists.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        path: &str,
        body: &Body,
        query: &Map<String, Value>,
        options: &TransportOptions,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportFailure>;
}

/// Default transport over a pooled reqwest client, one per business line.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        path: &str,
        body: &Body,
        query: &Map<String, Value>,
        options: &TransportOptions,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportFailure> {
        let url = format!("{}{}", self.base_url, path);
        let method = to_reqwest_method(options.method);
        let mut builder = self.client.request(method, &url);

        if !query.is_empty() {
            builder = builder.query(&query_pairs(query));
        }
        for (name, value) in &options.headers {
            builder = builder.header(name, value);
        }
        // The tighter of the two per-request budgets overrides the client
        // default; reqwest enforces a single whole-request deadline.
        if let Some(timeout) = per_request_timeout(options) {
            builder = builder.timeout(timeout);
        }

        let sent_bytes = match body {
            Body::Empty => 0,
            Body::Json(map) => {
                let encoded = serde_json::to_vec(map).unwrap_or_default();
                let len = encoded.len() as u64;
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, ContentType::Json.as_mime())
                    .body(encoded);
                len
            }
            Body::Text(text) => {
                builder = builder
                    .header(reqwest::header::CONTENT_TYPE, options.content_type.as_mime())
                    .body(text.clone());
                text.len() as u64
            }
            Body::Stream(bytes) => {
                let len = bytes.len() as u64;
                builder = builder.body(bytes.clone());
                len
            }
        };

        debug!(url = %url, method = options.method.as_str(), "dispatching request");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportFailure::cancelled()),
            result = builder.send() => result.map_err(map_reqwest_error)?,
        };
        if let Some(on_send) = &options.on_send {
            on_send(sent_bytes, Some(sent_bytes));
        }

        let status = response.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_str().unwrap_or_default().to_string());
        }

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportFailure::cancelled()),
            result = response.bytes() => result.map_err(map_reqwest_error)?,
        };
        if let Some(on_recv) = &options.on_recv {
            on_recv(payload.len() as u64, Some(payload.len() as u64));
        }

        let mut raw = RawResponse {
            status,
            headers,
            data: None,
            text: None,
            bytes: None,
        };
        match options.response_type {
            ResponseType::Bytes => raw.bytes = Some(payload),
            ResponseType::Text => raw.text = Some(String::from_utf8_lossy(&payload).into_owned()),
            ResponseType::Json => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                // A body that is not valid JSON is kept as text; the parser
                // decides what that means.
                raw.data = serde_json::from_str(&text).ok();
                raw.text = Some(text);
            }
        }
        Ok(raw)
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

fn per_request_timeout(options: &TransportOptions) -> Option<Duration> {
    match (options.send_timeout, options.recv_timeout) {
        (Some(send), Some(recv)) => Some(send.min(recv)),
        (timeout, None) | (None, timeout) => timeout,
    }
}

fn query_pairs(query: &Map<String, Value>) -> Vec<(String, String)> {
    query
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

fn map_reqwest_error(error: reqwest::Error) -> TransportFailure {
    if error.is_timeout() {
        TransportFailure::timeout(error.to_string())
    } else if error.is_connect() {
        TransportFailure::connection(error.to_string())
    } else {
        TransportFailure::other(error.to_string())
    }
}
