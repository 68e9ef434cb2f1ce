//! The request value object and its per-request configuration blocks.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::completion::CompletionSlot;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    Json,
    FormUrlEncoded,
    Plain,
}

impl ContentType {
    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
            ContentType::Plain => "text/plain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Bytes,
}

/// Request body. Only `Empty`, `Json`, and `Text` are serializable; a
/// `Stream` payload is opaque and cannot be replayed or fingerprinted, so
/// durable-replay enlistment rejects it.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Map<String, Value>),
    Text(String),
    Stream(Bytes),
}

impl Body {
    /// Whether this body survives JSON serialization for durable replay.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryPolicy {
    #[default]
    Never,
    Limit,
    Forever,
}

impl RetryPolicy {
    pub fn index(&self) -> u8 {
        match self {
            RetryPolicy::Never => 0,
            RetryPolicy::Limit => 1,
            RetryPolicy::Forever => 2,
        }
    }

    pub fn from_index(index: u8) -> Self {
        match index {
            1 => RetryPolicy::Limit,
            2 => RetryPolicy::Forever,
            _ => RetryPolicy::Never,
        }
    }
}

/// Retry policy plus the attempt counter. The counter is shared across
/// clones and only ever grows.
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    pub policy: RetryPolicy,
    pub max: u32,
    pub interval: Option<Duration>,
    count: Arc<AtomicU32>,
}

impl RetryConfig {
    pub fn limited(max: u32, interval: Duration) -> Self {
        Self {
            policy: RetryPolicy::Limit,
            max,
            interval: Some(interval),
            count: Arc::default(),
        }
    }

    pub fn forever(interval: Duration) -> Self {
        Self {
            policy: RetryPolicy::Forever,
            max: 0,
            interval: Some(interval),
            count: Arc::default(),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    /// Record one more retry. Returns the new count.
    pub fn record_retry(&self) -> u32 {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Cache participation for one request. `key` is computed once, right before
/// the first transport send; `last_response` is the slot a cache hit is
/// stashed into so the caller can read it without waiting on the network.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable: bool,
    pub use_lru: bool,
    pub ignore_once: bool,
    pub duration: Option<Duration>,
    key: Arc<OnceLock<String>>,
    last_response: Arc<Mutex<Option<Response>>>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enable: false,
            use_lru: true,
            ignore_once: false,
            duration: None,
            key: Arc::default(),
            last_response: Arc::default(),
        }
    }
}

impl CacheSettings {
    pub fn enabled(duration: Option<Duration>) -> Self {
        Self {
            enable: true,
            duration,
            ..Default::default()
        }
    }

    pub fn key(&self) -> Option<String> {
        self.key.get().cloned()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.last_response.lock().clone()
    }

    pub fn stash_response(&self, response: Response) {
        *self.last_response.lock() = Some(response);
    }

    pub(crate) fn key_cell(&self) -> &OnceLock<String> {
        &self.key
    }
}

/// Durable-replay enlistment. The key is assigned exactly once, at
/// enlistment; a request with `enable = false` never carries one.
#[derive(Debug, Clone, Default)]
pub struct PromiseSettings {
    pub enable: bool,
    key: Arc<OnceLock<String>>,
}

impl PromiseSettings {
    pub fn enabled() -> Self {
        Self {
            enable: true,
            key: Arc::default(),
        }
    }

    pub fn key(&self) -> Option<String> {
        self.key.get().cloned()
    }

    /// Returns `false` when a key was already assigned.
    pub fn assign_key(&self, key: String) -> bool {
        self.key.set(key).is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockSettings {
    pub enable: bool,
    pub project_id: i64,
    pub origin_path: String,
}

impl MockSettings {
    pub fn effective_path(&self) -> String {
        format!("/mock/{}{}", self.project_id, self.origin_path)
    }
}

/// Maps decoded JSON into a caller-defined model. Type-erased so the
/// framework never learns application schemas.
pub type ModelConverter = Arc<dyn Fn(&Value) -> Arc<dyn Any + Send + Sync> + Send + Sync>;

/// Byte-progress callback: (transferred, total if known).
pub type ProgressCallback = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// One HTTP call plus its retry/cache/replay/mock configuration and the
/// single-fire completion slot.
///
/// Cloning is cheap and clones share the runtime cells (attempt counter,
/// cache key and stash, promise key, completion slot), so the caller keeps a
/// live view of a request after handing it to the manager.
#[derive(Clone)]
pub struct Request {
    pub business: String,
    pub method: HttpMethod,
    pub api_path: String,
    pub path_param: Option<String>,
    pub query: Map<String, Value>,
    pub body: Body,
    pub headers: HashMap<String, String>,
    pub content_type: ContentType,
    pub response_type: ResponseType,
    pub connect_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub converter: Option<ModelConverter>,
    pub retry: RetryConfig,
    pub cache: CacheSettings,
    pub promise: PromiseSettings,
    pub mock: MockSettings,
    pub extra_tag: Option<String>,
    pub on_send: Option<ProgressCallback>,
    pub on_recv: Option<ProgressCallback>,
    pub completion: CompletionSlot,
    started_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Request {
    pub fn new(business: impl Into<String>, method: HttpMethod, api_path: impl Into<String>) -> Self {
        Self {
            business: business.into(),
            method,
            api_path: api_path.into(),
            path_param: None,
            query: Map::new(),
            body: Body::Empty,
            headers: HashMap::new(),
            content_type: ContentType::default(),
            response_type: ResponseType::default(),
            connect_timeout: None,
            send_timeout: None,
            recv_timeout: None,
            cancel: CancellationToken::new(),
            converter: None,
            retry: RetryConfig::default(),
            cache: CacheSettings::default(),
            promise: PromiseSettings::default(),
            mock: MockSettings::default(),
            extra_tag: None,
            on_send: None,
            on_recv: None,
            completion: CompletionSlot::new(),
            started_at: Arc::default(),
        }
    }

    pub fn get(business: impl Into<String>, api_path: impl Into<String>) -> Self {
        Self::new(business, HttpMethod::Get, api_path)
    }

    pub fn post(business: impl Into<String>, api_path: impl Into<String>) -> Self {
        Self::new(business, HttpMethod::Post, api_path)
    }

    pub fn delete(business: impl Into<String>, api_path: impl Into<String>) -> Self {
        Self::new(business, HttpMethod::Delete, api_path)
    }

    pub fn with_path_param(mut self, param: impl Into<String>) -> Self {
        self.path_param = Some(param.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: Value) -> Self {
        self.query.insert(key.into(), value);
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_promise(mut self) -> Self {
        self.promise = PromiseSettings::enabled();
        self
    }

    pub fn with_converter(mut self, converter: ModelConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Request path as sent to the transport: `api_path` plus the optional
    /// path parameter.
    pub fn effective_path(&self) -> String {
        match &self.path_param {
            Some(param) => format!("{}{}", self.api_path, param),
            None => self.api_path.clone(),
        }
    }

    /// Cache fingerprint: lowercase-hex MD5 over identity fields. The query
    /// mapping and a JSON body contribute their encoded forms; an empty query
    /// contributes nothing.
    pub fn compute_cache_key(&self) -> String {
        let mut input = String::new();
        input.push_str(&self.business);
        input.push_str(self.method.as_str());
        input.push_str(&self.api_path);
        if let Some(param) = &self.path_param {
            input.push_str(param);
        }
        if !self.query.is_empty() {
            input.push_str(&serde_json::to_string(&self.query).unwrap_or_default());
        }
        if let Body::Json(map) = &self.body {
            input.push_str(&serde_json::to_string(map).unwrap_or_default());
        }

        let digest = Md5::digest(input.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// The cache key, computing and pinning it on first use.
    pub fn ensure_cache_key(&self) -> String {
        self.cache
            .key_cell()
            .get_or_init(|| self.compute_cache_key())
            .clone()
    }

    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Utc::now());
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("business", &self.business)
            .field("method", &self.method)
            .field("api_path", &self.api_path)
            .field("path_param", &self.path_param)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .field("promise", &self.promise)
            .field("mock", &self.mock)
            .field("extra_tag", &self.extra_tag)
            .finish_non_exhaustive()
    }
}
