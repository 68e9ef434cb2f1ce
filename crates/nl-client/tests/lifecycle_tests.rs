//! End-to-end lifecycle coverage over an in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use nl_client::business::BusinessConfig;
use nl_client::interceptor::Interceptor;
use nl_client::manager::{ApiManager, ManagerConfig};
use nl_client::parser::JsonParser;
use nl_client::transport::{RawResponse, Transport, TransportFailure, TransportOptions};
use nl_client::{
    Body, CacheSettings, CancellationToken, MockSettings, Request, Response, RetryConfig,
    CODE_CANCELLED, CODE_INVALID_REQUEST, CODE_TIMEOUT, CODE_UNKNOWN_BUSINESS,
};

/// Scripted transport: fails the first `fail_first` calls with a timeout,
/// then answers 200 with the configured payload.
struct MockTransport {
    calls: AtomicUsize,
    fail_first: usize,
    payload: Value,
    paths: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockTransport {
    fn succeeding(payload: Value) -> Arc<Self> {
        Self::failing_first(0, payload)
    }

    fn failing_first(fail_first: usize, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
            payload,
            paths: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::failing_first(usize::MAX, Value::Null)
    }

    fn slow(delay: Duration, payload: Value) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            payload,
            paths: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(SeqCst)
    }

    fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        path: &str,
        _body: &Body,
        _query: &Map<String, Value>,
        _options: &TransportOptions,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, TransportFailure> {
        self.paths.lock().push(path.to_string());
        let call = self.calls.fetch_add(1, SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransportFailure::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if call < self.fail_first {
            return Err(TransportFailure::timeout("simulated timeout"));
        }
        Ok(RawResponse {
            status: 200,
            data: Some(self.payload.clone()),
            ..Default::default()
        })
    }
}

/// Interceptor that counts hook invocations and can be scripted for
/// retry, suspend pass-through, and completion interception.
#[derive(Default)]
struct RecordingInterceptor {
    retry_on_error: bool,
    pass_tag: Option<String>,
    intercept_completion: bool,
    cache_loads: AtomicUsize,
    cache_saves: AtomicUsize,
    promise_adds: AtomicUsize,
    promise_removes: AtomicUsize,
    clean_calls: AtomicUsize,
}

#[async_trait]
impl Interceptor for RecordingInterceptor {
    fn allow_request_pass_when_suspend(&self, request: &Request) -> bool {
        match (&self.pass_tag, &request.extra_tag) {
            (Some(tag), Some(extra)) => tag == extra,
            _ => false,
        }
    }

    fn on_load_cache(&self, _request: &Request, _data: &Value) {
        self.cache_loads.fetch_add(1, SeqCst);
    }

    fn on_save_cache(&self, _request: &Request, _data: &Value) {
        self.cache_saves.fetch_add(1, SeqCst);
    }

    fn on_add_to_promise(&self, _request: &Request) {
        self.promise_adds.fetch_add(1, SeqCst);
    }

    fn on_remove_from_promise(&self, _request: &Request) {
        self.promise_removes.fetch_add(1, SeqCst);
    }

    fn need_retry(&self, _request: &Request, response: &Response) -> bool {
        self.retry_on_error && response.error.is_some()
    }

    fn intercept_complete(&self, _request: &Request, _response: &Response) -> bool {
        self.intercept_completion
    }

    async fn on_clean_data(&self) {
        self.clean_calls.fetch_add(1, SeqCst);
    }
}

fn memory_config() -> ManagerConfig {
    ManagerConfig {
        cache_database_url: "sqlite::memory:".to_string(),
        promise_database_url: "sqlite::memory:".to_string(),
        cache_capacity: 100,
    }
}

async fn register_business(
    manager: &Arc<ApiManager>,
    interceptor: Arc<RecordingInterceptor>,
    transport: Arc<MockTransport>,
) {
    let shared: Arc<dyn Transport> = transport;
    let config = BusinessConfig::new("biz", "http://localhost", interceptor, Arc::new(JsonParser))
        .with_retry_interval(Duration::from_millis(10))
        .with_transport_factory(Arc::new(move |_config, _is_mock| Ok(shared.clone())));
    manager.add_business(config).await.unwrap();
}

#[tokio::test]
async fn cache_hit_is_stashed_and_network_still_runs() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::succeeding(json!({"fresh": true}));
    register_business(&manager, interceptor.clone(), transport.clone()).await;

    // Pre-populate under the request's fingerprint: md5("bizGET/users").
    let key = Request::get("biz", "/users").compute_cache_key();
    assert_eq!(key, "055ccbd05d9ed82b7fded1ac9e71c066");
    manager.cache_store().save(&key, json!({"id": 1}), None, true).await;

    let request =
        manager.send(Request::get("biz", "/users").with_cache(CacheSettings::enabled(None)));
    let response = request.completion.wait().await;

    assert_eq!(interceptor.cache_loads.load(SeqCst), 1);
    let stashed = request.cache.last_response().expect("cache hit stashed");
    assert_eq!(stashed.data, Some(json!({"id": 1})));
    // The hit does not short-circuit the network; the caller still gets the
    // fresh payload through the completion slot.
    assert_eq!(transport.calls(), 1);
    assert_eq!(response.data, Some(json!({"fresh": true})));
}

#[tokio::test]
async fn retry_then_succeed() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor {
        retry_on_error: true,
        ..Default::default()
    });
    let transport = MockTransport::failing_first(2, json!({"ok": true}));
    register_business(&manager, interceptor, transport.clone()).await;

    let request = manager.send(
        Request::get("biz", "/flaky").with_retry(RetryConfig::limited(3, Duration::from_millis(10))),
    );
    let response = request.completion.wait().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(request.retry.count(), 2);
    assert!(response.is_success());
    assert_eq!(response.data, Some(json!({"ok": true})));
}

#[tokio::test]
async fn retry_budget_is_exhausted_after_max_plus_one_attempts() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor {
        retry_on_error: true,
        ..Default::default()
    });
    let transport = MockTransport::always_failing();
    register_business(&manager, interceptor, transport.clone()).await;

    let request = manager.send(
        Request::get("biz", "/down").with_retry(RetryConfig::limited(2, Duration::from_millis(0))),
    );
    let response = request.completion.wait().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(response.error.as_ref().unwrap().code, CODE_TIMEOUT);
}

#[tokio::test]
async fn never_policy_does_not_consult_the_interceptor() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor {
        retry_on_error: true,
        ..Default::default()
    });
    let transport = MockTransport::always_failing();
    register_business(&manager, interceptor, transport.clone()).await;

    let request = manager.send(Request::get("biz", "/down"));
    let response = request.completion.wait().await;

    assert_eq!(transport.calls(), 1);
    assert!(response.error.is_some());
}

#[tokio::test]
async fn promise_survives_restart_and_clears_on_success() {
    let db_path = std::env::temp_dir().join(format!(
        "nl-lifecycle-promise-{}.db",
        uuid::Uuid::new_v4()
    ));
    let promise_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let config = ManagerConfig {
        cache_database_url: "sqlite::memory:".to_string(),
        promise_database_url: promise_url,
        cache_capacity: 100,
    };

    // First process: the transport never recovers, so the enlistment stays.
    let manager = ApiManager::new(config.clone());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    register_business(&manager, interceptor.clone(), MockTransport::always_failing()).await;

    let mut body = Map::new();
    body.insert("x".to_string(), json!(1));
    let original = manager.send(
        Request::post("biz", "/sync")
            .with_body(Body::Json(body))
            .with_promise(),
    );
    let response = original.completion.wait().await;
    assert!(response.error.is_some());
    assert_eq!(interceptor.promise_adds.load(SeqCst), 1);
    let promise_key = original.promise.key().expect("enlisted");
    manager.release().await;

    // Second process: the record is rehydrated, replayed, and settled.
    let manager = ApiManager::new(config);
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    register_business(
        &manager,
        interceptor.clone(),
        MockTransport::succeeding(json!({"done": true})),
    )
    .await;

    let pending = manager.promise_requests("biz", &[]).await;
    assert_eq!(pending.len(), 1);
    let revived = pending[0].clone();
    assert_eq!(revived.business, original.business);
    assert_eq!(revived.api_path, original.api_path);
    assert_eq!(revived.method, original.method);
    assert_eq!(revived.promise.key(), Some(promise_key));
    assert!(matches!(revived.body, Body::Json(_)));

    let response = manager.send(revived).completion.wait().await;
    assert!(response.is_success());
    assert_eq!(interceptor.promise_adds.load(SeqCst), 0); // key already set
    assert_eq!(interceptor.promise_removes.load(SeqCst), 1);
    assert!(manager.promise_requests("biz", &[]).await.is_empty());
    manager.release().await;

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn suspend_holds_requests_unless_interceptor_passes_them() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor {
        pass_tag: Some("vip".to_string()),
        ..Default::default()
    });
    let transport = MockTransport::succeeding(json!({"ok": true}));
    register_business(&manager, interceptor, transport.clone()).await;

    manager.suspend(&["biz"]);

    let mut privileged = Request::get("biz", "/a");
    privileged.extra_tag = Some("vip".to_string());
    let privileged = manager.send(privileged);
    let held = manager.send(Request::get("biz", "/b"));

    // The pass-through request completes while the business is suspended.
    assert!(privileged.completion.wait().await.is_success());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.calls(), 1);
    assert!(!held.completion.is_completed());

    manager.resume(&["biz"]);
    assert!(held.completion.wait().await.is_success());
    assert_eq!(transport.calls(), 2);

    // Double-resume is a no-op.
    manager.resume(&["biz"]);
}

#[tokio::test]
async fn lru_cache_writes_evict_oldest_key() {
    let manager = ApiManager::new(ManagerConfig {
        cache_capacity: 2,
        ..memory_config()
    });
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::succeeding(json!({"cached": true}));
    register_business(&manager, interceptor.clone(), transport).await;

    let mut keys = Vec::new();
    for path in ["/one", "/two", "/three"] {
        let request = manager.send(
            Request::get("biz", path).with_cache(CacheSettings::enabled(None)),
        );
        request.completion.wait().await;
        keys.push(request.cache.key().expect("key pinned"));
    }

    assert_eq!(interceptor.cache_saves.load(SeqCst), 3);
    assert_eq!(manager.cache_store().load(&keys[0], true).await, None);
    assert!(manager.cache_store().load(&keys[1], true).await.is_some());
    assert!(manager.cache_store().load(&keys[2], true).await.is_some());
}

#[tokio::test]
async fn ignore_once_skips_the_cache_read() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::succeeding(json!({"fresh": true}));
    register_business(&manager, interceptor.clone(), transport).await;

    let key = Request::get("biz", "/users").compute_cache_key();
    manager.cache_store().save(&key, json!({"id": 1}), None, true).await;

    let mut cache = CacheSettings::enabled(None);
    cache.ignore_once = true;
    let request = manager.send(Request::get("biz", "/users").with_cache(cache));
    let response = request.completion.wait().await;

    assert!(response.is_success());
    assert_eq!(interceptor.cache_loads.load(SeqCst), 0);
    assert!(request.cache.last_response().is_none());
}

#[tokio::test]
async fn unknown_business_completes_immediately() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;

    let response = manager.send(Request::get("ghost", "/nowhere")).completion.wait().await;
    let error = response.error.unwrap();
    assert_eq!(error.code, CODE_UNKNOWN_BUSINESS);
    assert!(error.message.contains("ghost"));
}

#[tokio::test]
async fn streaming_body_cannot_be_enlisted() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    register_business(&manager, interceptor, MockTransport::succeeding(json!({}))).await;

    let mut request = Request::post("biz", "/upload").with_promise();
    request.body = Body::Stream(bytes::Bytes::from_static(b"blob"));
    let response = manager.send(request).completion.wait().await;

    assert_eq!(response.error.unwrap().code, CODE_INVALID_REQUEST);
}

#[tokio::test]
async fn cancellation_flows_through_the_parser() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::slow(Duration::from_secs(30), json!({}));
    register_business(&manager, interceptor, transport).await;

    let cancel = CancellationToken::new();
    let request = manager.send(Request::get("biz", "/slow").with_cancel(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let response = request.completion.wait().await;
    assert_eq!(response.error.unwrap().code, CODE_CANCELLED);
}

#[tokio::test]
async fn mock_requests_route_through_the_mock_transport() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;

    let live = MockTransport::succeeding(json!({"env": "live"}));
    let mock = MockTransport::succeeding(json!({"env": "mock"}));
    let (live_shared, mock_shared) = (live.clone(), mock.clone());
    let config = BusinessConfig::new(
        "biz",
        "http://localhost",
        Arc::new(RecordingInterceptor::default()),
        Arc::new(JsonParser),
    )
    .with_mock_base_url("http://mock.localhost")
    .with_transport_factory(Arc::new(move |_config, is_mock| {
        let transport: Arc<dyn Transport> = if is_mock {
            mock_shared.clone()
        } else {
            live_shared.clone()
        };
        Ok(transport)
    }));
    manager.add_business(config).await.unwrap();

    let mut request = Request::get("biz", "/users");
    request.mock = MockSettings {
        enable: true,
        project_id: 7,
        origin_path: "/users".to_string(),
    };
    let response = manager.send(request).completion.wait().await;

    assert_eq!(response.data, Some(json!({"env": "mock"})));
    assert_eq!(mock.paths(), vec!["/mock/7/users".to_string()]);
    assert_eq!(live.calls(), 0);

    // Without the flag the live transport serves the request.
    let response = manager.send(Request::get("biz", "/users")).completion.wait().await;
    assert_eq!(response.data, Some(json!({"env": "live"})));
}

#[tokio::test]
async fn interceptor_can_take_over_completion() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor {
        intercept_completion: true,
        ..Default::default()
    });
    let transport = MockTransport::succeeding(json!({"ok": true}));
    register_business(&manager, interceptor, transport.clone()).await;

    let request = manager.send(Request::get("biz", "/owned"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The transport ran, but ownership of completion moved to the
    // interceptor; the slot stays open.
    assert_eq!(transport.calls(), 1);
    assert!(!request.completion.is_completed());
}

#[tokio::test]
async fn clean_data_clears_stores_and_notifies_interceptors() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::always_failing();
    register_business(&manager, interceptor.clone(), transport).await;

    // Leave one cache entry and one pending enlistment behind.
    manager.cache_store().save("deadbeef", json!({"v": 1}), None, true).await;
    let request = manager.send(Request::post("biz", "/sync").with_promise());
    request.completion.wait().await;
    assert_eq!(manager.promise_requests("biz", &[]).await.len(), 1);

    manager.clean_data().await;

    assert_eq!(manager.cache_store().load("deadbeef", true).await, None);
    assert!(manager.promise_requests("biz", &[]).await.is_empty());
    assert_eq!(interceptor.clean_calls.load(SeqCst), 1);
}

#[tokio::test]
async fn registration_is_idempotent() {
    let manager = ApiManager::new(memory_config());
    manager.ready().await;
    let interceptor = Arc::new(RecordingInterceptor::default());
    let transport = MockTransport::succeeding(json!({"ok": true}));
    register_business(&manager, interceptor.clone(), transport.clone()).await;
    register_business(&manager, interceptor, transport).await;

    let response = manager.send(Request::get("biz", "/ping")).completion.wait().await;
    assert!(response.is_success());
}
