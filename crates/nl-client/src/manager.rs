//! Central orchestrator driving every request through its lifecycle.
//!
//! One driver task per request walks: resolve business → wait for init and
//! suspend gates → pre-request hooks (replay enlistment, cache read) →
//! transport → parse → retry decision → cache write, replay completion, and
//! delivery. Retries re-enter at the pre-request step after their delay; the
//! suspend gate is consulted exactly once, so a suspend issued after a
//! request has passed it does not recall that request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nl_common::{
    ApiError, Gate, Request, Response, RetryPolicy, CODE_INVALID_REQUEST,
};
use nl_store::{CacheStore, PromiseStore, DEFAULT_LRU_CAPACITY};

use crate::business::{Business, BusinessConfig, BusinessRegistry};
use crate::parser::RequestFault;
use crate::transport::TransportOptions;

/// Namespace under which promise keys are derived (UUIDv5).
const PROMISE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x9f2c_1a77_5e68_4d03_b1f0_6a52_c8e9_3b41);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub cache_database_url: String,
    pub promise_database_url: String,
    pub cache_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_database_url: "sqlite://netline_cache.db?mode=rwc".to_string(),
            promise_database_url: "sqlite://netline_promise.db?mode=rwc".to_string(),
            cache_capacity: DEFAULT_LRU_CAPACITY,
        }
    }
}

/// Process-scoped orchestrator. Construct once, share the `Arc`, and call
/// [`ApiManager::release`] on shutdown.
pub struct ApiManager {
    registry: BusinessRegistry,
    cache: Arc<CacheStore>,
    promises: Arc<PromiseStore>,
    init_gate: Gate,
    in_flight: AtomicUsize,
}

impl ApiManager {
    /// Build the manager and kick off store initialization in the
    /// background: cache first, then promises, then the global init gate
    /// opens. Business registration and promise queries wait on that gate.
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry: BusinessRegistry::new(),
            cache: Arc::new(CacheStore::with_capacity(config.cache_capacity)),
            promises: Arc::new(PromiseStore::new()),
            init_gate: Gate::new(),
            in_flight: AtomicUsize::new(0),
        });

        let init = manager.clone();
        tokio::spawn(async move {
            if let Err(err) = init.cache.init(&config.cache_database_url).await {
                error!(error = %err, "cache store failed to initialize");
            }
            if let Err(err) = init.promises.init(&config.promise_database_url).await {
                error!(error = %err, "promise store failed to initialize");
            }
            init.init_gate.open();
            debug!("manager initialized");
        });

        manager
    }

    /// Wait for the global init gate.
    pub async fn ready(&self) {
        self.init_gate.wait().await;
    }

    /// Register a business line. Idempotent per identifier; completes once
    /// the business's transports are constructed and its init gate is open.
    pub async fn add_business(&self, config: BusinessConfig) -> nl_common::Result<()> {
        let identifier = config.identifier.clone();
        let business = Arc::new(Business::new(config));
        if !self.registry.register(business.clone()) {
            debug!(business = %identifier, "business already registered");
            return Ok(());
        }

        self.init_gate.wait().await;
        business.config.interceptor.initial_data().await;

        let transport = business.config.build_transport(false)?;
        business.config.interceptor.setup_transport(&transport, false);
        let _ = business.transport.set(transport);

        if business.config.mock_base_url.is_some() && cfg!(debug_assertions) {
            let mock = business.config.build_transport(true)?;
            business.config.interceptor.setup_transport(&mock, true);
            let _ = business.mock_transport.set(mock);
        }

        business.init_gate.open();
        info!(business = %identifier, "business registered");
        Ok(())
    }

    /// Non-blocking handoff. The same request is returned so the caller can
    /// await `request.completion` (and, after a cache hit, read
    /// `request.cache.last_response()` without waiting on the network).
    pub fn send(self: &Arc<Self>, request: Request) -> Request {
        if request.promise.enable && !request.body.is_replayable() {
            warn!(
                business = %request.business,
                path = %request.api_path,
                "rejecting request: streaming bodies cannot be enlisted for durable replay"
            );
            request.completion.complete(Response::from_error(ApiError::new(
                CODE_INVALID_REQUEST,
                "streaming bodies cannot be enlisted for durable replay",
            )));
            return request;
        }

        let manager = self.clone();
        let driven = request.clone();
        tokio::spawn(async move {
            manager.drive(driven).await;
        });
        request
    }

    /// Suspend the named businesses. Requests that have not yet passed the
    /// suspend gate will block unless their interceptor lets them through;
    /// in-flight requests are not recalled. Double-suspend is a no-op.
    pub fn suspend(&self, identifiers: &[&str]) {
        for identifier in identifiers {
            match self.registry.get(identifier) {
                Some(business) => {
                    if business.suspend() {
                        info!(business = %identifier, "business suspended");
                    }
                }
                None => warn!(business = %identifier, "cannot suspend unknown business"),
            }
        }
    }

    pub fn suspend_all(&self) {
        for business in self.registry.all() {
            if business.suspend() {
                info!(business = %business.config.identifier, "business suspended");
            }
        }
    }

    /// Resume the named businesses, releasing all gated requests atomically.
    /// Double-resume is a no-op.
    pub fn resume(&self, identifiers: &[&str]) {
        for identifier in identifiers {
            match self.registry.get(identifier) {
                Some(business) => {
                    if business.resume() {
                        info!(business = %identifier, "business resumed");
                    }
                }
                None => warn!(business = %identifier, "cannot resume unknown business"),
            }
        }
    }

    pub fn resume_all(&self) {
        for business in self.registry.all() {
            if business.resume() {
                info!(business = %business.config.identifier, "business resumed");
            }
        }
    }

    /// Clear the cache, clear the promise queue, then notify every
    /// business's interceptor.
    pub async fn clean_data(&self) {
        self.cache.clear().await;
        self.promises.clear().await;
        for business in self.registry.all() {
            business.config.interceptor.on_clean_data().await;
        }
        info!("cache and promise data cleared");
    }

    /// Pending durable-replay requests for a business, optionally filtered
    /// to a set of paths. Available once global init completes.
    pub async fn promise_requests(&self, business: &str, paths: &[String]) -> Vec<Request> {
        self.init_gate.wait().await;
        self.promises.business_requests(business, paths)
    }

    pub fn cache_store(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Close the backing stores. Outstanding driver tasks finish against
    /// closed pools; their store writes degrade to logged no-ops.
    pub async fn release(&self) {
        self.cache.release().await;
        self.promises.release().await;
        info!("manager released");
    }

    async fn drive(self: Arc<Self>, request: Request) {
        // Resolve the business; an unknown identifier completes immediately
        // and never retries.
        let Some(business) = self.registry.get(&request.business) else {
            warn!(business = %request.business, "request for unknown business");
            request
                .completion
                .complete(Response::from_error(ApiError::unknown_business(&request.business)));
            return;
        };
        let interceptor = business.config.interceptor.clone();
        let parser = business.config.parser.clone();

        business.init_gate.wait().await;
        if let Some(gate) = business.suspend_gate() {
            if interceptor.allow_request_pass_when_suspend(&request) {
                debug!(business = %request.business, path = %request.api_path, "request passes suspend gate");
            } else {
                debug!(business = %request.business, path = %request.api_path, "request held by suspend gate");
                gate.wait().await;
            }
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        loop {
            request.mark_started();
            interceptor.on_request(&request);

            // Durable-replay enlistment happens once; retries find the key
            // already assigned.
            if request.promise.enable && request.promise.key().is_none() {
                let key = derive_promise_key(&request);
                if request.promise.assign_key(key) {
                    if let Err(err) = self.promises.save(&request).await {
                        warn!(
                            business = %request.business,
                            path = %request.api_path,
                            error = %err,
                            "failed to persist replay enlistment"
                        );
                    }
                    interceptor.on_add_to_promise(&request);
                }
            }

            // Cache read. A hit is stashed on the request for synchronous
            // pickup; it never short-circuits the network call.
            if request.cache.enable && !request.cache.ignore_once {
                let key = request.ensure_cache_key();
                if let Some(data) = self.cache.load(&key, request.cache.use_lru).await {
                    interceptor.on_load_cache(&request, &data);
                    let mut stashed = Response::from_data(data.clone());
                    if let Some(converter) = &request.converter {
                        stashed.model = Some(converter(&data));
                    }
                    request.cache.stash_response(stashed);
                }
            }

            // Transport selection: debug builds route mock-enabled requests
            // through the mock transport when the business has one.
            let mock = if cfg!(debug_assertions) && request.mock.enable {
                business.mock_transport.get().cloned()
            } else {
                None
            };
            let (transport, path) = match mock {
                Some(transport) => (transport, request.mock.effective_path()),
                None => match business.transport.get().cloned() {
                    Some(transport) => (transport, request.effective_path()),
                    None => {
                        request.completion.complete(Response::from_error(ApiError::new(
                            CODE_INVALID_REQUEST,
                            format!("business '{}' has no transport", request.business),
                        )));
                        break;
                    }
                },
            };

            let options = TransportOptions {
                method: request.method,
                content_type: request.content_type,
                response_type: request.response_type,
                headers: request.headers.clone(),
                send_timeout: Some(request.send_timeout.unwrap_or(business.config.send_timeout)),
                recv_timeout: Some(request.recv_timeout.unwrap_or(business.config.recv_timeout)),
                on_send: request.on_send.clone(),
                on_recv: request.on_recv.clone(),
            };

            let raw_result = transport
                .send(&path, &request.body, &request.query, &options, &request.cancel)
                .await;

            let mut response = match &raw_result {
                Ok(raw) => match parser.handle_response(&request, raw).await {
                    Ok(response) => response,
                    Err(parse_error) => {
                        let fault = RequestFault::Parse(parse_error);
                        parser.handle_error(&request, Some(raw), &fault).await
                    }
                },
                Err(failure) => {
                    debug!(
                        business = %request.business,
                        path = %path,
                        kind = ?failure.kind,
                        "transport fault"
                    );
                    let fault = RequestFault::Transport(failure.clone());
                    parser.handle_error(&request, failure.raw.as_ref(), &fault).await
                }
            };
            if response.error.is_none() && response.model.is_none() {
                if let (Some(converter), Some(data)) = (&request.converter, &response.data) {
                    response.model = Some(converter(data));
                }
            }

            interceptor.on_response(&request, &response);
            let should_retry = match request.retry.policy {
                RetryPolicy::Never => false,
                RetryPolicy::Limit if request.retry.count() >= request.retry.max => false,
                _ => interceptor.need_retry(&request, &response),
            };
            if should_retry {
                let attempt = request.retry.record_retry();
                let delay = request.retry.interval.unwrap_or(business.config.retry_interval);
                debug!(
                    business = %request.business,
                    path = %request.api_path,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying request"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            // Cache write gate: enabled, key pinned, no error, payload
            // present.
            if request.cache.enable && response.error.is_none() {
                if let (Some(key), Some(data)) = (request.cache.key(), response.data.clone()) {
                    interceptor.on_save_cache(&request, &data);
                    self.cache
                        .save(&key, data, request.cache.duration, request.cache.use_lru)
                        .await;
                }
            }

            // A successful response settles the durable enlistment.
            if request.promise.enable && response.error.is_none() {
                if let Some(key) = request.promise.key() {
                    self.promises.delete(&request.business, &key).await;
                    interceptor.on_remove_from_promise(&request);
                }
            }

            if interceptor.intercept_complete(&request, &response) {
                debug!(
                    business = %request.business,
                    path = %request.api_path,
                    "completion intercepted"
                );
            } else if !request.completion.complete(response) {
                debug!(
                    business = %request.business,
                    path = %request.api_path,
                    "completion slot already written"
                );
            }
            break;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Promise keys are UUIDv5 names under the framework namespace; the random
/// component keeps distinct enlistments of the same path distinct.
fn derive_promise_key(request: &Request) -> String {
    let name = format!(
        "{}|{}|{}",
        request.business,
        request.effective_path(),
        Uuid::new_v4()
    );
    Uuid::new_v5(&PROMISE_KEY_NAMESPACE, name.as_bytes()).to_string()
}
