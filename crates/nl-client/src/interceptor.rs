//! Per-business lifecycle hooks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use nl_common::{Request, Response};

use crate::transport::Transport;

/// Capability bundle a business supplies to observe and steer the request
/// lifecycle. Every hook has a default, so implementations override only
/// what they need. `initial_data` and `on_clean_data` may suspend; the rest
/// run inline on the driver task.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// One-shot hook during business registration, before the transport is
    /// constructed. Token bootstrap and similar setup belong here.
    async fn initial_data(&self) {}

    /// Post-construction hook for each transport the business gets.
    fn setup_transport(&self, _transport: &Arc<dyn Transport>, _is_mock: bool) {}

    /// While the business is suspended, a `true` return lets this request
    /// bypass the gate.
    fn allow_request_pass_when_suspend(&self, _request: &Request) -> bool {
        false
    }

    fn on_request(&self, _request: &Request) {}

    fn on_add_to_promise(&self, _request: &Request) {}

    fn on_load_cache(&self, _request: &Request, _data: &Value) {}

    fn on_response(&self, _request: &Request, _response: &Response) {}

    fn on_save_cache(&self, _request: &Request, _data: &Value) {}

    fn on_remove_from_promise(&self, _request: &Request) {}

    /// Retry is a policy decision on the parsed response; the orchestrator
    /// only consults this once the configured bounds allow another attempt.
    fn need_retry(&self, _request: &Request, _response: &Response) -> bool {
        false
    }

    /// Return `true` to take ownership of completion (token-refresh flows).
    /// The orchestrator then leaves the completion slot untouched.
    fn intercept_complete(&self, _request: &Request, _response: &Response) -> bool {
        false
    }

    async fn on_clean_data(&self) {}
}

/// Interceptor that accepts every default.
pub struct DefaultInterceptor;

impl Interceptor for DefaultInterceptor {}
