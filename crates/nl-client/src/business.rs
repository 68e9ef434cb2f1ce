//! Business line configuration and per-business runtime state.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use nl_common::{Gate, NetlineError, Result};

use crate::interceptor::Interceptor;
use crate::parser::ResponseParser;
use crate::transport::{HttpTransport, Transport};

/// Builds the transport for a business. The default constructs an
/// [`HttpTransport`]; tests and embedders inject their own.
pub type TransportFactory =
    Arc<dyn Fn(&BusinessConfig, bool) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Static configuration of one business line: where it lives, who observes
/// its lifecycle, who parses its payloads, and its fallback budgets.
#[derive(Clone)]
pub struct BusinessConfig {
    pub identifier: String,
    pub base_url: String,
    pub mock_base_url: Option<String>,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    /// Delay between retry attempts when the request carries none.
    pub retry_interval: Duration,
    pub interceptor: Arc<dyn Interceptor>,
    pub parser: Arc<dyn ResponseParser>,
    pub transport_factory: Option<TransportFactory>,
}

impl BusinessConfig {
    pub fn new(
        identifier: impl Into<String>,
        base_url: impl Into<String>,
        interceptor: Arc<dyn Interceptor>,
        parser: Arc<dyn ResponseParser>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            base_url: base_url.into(),
            mock_base_url: None,
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(30),
            recv_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            interceptor,
            parser,
            transport_factory: None,
        }
    }

    pub fn with_mock_base_url(mut self, url: impl Into<String>) -> Self {
        self.mock_base_url = Some(url.into());
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub(crate) fn build_transport(&self, is_mock: bool) -> Result<Arc<dyn Transport>> {
        if let Some(factory) = &self.transport_factory {
            return factory(self, is_mock);
        }

        let base_url = if is_mock {
            self.mock_base_url.as_deref().unwrap_or(&self.base_url)
        } else {
            &self.base_url
        };
        let transport = HttpTransport::new(base_url, self.connect_timeout, self.recv_timeout)
            .map_err(|error| NetlineError::Transport(error.to_string()))?;
        Ok(Arc::new(transport))
    }
}

impl fmt::Debug for BusinessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusinessConfig")
            .field("identifier", &self.identifier)
            .field("base_url", &self.base_url)
            .field("mock_base_url", &self.mock_base_url)
            .field("connect_timeout", &self.connect_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("recv_timeout", &self.recv_timeout)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// Runtime record for a registered business. After the init gate opens the
/// transports are set and immutable.
pub(crate) struct Business {
    pub config: BusinessConfig,
    pub init_gate: Gate,
    pub transport: OnceLock<Arc<dyn Transport>>,
    pub mock_transport: OnceLock<Arc<dyn Transport>>,
    /// `Some` while suspended. Each suspend cycle installs a fresh gate so a
    /// resume drains exactly the waiters of its own cycle.
    suspend: Mutex<Option<Gate>>,
}

impl Business {
    pub fn new(config: BusinessConfig) -> Self {
        Self {
            config,
            init_gate: Gate::new(),
            transport: OnceLock::new(),
            mock_transport: OnceLock::new(),
            suspend: Mutex::new(None),
        }
    }

    pub fn suspend_gate(&self) -> Option<Gate> {
        self.suspend.lock().clone()
    }

    /// Returns `false` when already suspended (double-suspend is a no-op).
    pub fn suspend(&self) -> bool {
        let mut slot = self.suspend.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Gate::new());
        true
    }

    /// Returns `false` when not suspended (double-resume is a no-op).
    pub fn resume(&self) -> bool {
        let gate = self.suspend.lock().take();
        match gate {
            Some(gate) => {
                gate.open();
                true
            }
            None => false,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.lock().is_some()
    }
}

/// Identifier-keyed registry of businesses.
pub(crate) struct BusinessRegistry {
    businesses: DashMap<String, Arc<Business>>,
}

impl BusinessRegistry {
    pub fn new() -> Self {
        Self {
            businesses: DashMap::new(),
        }
    }

    /// Returns `false` when the identifier was already registered.
    pub fn register(&self, business: Arc<Business>) -> bool {
        let identifier = business.config.identifier.clone();
        match self.businesses.entry(identifier) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(business);
                true
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<Business>> {
        self.businesses.get(identifier).map(|b| b.value().clone())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.businesses.contains_key(identifier)
    }

    pub fn all(&self) -> Vec<Arc<Business>> {
        self.businesses.iter().map(|b| b.value().clone()).collect()
    }
}
