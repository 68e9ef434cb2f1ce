//! netline client framework: multiplexes independent business lines over one
//! HTTP orchestration layer, adding bounded/unbounded retry, a two-tier
//! persistent response cache, durable request replay across process
//! restarts, and per-business suspend/resume with selective pass-through.
//!
//! Callers register a [`BusinessConfig`] per API surface, then hand
//! [`Request`]s to the [`ApiManager`] and await each request's completion
//! slot. Application concerns plug in through the [`Interceptor`] and
//! [`ResponseParser`] traits.

pub mod business;
pub mod interceptor;
pub mod json_worker;
pub mod manager;
pub mod parser;
pub mod transport;

pub use business::{BusinessConfig, TransportFactory};
pub use interceptor::{DefaultInterceptor, Interceptor};
pub use json_worker::JsonWorker;
pub use manager::{ApiManager, ManagerConfig};
pub use parser::{JsonParser, RequestFault, ResponseParser};
pub use transport::{
    FailureKind, HttpTransport, RawResponse, Transport, TransportFailure, TransportOptions,
};

// The value types live in nl-common; re-export the whole surface so most
// applications depend on this crate alone.
pub use nl_common::*;
pub use nl_store::{CacheEntry, CacheStore, LruMap, PromiseStore};
