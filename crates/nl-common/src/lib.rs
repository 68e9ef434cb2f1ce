//! Shared value types for the netline client framework: the request object
//! and its configuration blocks, response/error types, and the small
//! synchronization primitives (completion slot, gate) the orchestrator and
//! callers share.

pub mod completion;
pub mod error;
pub mod gate;
pub mod request;
pub mod response;

pub use completion::CompletionSlot;
pub use error::{NetlineError, Result};
pub use gate::Gate;
pub use request::{
    Body, CacheSettings, ContentType, HttpMethod, MockSettings, ModelConverter, ProgressCallback,
    PromiseSettings, Request, ResponseType, RetryConfig, RetryPolicy,
};
pub use response::{
    ApiError, Response, CODE_CANCELLED, CODE_INVALID_REQUEST, CODE_PARSE_ERROR,
    CODE_SERVER_BUSINESS_ERROR, CODE_TIMEOUT, CODE_TRANSPORT_FAILURE, CODE_UNKNOWN_BUSINESS,
};

// Cancellation is tokio-util's token; re-exported so callers and transports
// agree on the type without importing tokio-util themselves.
pub use tokio_util::sync::CancellationToken;
