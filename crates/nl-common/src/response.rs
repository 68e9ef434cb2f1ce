//! Outcome types handed back to callers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Code assigned when a request names a business that was never registered.
pub const CODE_UNKNOWN_BUSINESS: i32 = -999999;
/// A request configuration the framework cannot honor, such as durable
/// replay requested for a streaming body.
pub const CODE_INVALID_REQUEST: i32 = -999998;
/// Connection, TLS, DNS, or I/O failure below the HTTP layer.
pub const CODE_TRANSPORT_FAILURE: i32 = -1;
/// Send or receive exceeded its budget.
pub const CODE_TIMEOUT: i32 = -2;
/// The request's cancel token fired.
pub const CODE_CANCELLED: i32 = -3;
/// The parser could not make sense of the payload.
pub const CODE_PARSE_ERROR: i32 = -4;
/// HTTP-level success, but the payload reports a business failure.
pub const CODE_SERVER_BUSINESS_ERROR: i32 = -5;

/// Error payload carried by a [`Response`]. `origin_message` keeps the raw
/// lower-layer text; `message` is the user-facing form a parser chooses.
#[derive(Clone, Default)]
pub struct ApiError {
    pub code: i32,
    pub origin_message: String,
    pub message: String,
    pub data: Option<Value>,
    /// The underlying error, when one exists (transport fault, serde error).
    pub origin: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            origin_message: message.clone(),
            message,
            data: None,
            origin: None,
        }
    }

    pub fn unknown_business(identifier: &str) -> Self {
        Self::new(
            CODE_UNKNOWN_BUSINESS,
            format!("no business registered for identifier '{identifier}'"),
        )
    }

    pub fn with_origin(mut self, origin: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.origin_message = origin.to_string();
        self.origin = Some(origin);
        self
    }
}

impl fmt::Debug for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("origin_message", &self.origin_message)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Final outcome of one request. Success iff `error` is `None`.
///
/// `model` is the caller-defined projection produced by the request's
/// converter; it is type-erased so the framework stays schema-agnostic.
/// Retrieve it with [`Response::model_as`].
#[derive(Clone, Default)]
pub struct Response {
    pub headers: HashMap<String, Vec<String>>,
    pub data: Option<Value>,
    pub model: Option<Arc<dyn Any + Send + Sync>>,
    pub error: Option<ApiError>,
}

impl Response {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_error(error: ApiError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Downcast the converted model to the caller's concrete type.
    pub fn model_as<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.model.clone().and_then(|m| m.downcast::<T>().ok())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("headers", &self.headers)
            .field("data", &self.data)
            .field("model", &self.model.as_ref().map(|_| "<model>"))
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_iff_no_error() {
        assert!(Response::from_data(serde_json::json!({"ok": true})).is_success());
        assert!(!Response::from_error(ApiError::new(CODE_TIMEOUT, "late")).is_success());
    }

    #[test]
    fn model_downcast_round_trip() {
        #[derive(PartialEq, Debug)]
        struct User {
            id: u64,
        }

        let mut response = Response::from_data(serde_json::json!({"id": 7}));
        response.model = Some(Arc::new(User { id: 7 }));

        assert_eq!(response.model_as::<User>().unwrap().id, 7);
        assert!(response.model_as::<String>().is_none());
    }

    #[test]
    fn unknown_business_code() {
        let err = ApiError::unknown_business("ghost");
        assert_eq!(err.code, CODE_UNKNOWN_BUSINESS);
        assert!(err.message.contains("ghost"));
    }
}
