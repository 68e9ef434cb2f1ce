//! Response parsing contract.
//!
//! The parser is the sole authority mapping raw wire responses and
//! transport faults into the framework's [`Response`]/[`ApiError`] model.
//! Faults are never raised to callers; they always come back as an
//! error-bearing response.

use async_trait::async_trait;

use nl_common::{
    ApiError, Request, Response, ResponseType, CODE_CANCELLED, CODE_PARSE_ERROR,
    CODE_SERVER_BUSINESS_ERROR, CODE_TIMEOUT, CODE_TRANSPORT_FAILURE,
};

use crate::transport::{FailureKind, RawResponse, TransportFailure};

/// What went wrong before a parsed response existed: a transport fault, or
/// the parser's own rejection of the payload.
#[derive(Debug, Clone)]
pub enum RequestFault {
    Transport(TransportFailure),
    Parse(ApiError),
}

#[async_trait]
pub trait ResponseParser: Send + Sync {
    /// Judge a wire response. `Err` routes the request through
    /// [`ResponseParser::handle_error`] with a `Parse` fault.
    async fn handle_response(
        &self,
        request: &Request,
        raw: &RawResponse,
    ) -> Result<Response, ApiError>;

    /// Turn a fault into the response the caller will see. `raw` is
    /// whatever was observed on the wire, when anything was.
    async fn handle_error(
        &self,
        request: &Request,
        raw: Option<&RawResponse>,
        fault: &RequestFault,
    ) -> Response;
}

/// Baseline parser: HTTP 2xx is success carrying the decoded payload,
/// anything else is a server business error, and faults map onto the
/// framework error codes.
pub struct JsonParser;

#[async_trait]
impl ResponseParser for JsonParser {
    async fn handle_response(
        &self,
        request: &Request,
        raw: &RawResponse,
    ) -> Result<Response, ApiError> {
        if raw.is_http_success() {
            // A JSON response whose body did not decode is a parse failure,
            // not a success with an empty payload.
            if request.response_type == ResponseType::Json
                && raw.data.is_none()
                && raw.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            {
                return Err(ApiError {
                    code: CODE_PARSE_ERROR,
                    origin_message: raw.text.clone().unwrap_or_default(),
                    message: "response payload is not valid JSON".to_string(),
                    data: None,
                    origin: None,
                });
            }
            return Ok(Response {
                headers: raw.headers.clone(),
                data: raw.data.clone(),
                model: None,
                error: None,
            });
        }

        Err(ApiError {
            code: CODE_SERVER_BUSINESS_ERROR,
            origin_message: raw.text.clone().unwrap_or_default(),
            message: format!("server answered HTTP {}", raw.status),
            data: raw.data.clone(),
            origin: None,
        })
    }

    async fn handle_error(
        &self,
        _request: &Request,
        raw: Option<&RawResponse>,
        fault: &RequestFault,
    ) -> Response {
        let error = match fault {
            RequestFault::Parse(error) => error.clone(),
            RequestFault::Transport(failure) => {
                let code = match failure.kind {
                    FailureKind::Timeout => CODE_TIMEOUT,
                    FailureKind::Cancelled => CODE_CANCELLED,
                    FailureKind::Connection | FailureKind::Other => CODE_TRANSPORT_FAILURE,
                };
                ApiError {
                    code,
                    origin_message: failure.message.clone(),
                    message: failure.message.clone(),
                    data: raw.and_then(|r| r.data.clone()),
                    origin: Some(std::sync::Arc::new(failure.clone())),
                }
            }
        };

        Response {
            headers: raw.map(|r| r.headers.clone()).unwrap_or_default(),
            data: None,
            model: None,
            error: Some(error),
        }
    }
}
