//! Error taxonomy for the framing layer, the router and the request facade.
//!
//! Framing and parse failures ([`FrameError`]) leave the byte stream
//! misaligned and end the connection. Everything else is scoped to a single
//! message or a single outstanding request.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Numeric error codes used in error responses.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A handler failed without naming a code of its own.
    pub const HANDLER_FAILED: i64 = -1;
}

/// Placeholder used when a remote error object carries no `message`.
pub const MISSING_ERROR_MESSAGE: &str = "No message attached to error";

/// Connection-fatal failure of the framing layer.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("missing or zero Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("header block exceeds {max} bytes")]
    HeaderTooLarge { max: usize },
    #[error("header block is not valid UTF-8")]
    InvalidHeader,
    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,
    #[error("frame body is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("serializing frame body: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A message that could not be classified as request, notification or
/// response.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("'method' must be a string")]
    MethodNotString,
    #[error("'id' must be an integer or a string")]
    InvalidId,
    #[error("message has neither 'method' nor 'result'/'error'")]
    Unclassifiable,
}

/// The `error` member of an error response.
///
/// Handlers return it (wrapped in `anyhow::Error`) to choose the code the
/// peer sees; any other handler error is reported with
/// [`codes::HANDLER_FAILED`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(reason: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {reason}"))
    }

    pub fn invalid_request(reason: impl fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {reason}"))
    }

    /// Converts a failed handler into the error object sent to the peer.
    pub fn from_handler_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ResponseError>() {
            Some(response) => response.clone(),
            None => Self::new(codes::HANDLER_FAILED, format!("{err:#}")),
        }
    }

    /// Reads an error object leniently: a missing or non-integer `code`
    /// becomes -1, a missing `message` becomes a placeholder.
    pub(crate) fn from_wire(value: &Value) -> Self {
        let code = value
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(codes::HANDLER_FAILED);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(MISSING_ERROR_MESSAGE)
            .to_string();
        Self {
            code,
            message,
            data: value.get("data").cloned(),
        }
    }
}

/// Failure of an RPC operation or of the connection as a whole.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The peer answered the request with an error response.
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// A response referenced an ID with no outstanding request.
    #[error("response for unknown request id {0}")]
    UnknownRequestId(Value),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: u64, after: Duration },
    #[error("serializing params: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("deserializing result: {0}")]
    Deserialize(#[source] serde_json::Error),
}

impl RpcError {
    /// Returns the remote error code, if this is a remote error.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error terminated the connection rather than one request.
    ///
    /// Encoding an outgoing message only fails that one send.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Frame(FrameError::Serialize(_))
            | Self::Remote { .. }
            | Self::Timeout { .. }
            | Self::Serialize(_)
            | Self::Deserialize(_) => false,
            Self::Frame(_) | Self::UnknownRequestId(_) | Self::ConnectionClosed => true,
        }
    }
}

impl From<ResponseError> for RpcError {
    fn from(err: ResponseError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire_defaults() {
        let err = ResponseError::from_wire(&serde_json::json!({}));
        assert_eq!(err.code, -1);
        assert_eq!(err.message, MISSING_ERROR_MESSAGE);
        assert!(err.data.is_none());

        let err = ResponseError::from_wire(&serde_json::json!({"code": "x", "message": 3}));
        assert_eq!(err.code, -1);
        assert_eq!(err.message, MISSING_ERROR_MESSAGE);
    }

    #[test]
    fn test_from_wire_keeps_fields() {
        let err = ResponseError::from_wire(&serde_json::json!({
            "code": -32601,
            "message": "Method not found: foo",
            "data": [1, 2]
        }));
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        assert_eq!(err.message, "Method not found: foo");
        assert_eq!(err.data, Some(serde_json::json!([1, 2])));
    }

    #[test]
    fn test_handler_error_keeps_explicit_code() {
        let err = anyhow::Error::new(ResponseError::method_not_found("foo"));
        let response = ResponseError::from_handler_error(&err);
        assert_eq!(response.code, codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_handler_error_defaults_to_minus_one() {
        let err = anyhow::anyhow!("disk on fire");
        let response = ResponseError::from_handler_error(&err);
        assert_eq!(response.code, codes::HANDLER_FAILED);
        assert_eq!(response.message, "disk on fire");
    }

    #[test]
    fn test_error_object_serialization_order() {
        let err = ResponseError::new(-1, "boom");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"code":-1,"message":"boom"}"#
        );
    }

    #[test]
    fn test_remote_conversion() {
        let rpc: RpcError = ResponseError::new(7, "nope").into();
        assert_eq!(rpc.code(), Some(7));
        assert!(!rpc.is_connection_fatal());
    }

    #[test]
    fn test_encoding_failure_is_not_connection_fatal() {
        let source = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(!RpcError::Frame(FrameError::Serialize(source)).is_connection_fatal());

        let source = serde_json::from_str::<Value>("{").unwrap_err();
        assert!(RpcError::Frame(FrameError::Parse(source)).is_connection_fatal());
        assert!(RpcError::Frame(FrameError::UnexpectedEof).is_connection_fatal());
        assert!(RpcError::ConnectionClosed.is_connection_fatal());
    }
}
