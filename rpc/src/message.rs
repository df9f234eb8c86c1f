//! JSON-RPC message shapes.
//!
//! Incoming values are classified by [`Incoming::classify`]; outgoing
//! messages are serde structs whose field order fixes the key order on the
//! wire.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtocolError, ResponseError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier of an incoming request, echoed back in its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

/// A decoded message, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests. `id` is kept raw so that a bad ID can
    /// be reported as-is.
    Response {
        id: Value,
        outcome: Result<Value, ResponseError>,
    },
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// A value that is not a valid message. `id` is set when the peer still
/// deserves an error response.
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    pub id: Option<RequestId>,
    pub error: ProtocolError,
}

impl Incoming {
    /// Classifies a decoded frame.
    ///
    /// `result`/`error` take precedence over `method`; `result` takes
    /// precedence over `error`. Missing `params` become `null`.
    pub fn classify(value: Value) -> Result<Self, Malformed> {
        let Value::Object(mut obj) = value else {
            return Err(Malformed {
                id: None,
                error: ProtocolError::NotAnObject,
            });
        };

        if obj.contains_key("result") || obj.contains_key("error") {
            let id = obj.remove("id").unwrap_or(Value::Null);
            let outcome = match obj.remove("result") {
                Some(result) => Ok(result),
                None => Err(ResponseError::from_wire(
                    obj.get("error").unwrap_or(&Value::Null),
                )),
            };
            return Ok(Self::Response { id, outcome });
        }

        let id = match obj.get("id") {
            None => None,
            Some(raw) => match RequestId::from_value(raw) {
                Some(id) => Some(id),
                None => {
                    return Err(Malformed {
                        id: None,
                        error: ProtocolError::InvalidId,
                    });
                }
            },
        };

        let method = match obj.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => {
                return Err(Malformed {
                    id,
                    error: ProtocolError::MethodNotString,
                });
            }
            None => {
                return Err(Malformed {
                    id,
                    error: ProtocolError::Unclassifiable,
                });
            }
        };
        let params = take_params(&mut obj);

        Ok(match id {
            Some(id) => Self::Request { id, method, params },
            None => Self::Notification { method, params },
        })
    }
}

fn take_params(obj: &mut Map<String, Value>) -> Value {
    obj.remove("params").unwrap_or(Value::Null)
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingRequest<'a> {
    pub id: u64,
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> OutgoingRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct OutgoingNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> OutgoingNotification<'a> {
    pub fn new(method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// Exactly one of `result` / `error` is set. A `null` result is kept as
/// `Some(Value::Null)` so it still serializes as `"result":null`.
#[derive(Debug, Serialize)]
pub(crate) struct OutgoingResponse {
    pub id: RequestId,
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl OutgoingResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: ResponseError) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION,
            result: None,
            error: Some(error),
        }
    }
}
